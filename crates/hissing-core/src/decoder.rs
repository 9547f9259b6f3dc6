//! Decode sessions over an external decoder
//!
//! A session owns one running decoder and a cursor counting the frames read
//! from it. Reads block on the decoder's output. Seeking forward a short way
//! reads and discards; seeking backward or very far ahead restarts the
//! decoder at the target time.

use std::io::{ self, Read };
use std::path::{ Path, PathBuf };
use std::sync::Arc;

use thiserror::Error;

use crate::backend::{ MediaBackend, PcmPipe };
use crate::config::{ DecoderConfig, PcmFormat };
use crate::probe::{ self, MediaStreamInfo };


/// Forward seeks further than this restart the decoder instead of skipping.
pub const SEEK_SKIP_LIMIT: u64 = 1_000_000;


/// Errors that can occur while probing or decoding.
#[derive( Debug, Error )]
pub enum DecoderError {
    #[error( "File not found: {0}" )]
    NotFound( PathBuf ),

    #[error( "Failed to read the {field} of {path}; decoder report:\n{report}" )]
    Probe {
        field: &'static str,
        path: PathBuf,
        report: String,
    },

    #[error( "Failed to run decoder {program}: {source}" )]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error( "Decoder read error: {0}" )]
    Io( #[from] io::Error ),

    #[error( "Decode session is closed" )]
    Closed,
}


/// One running decoder plus its read cursor.
pub struct DecodeSession {
    path: PathBuf,
    backend: Arc<dyn MediaBackend>,
    info: MediaStreamInfo,
    format: PcmFormat,
    pipe: Option<Box<dyn PcmPipe>>,
    /// Index of the next frame the pipe will yield
    cursor: u64,
    /// Set once a read came back short
    eof: bool,
}


impl DecodeSession {
    /// Probes `path` and starts decoding from the beginning.
    pub fn open(
        path: &Path,
        config: &DecoderConfig,
        backend: Arc<dyn MediaBackend>,
    ) -> Result<Self, DecoderError> {
        let report = backend.report( path )?;
        let info = probe::parse_report( &report, path, config.rate_source, config.format )?;

        tracing::info!(
            "Probed {:?}: {:.2}s, decoding at {} Hz, {} channels, {} frames",
            path,
            info.duration,
            config.format.sample_rate,
            config.format.channels,
            info.frame_count
        );

        let mut session = Self {
            path: path.to_path_buf(),
            backend,
            info,
            format: config.format,
            pipe: None,
            cursor: 0,
            eof: false,
        };
        session.restart( 0.0 )?;
        Ok( session )
    }


    /// Replaces the decoder with a new one starting at `start` seconds.
    pub fn restart( &mut self, start: f64 ) -> Result<(), DecoderError> {
        self.close();

        let start = start.max( 0.0 );
        self.pipe = Some( self.backend.spawn( &self.path, start, &self.format )? );
        self.cursor = ( self.format.sample_rate as f64 * start ).round() as u64;
        self.eof = false;

        tracing::debug!( "Decoder started at {:.3}s (frame {})", start, self.cursor );
        Ok(())
    }


    /// Reads up to `frames` frames into `sink`, returning the frames delivered.
    fn pull( &mut self, frames: usize, sink: &mut dyn io::Write ) -> Result<u64, DecoderError> {
        let pipe = self.pipe.as_mut().ok_or( DecoderError::Closed )?;

        // Never move past the probed end
        let limit = ( self.info.frame_count + 1 ).saturating_sub( self.cursor );
        let wanted = ( frames as u64 ).min( limit );
        let frame_bytes = self.format.frame_bytes() as u64;

        let mut reader = io::Read::take( pipe.as_mut(), wanted * frame_bytes );
        let bytes = io::copy( &mut reader, sink )?;

        let got = bytes / frame_bytes;
        if got < frames as u64 {
            self.eof = true;
        }
        self.cursor += got;
        Ok( got )
    }


    /// Blocking read of `frames` frames of interleaved PCM.
    ///
    /// The result is shorter than requested only at the end of the stream.
    pub fn read_chunk( &mut self, frames: usize ) -> Result<Vec<u8>, DecoderError> {
        let mut data = Vec::with_capacity( frames * self.format.frame_bytes() );
        let got = self.pull( frames, &mut data )?;
        // Drop a trailing partial frame
        data.truncate( got as usize * self.format.frame_bytes() );
        Ok( data )
    }


    /// Reads and discards `frames` frames.
    pub fn skip_chunk( &mut self, frames: usize ) -> Result<(), DecoderError> {
        self.pull( frames, &mut io::sink() )?;
        Ok(())
    }


    /// Moves the cursor to `target`.
    ///
    /// Short forward moves skip in place; backward or far-forward moves
    /// restart the decoder at the target time.
    pub fn seek( &mut self, target: u64 ) -> Result<(), DecoderError> {
        let target = target.min( self.info.frame_count );

        if target < self.cursor || target > self.cursor + SEEK_SKIP_LIMIT {
            let start = target as f64 / self.format.sample_rate as f64;
            self.restart( start )?;
            self.cursor = target;
        } else if target > self.cursor {
            // A stream ending early leaves the cursor where the data ran out
            self.skip_chunk( ( target - self.cursor ) as usize )?;
        }
        Ok(())
    }


    /// Terminates the decoder. Safe to call repeatedly.
    pub fn close( &mut self ) {
        if let Some( mut pipe ) = self.pipe.take() {
            pipe.terminate();
        }
    }


    /// True once the decoder has nothing more to give.
    pub fn is_exhausted( &self ) -> bool {
        self.eof || self.cursor >= self.info.frame_count
    }


    pub fn is_open( &self ) -> bool {
        self.pipe.is_some()
    }


    pub fn cursor( &self ) -> u64 {
        self.cursor
    }


    pub fn info( &self ) -> &MediaStreamInfo {
        &self.info
    }


    pub fn format( &self ) -> PcmFormat {
        self.format
    }


    pub fn path( &self ) -> &Path {
        &self.path
    }
}


impl Drop for DecodeSession {
    fn drop( &mut self ) {
        self.close();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::testing::SyntheticBackend;


    fn open( backend: &SyntheticBackend, format: PcmFormat ) -> DecodeSession {
        let config = DecoderConfig { format, ..DecoderConfig::default() };
        DecodeSession::open( Path::new( "tone.wav" ), &config, Arc::new( backend.clone() ) ).unwrap()
    }


    fn mono( rate: u32 ) -> PcmFormat {
        PcmFormat { sample_rate: rate, channels: 1, byte_width: 2 }
    }


    #[test]
    fn test_read_chunk_exact_then_short_at_end() {
        let backend = SyntheticBackend::new( 1.0 );
        let mut session = open( &backend, mono( 1000 ) );
        assert_eq!( session.info().frame_count, 1001 );

        let chunk = session.read_chunk( 400 ).unwrap();
        assert_eq!( chunk.len(), 400 * 2 );
        assert_eq!( session.cursor(), 400 );
        assert!( !session.is_exhausted() );

        session.read_chunk( 400 ).unwrap();
        let tail = session.read_chunk( 400 ).unwrap();
        assert_eq!( tail.len(), 200 * 2 );
        assert!( session.is_exhausted() );
        assert_eq!( session.cursor(), 1000 );
    }


    #[test]
    fn test_stereo_chunk_size() {
        let backend = SyntheticBackend::new( 2.0 );
        let format = PcmFormat { sample_rate: 8000, channels: 2, byte_width: 2 };
        let mut session = open( &backend, format );

        let chunk = session.read_chunk( 1024 ).unwrap();
        assert_eq!( chunk.len(), 2 * 1024 * 2 );
    }


    #[test]
    fn test_chunks_follow_decode_order() {
        let backend = SyntheticBackend::new( 1.0 );
        let mut session = open( &backend, mono( 1000 ) );

        session.read_chunk( 10 ).unwrap();
        let chunk = session.read_chunk( 1 ).unwrap();
        assert_eq!( i16::from_le_bytes([ chunk[ 0 ], chunk[ 1 ] ]), SyntheticBackend::sample( 10, 0 ) );
    }


    #[test]
    fn test_short_forward_seek_skips_in_place() {
        let backend = SyntheticBackend::new( 2.0 );
        let mut session = open( &backend, mono( 1000 ) );
        assert_eq!( backend.spawn_count(), 1 );

        session.seek( 500 ).unwrap();
        assert_eq!( session.cursor(), 500 );
        assert_eq!( backend.spawn_count(), 1 );

        let chunk = session.read_chunk( 1 ).unwrap();
        assert_eq!( i16::from_le_bytes([ chunk[ 0 ], chunk[ 1 ] ]), SyntheticBackend::sample( 500, 0 ) );
    }


    #[test]
    fn test_backward_seek_restarts_decoder() {
        let backend = SyntheticBackend::new( 2.0 );
        let mut session = open( &backend, mono( 1000 ) );

        session.read_chunk( 800 ).unwrap();
        session.seek( 250 ).unwrap();
        assert_eq!( backend.spawn_count(), 2 );
        assert_eq!( backend.terminate_count(), 1 );
        assert_eq!( session.cursor(), 250 );

        let chunk = session.read_chunk( 1 ).unwrap();
        assert_eq!( i16::from_le_bytes([ chunk[ 0 ], chunk[ 1 ] ]), SyntheticBackend::sample( 250, 0 ) );
    }


    #[test]
    fn test_far_forward_seek_restarts_decoder() {
        let backend = SyntheticBackend::new( 30.0 );
        let mut session = open( &backend, mono( 44100 ) );

        session.seek( SEEK_SKIP_LIMIT + 10 ).unwrap();
        assert_eq!( backend.spawn_count(), 2 );
        assert_eq!( session.cursor(), SEEK_SKIP_LIMIT + 10 );
    }


    #[test]
    fn test_seek_twice_is_idempotent() {
        let backend = SyntheticBackend::new( 2.0 );
        let mut session = open( &backend, mono( 1000 ) );

        session.seek( 300 ).unwrap();
        let spawns = backend.spawn_count();
        session.seek( 300 ).unwrap();
        assert_eq!( session.cursor(), 300 );
        assert_eq!( backend.spawn_count(), spawns );
    }


    #[test]
    fn test_cursor_never_passes_frame_count() {
        let backend = SyntheticBackend::new( 1.0 );
        let mut session = open( &backend, mono( 1000 ) );

        session.seek( 50_000 ).unwrap();
        assert!( session.cursor() <= session.info().frame_count );
        assert!( session.is_exhausted() );
    }


    #[test]
    fn test_seek_past_decoded_end_keeps_delivered_cursor() {
        let backend = SyntheticBackend::new( 1.0 ).decoding( 0.5 );
        let mut session = open( &backend, mono( 1000 ) );

        session.seek( 800 ).unwrap();
        assert_eq!( session.cursor(), 500 );
        assert!( session.is_exhausted() );
        assert!( session.read_chunk( 10 ).unwrap().is_empty() );

        // A later seek back still lands exactly
        session.seek( 100 ).unwrap();
        assert_eq!( session.cursor(), 100 );
        assert!( !session.is_exhausted() );
    }


    #[test]
    fn test_close_is_idempotent() {
        let backend = SyntheticBackend::new( 1.0 );
        let mut session = open( &backend, mono( 1000 ) );

        session.close();
        session.close();
        assert!( !session.is_open() );
        assert_eq!( backend.terminate_count(), 1 );
        assert!( matches!( session.read_chunk( 10 ), Err( DecoderError::Closed ) ) );
    }


    #[test]
    fn test_open_missing_file() {
        let backend = SyntheticBackend::new( 1.0 ).missing();
        let config = DecoderConfig::default();
        let result = DecodeSession::open( Path::new( "gone.mp3" ), &config, Arc::new( backend ) );
        assert!( matches!( result, Err( DecoderError::NotFound( _ ) ) ) );
    }
}
