//! Test doubles shared by the unit tests.

use std::io::{ self, Cursor, Read };
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::thread;
use std::time::{ Duration, Instant };

use crate::backend::{ MediaBackend, PcmPipe };
use crate::config::PcmFormat;
use crate::decoder::DecoderError;


/// Backend producing a deterministic ramp instead of running a decoder.
///
/// Channel 0 of frame `f` holds `f % 32768`, channel 1 its negation, so a
/// test can tell exactly which frame a sample came from.
#[derive( Clone )]
pub struct SyntheticBackend {
    duration: f64,
    /// Length actually decoded, which real decoders let drift from the report
    decoded: f64,
    missing: bool,
    spawns: Arc<AtomicUsize>,
    terminations: Arc<AtomicUsize>,
}


impl SyntheticBackend {
    /// `duration` must be a whole number of centiseconds.
    pub fn new( duration: f64 ) -> Self {
        Self {
            duration,
            decoded: duration,
            missing: false,
            spawns: Arc::new( AtomicUsize::new( 0 ) ),
            terminations: Arc::new( AtomicUsize::new( 0 ) ),
        }
    }


    /// Decodes `decoded` seconds while still reporting the original duration.
    pub fn decoding( mut self, decoded: f64 ) -> Self {
        self.decoded = decoded;
        self
    }


    /// Reports every file as absent.
    pub fn missing( mut self ) -> Self {
        self.missing = true;
        self
    }


    pub fn sample( frame: u64, channel: usize ) -> i16 {
        let value = ( frame % 32768 ) as i16;
        if channel % 2 == 0 { value } else { value.wrapping_neg() }
    }


    pub fn spawn_count( &self ) -> usize {
        self.spawns.load( Ordering::SeqCst )
    }


    pub fn terminate_count( &self ) -> usize {
        self.terminations.load( Ordering::SeqCst )
    }


    fn encode( value: i16, byte_width: u8, out: &mut Vec<u8> ) {
        match byte_width {
            1 => out.push( ( ( value >> 8 ) as i32 + 128 ) as u8 ),
            4 => out.extend_from_slice( &( ( value as i32 ) << 16 ).to_le_bytes() ),
            _ => out.extend_from_slice( &value.to_le_bytes() ),
        }
    }
}


impl MediaBackend for SyntheticBackend {
    fn report( &self, path: &Path ) -> Result<String, DecoderError> {
        if self.missing {
            return Ok( format!( "{}: No such file or directory", path.display() ) );
        }

        let centis = ( self.duration * 100.0 ).round() as u64;
        let secs = centis / 100;
        Ok( format!(
            "Input #0, wav, from '{}':\n  Duration: {:02}:{:02}:{:02}.{:02}, bitrate: 1411 kb/s\n    Stream #0:0: Audio: pcm_s16le, 44100 Hz, stereo, s16, 1411 kb/s\nAt least one output file must be specified",
            path.display(),
            secs / 3600,
            ( secs / 60 ) % 60,
            secs % 60,
            centis % 100,
        ))
    }


    fn spawn( &self, _path: &Path, start: f64, format: &PcmFormat ) -> Result<Box<dyn PcmPipe>, DecoderError> {
        self.spawns.fetch_add( 1, Ordering::SeqCst );

        let rate = format.sample_rate as f64;
        let first = ( start * rate ).round() as u64;
        let total = ( self.decoded * rate ).round() as u64;

        let mut data = Vec::new();
        for frame in first..total {
            for channel in 0..format.channels as usize {
                Self::encode( Self::sample( frame, channel ), format.byte_width, &mut data );
            }
        }

        Ok( Box::new( SyntheticPipe {
            data: Cursor::new( data ),
            terminations: Arc::clone( &self.terminations ),
            terminated: false,
        }))
    }
}


struct SyntheticPipe {
    data: Cursor<Vec<u8>>,
    terminations: Arc<AtomicUsize>,
    terminated: bool,
}


impl Read for SyntheticPipe {
    fn read( &mut self, buf: &mut [u8] ) -> io::Result<usize> {
        if self.terminated {
            return Ok( 0 );
        }
        self.data.read( buf )
    }
}


impl PcmPipe for SyntheticPipe {
    fn terminate( &mut self ) {
        if !self.terminated {
            self.terminated = true;
            self.terminations.fetch_add( 1, Ordering::SeqCst );
        }
    }
}


/// Polls `condition` for up to five seconds.
pub fn wait_for( mut condition: impl FnMut() -> bool ) -> bool {
    let deadline = Instant::now() + Duration::from_secs( 5 );
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep( Duration::from_millis( 1 ) );
    }
    false
}
