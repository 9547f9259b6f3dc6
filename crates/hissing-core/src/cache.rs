//! Random access to decoded samples
//!
//! `FrameCache` keeps a window of decoded frames around the most recent
//! lookup. Sequential scans slide the window forward and only decode the
//! frames that are new; jumps elsewhere seek the session and refill.
//! This is for arbitrary-time sampling, not realtime playback.

use crate::decoder::{ DecodeSession, DecoderError };


/// Converts raw PCM bytes of the given sample width to normalised floats.
pub fn pcm_to_f32( data: &[u8], byte_width: u8 ) -> Vec<f32> {
    match byte_width {
        1 => data.iter().map( |&b| ( b as f32 - 128.0 ) / 128.0 ).collect(),
        4 => data
            .chunks_exact( 4 )
            .map( |b| i32::from_le_bytes([ b[ 0 ], b[ 1 ], b[ 2 ], b[ 3 ] ]) as f32 / 2_147_483_648.0 )
            .collect(),
        _ => data
            .chunks_exact( 2 )
            .map( |b| i16::from_le_bytes([ b[ 0 ], b[ 1 ] ]) as f32 / 32768.0 )
            .collect(),
    }
}


/// Sliding window of decoded frames over a decode session.
pub struct FrameCache {
    session: DecodeSession,
    capacity: usize,
    channels: usize,
    /// Frame index of the first frame in `window`
    start: u64,
    /// Interleaved samples
    window: Vec<f32>,
    filled: bool,
    clamped: u64,
}


impl FrameCache {
    /// Wraps a session with a window of at most `capacity` frames.
    pub fn new( session: DecodeSession, capacity: usize ) -> Self {
        let frame_count = session.info().frame_count;
        let capacity = ( capacity as u64 ).min( frame_count + 1 ).max( 1 ) as usize;
        let channels = session.format().channels as usize;

        Self {
            session,
            capacity,
            channels,
            start: 0,
            window: Vec::new(),
            filled: false,
            clamped: 0,
        }
    }


    /// Samples (one per channel) at `time` seconds; silence outside the file.
    pub fn get_frame( &mut self, time: f64 ) -> Result<Vec<f32>, DecoderError> {
        let Some( index ) = self.frame_index( time ) else {
            return Ok( vec![ 0.0; self.channels ] );
        };

        if !self.covers( index ) {
            self.buffer_around( index )?;
        }
        Ok( self.lookup( index ) )
    }


    /// Samples for each of `times`. Out-of-range entries stay silent.
    pub fn get_frames( &mut self, times: &[f64] ) -> Result<Vec<Vec<f32>>, DecoderError> {
        let mut result = vec![ vec![ 0.0; self.channels ]; times.len() ];

        let wanted: Vec<( usize, u64 )> = times
            .iter()
            .enumerate()
            .filter_map( |( i, &t )| self.frame_index( t ).map( |f| ( i, f ) ) )
            .collect();

        let ( Some( min ), Some( max ) ) = (
            wanted.iter().map( |( _, f )| *f ).min(),
            wanted.iter().map( |( _, f )| *f ).max(),
        ) else {
            return Ok( result );
        };

        if !self.covers( min ) {
            self.buffer_around( min )?;
        } else if !self.covers( max ) {
            self.buffer_around( max )?;
        }

        for ( i, frame ) in wanted {
            result[ i ] = self.lookup( frame );
        }
        Ok( result )
    }


    /// Recenters the window on `frame`, reusing any overlapping tail.
    pub fn buffer_around( &mut self, frame: u64 ) -> Result<(), DecoderError> {
        let new_start = frame.saturating_sub( self.capacity as u64 / 2 );
        let capacity = self.capacity as u64;

        if self.filled {
            let current_end = self.start + self.len() as u64;

            if new_start >= self.start && new_start < current_end && current_end < new_start + capacity {
                // Keep [new_start, current_end) and decode only what follows
                let conserved = current_end - new_start;
                self.session.seek( current_end )?;
                let data = self.session.read_chunk( ( capacity - conserved ) as usize )?;

                let dropped = ( new_start - self.start ) as usize * self.channels;
                self.window.drain( ..dropped );
                self.window.extend( pcm_to_f32( &data, self.session.format().byte_width ) );
                self.start = new_start;
                return Ok(());
            }
        }

        self.session.seek( new_start )?;
        let data = self.session.read_chunk( self.capacity )?;
        self.window = pcm_to_f32( &data, self.session.format().byte_width );
        self.start = new_start;
        self.filled = true;
        Ok(())
    }


    /// First frame index held in the window.
    pub fn window_start( &self ) -> u64 {
        self.start
    }


    /// Number of frames held in the window.
    pub fn len( &self ) -> usize {
        self.window.len() / self.channels.max( 1 )
    }


    pub fn is_empty( &self ) -> bool {
        self.window.is_empty()
    }


    pub fn capacity( &self ) -> usize {
        self.capacity
    }


    /// How many lookups had to fall back to the nearest cached frame.
    pub fn clamped_lookups( &self ) -> u64 {
        self.clamped
    }


    pub fn session( &self ) -> &DecodeSession {
        &self.session
    }


    fn frame_index( &self, time: f64 ) -> Option<u64> {
        let info = self.session.info();
        if !( time >= 0.0 && time < info.duration ) {
            return None;
        }
        Some( ( info.sample_rate as f64 * time ).round() as u64 )
    }


    fn covers( &self, frame: u64 ) -> bool {
        self.filled && frame >= self.start && frame - self.start < self.len() as u64
    }


    fn lookup( &mut self, frame: u64 ) -> Vec<f32> {
        let len = self.len();
        if len == 0 {
            return vec![ 0.0; self.channels ];
        }

        let offset = if self.covers( frame ) {
            ( frame - self.start ) as usize
        } else {
            let nearest = if frame < self.start { 0 } else { len - 1 };
            tracing::warn!(
                "Frame {} of {:?} is outside the window {}..{}, using frame {}",
                frame,
                self.session.path(),
                self.start,
                self.start + len as u64,
                self.start + nearest as u64
            );
            self.clamped += 1;
            nearest
        };

        let base = offset * self.channels;
        self.window[ base..base + self.channels ].to_vec()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use crate::config::{ DecoderConfig, PcmFormat };
    use crate::testing::SyntheticBackend;


    const RATE: u32 = 1000;


    fn cache( backend: &SyntheticBackend, capacity: usize ) -> FrameCache {
        let config = DecoderConfig {
            format: PcmFormat { sample_rate: RATE, channels: 2, byte_width: 2 },
            ..DecoderConfig::default()
        };
        let session = DecodeSession::open( Path::new( "ramp.wav" ), &config, Arc::new( backend.clone() ) ).unwrap();
        FrameCache::new( session, capacity )
    }


    fn expected( frame: u64 ) -> Vec<f32> {
        vec![
            SyntheticBackend::sample( frame, 0 ) as f32 / 32768.0,
            SyntheticBackend::sample( frame, 1 ) as f32 / 32768.0,
        ]
    }


    #[test]
    fn test_get_frame_returns_sample_at_time() {
        let backend = SyntheticBackend::new( 10.0 );
        let mut cache = cache( &backend, 200 );

        assert_eq!( cache.get_frame( 1.2344 ).unwrap(), expected( 1234 ) );
        assert_eq!( cache.get_frame( 1.2346 ).unwrap(), expected( 1235 ) );
        assert_eq!( cache.get_frame( 0.0 ).unwrap(), expected( 0 ) );
    }


    #[test]
    fn test_out_of_range_time_is_silent() {
        let backend = SyntheticBackend::new( 2.0 );
        let mut cache = cache( &backend, 200 );

        assert_eq!( cache.get_frame( -0.5 ).unwrap(), vec![ 0.0, 0.0 ] );
        assert_eq!( cache.get_frame( 2.0 ).unwrap(), vec![ 0.0, 0.0 ] );
        assert_eq!( cache.get_frame( f64::NAN ).unwrap(), vec![ 0.0, 0.0 ] );
        // Nothing was decoded for those
        assert!( cache.is_empty() );
    }


    #[test]
    fn test_vector_query_resolves_only_in_range() {
        let backend = SyntheticBackend::new( 2.0 );
        let mut cache = cache( &backend, 500 );

        let result = cache.get_frames( &[ -1.0, 0.1, 0.2, 5.0 ] ).unwrap();
        assert_eq!( result[ 0 ], vec![ 0.0, 0.0 ] );
        assert_eq!( result[ 1 ], expected( 100 ) );
        assert_eq!( result[ 2 ], expected( 200 ) );
        assert_eq!( result[ 3 ], vec![ 0.0, 0.0 ] );
    }


    #[test]
    fn test_window_covers_requested_frame() {
        let backend = SyntheticBackend::new( 3.0 );
        let mut cache = cache( &backend, 256 );

        for frame in [ 0, 1, 127, 128, 900, 2999, 1500, 10 ] {
            cache.buffer_around( frame ).unwrap();
            let offset = frame - cache.window_start();
            assert!( frame >= cache.window_start() && offset < cache.len() as u64, "frame {}", frame );
        }
    }


    #[test]
    fn test_sequential_scan_reuses_overlap() {
        let backend = SyntheticBackend::new( 10.0 );
        let mut cache = cache( &backend, 100 );

        cache.buffer_around( 500 ).unwrap();
        assert_eq!( cache.window_start(), 450 );
        assert_eq!( cache.session().cursor(), 550 );

        cache.buffer_around( 520 ).unwrap();
        assert_eq!( cache.window_start(), 470 );
        assert_eq!( cache.len(), 100 );
        // Only the 20 new frames were decoded
        assert_eq!( cache.session().cursor(), 570 );

        for t in 470..570 {
            assert_eq!( cache.get_frame( t as f64 / RATE as f64 ).unwrap(), expected( t ) );
        }
        assert_eq!( backend.spawn_count(), 1 );
    }


    #[test]
    fn test_backward_jump_refills() {
        let backend = SyntheticBackend::new( 10.0 );
        let mut cache = cache( &backend, 100 );

        cache.get_frame( 5.0 ).unwrap();
        assert_eq!( cache.get_frame( 1.0 ).unwrap(), expected( 1000 ) );
        assert_eq!( cache.window_start(), 950 );
        assert_eq!( backend.spawn_count(), 2 );
    }


    #[test]
    fn test_lookup_past_stream_end_clamps() {
        let backend = SyntheticBackend::new( 1.0 );
        let mut cache = cache( &backend, 100 );

        // Frame 1000 rounds in range but the decoder only produced 0..1000
        let sample = cache.get_frame( 0.9996 ).unwrap();
        assert_eq!( sample, expected( 999 ) );
        assert_eq!( cache.clamped_lookups(), 1 );
    }


    #[test]
    fn test_capacity_clamped_to_stream_length() {
        let backend = SyntheticBackend::new( 0.5 );
        let cache = cache( &backend, 100_000 );
        assert_eq!( cache.capacity(), 502 );
    }
}
