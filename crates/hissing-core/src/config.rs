//! Engine configuration
//!
//! Plain values passed explicitly to each component. Nothing here is
//! process-global; two managers may point at different decoder executables.

use std::path::PathBuf;
use std::time::Duration;


/// Raw PCM layout requested from the decoder.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample: 1 (unsigned), 2 or 4 (signed little-endian)
    pub byte_width: u8,
}


impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            byte_width: 2,
        }
    }
}


impl PcmFormat {
    /// Bytes per interleaved frame.
    pub fn frame_bytes( &self ) -> usize {
        self.channels as usize * self.byte_width as usize
    }


    /// Bit depth of one sample.
    pub fn bits( &self ) -> u16 {
        self.byte_width as u16 * 8
    }


    /// Raw format name understood by the decoder (`-f`).
    pub fn decoder_format( &self ) -> String {
        if self.byte_width == 1 {
            "u8".to_string()
        } else {
            format!( "s{}le", self.bits() )
        }
    }


    /// PCM codec name understood by the decoder (`-acodec`).
    pub fn decoder_codec( &self ) -> String {
        format!( "pcm_{}", self.decoder_format() )
    }


    /// Converts a frame count to seconds.
    pub fn frames_to_secs( &self, frames: u64 ) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}


/// Which frame-rate field of the decoder report is trusted first.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum RateSource {
    /// The "tbr" base rate, falling back to "fps"
    #[default]
    Tbr,
    /// The "fps" field, falling back to "tbr"
    Fps,
}


/// Settings for decode sessions.
#[derive( Debug, Clone, PartialEq )]
pub struct DecoderConfig {
    /// Decoder executable, looked up on `PATH` when not absolute
    pub program: PathBuf,
    pub format: PcmFormat,
    pub rate_source: RateSource,
}


impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from( "ffmpeg" ),
            format: PcmFormat::default(),
            rate_source: RateSource::default(),
        }
    }
}


/// Settings for the streaming buffer filler.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct FillerConfig {
    /// Frames decoded into each device buffer
    pub chunk_frames: usize,
    /// Number of device buffers cycling through the queue
    pub max_buffers: usize,
    /// Sleep between polls when no buffer is ready
    pub poll_interval: Duration,
}


impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            chunk_frames: 8192,
            max_buffers: 3,
            poll_interval: Duration::from_millis( 5 ),
        }
    }
}


/// Everything a `Manager` needs to load sounds.
#[derive( Debug, Clone, Default, PartialEq )]
pub struct ManagerConfig {
    pub decoder: DecoderConfig,
    pub filler: FillerConfig,
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_decoder_format_names() {
        let format = PcmFormat::default();
        assert_eq!( format.decoder_format(), "s16le" );
        assert_eq!( format.decoder_codec(), "pcm_s16le" );
        assert_eq!( format.frame_bytes(), 4 );

        let format = PcmFormat { byte_width: 1, ..PcmFormat::default() };
        assert_eq!( format.decoder_format(), "u8" );
        assert_eq!( format.decoder_codec(), "pcm_u8" );

        let format = PcmFormat { byte_width: 4, ..PcmFormat::default() };
        assert_eq!( format.decoder_format(), "s32le" );
    }
}
