//! Application settings management
//!
//! Persists decoder and playback defaults between runs. Command-line flags
//! override whatever is stored here.

use std::fs;
use std::path::PathBuf;

use serde::{ Deserialize, Serialize };

use hissing_core::{ DecoderConfig, FillerConfig, ManagerConfig, RateSource };

use crate::cli::Args;


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// ffmpeg executable
    pub ffmpeg: PathBuf,

    /// Frames decoded per chunk
    pub chunk_frames: usize,

    /// Buffers in the streaming queue
    pub buffers: usize,

    /// Volume, 0 to 100
    pub volume: f32,

    /// Stream files instead of decoding them up front
    pub stream: bool,

    /// Prefer the reported fps over tbr when reading frame rates
    pub prefer_fps: bool,
}


impl Default for Settings {
    fn default() -> Self {
        let filler = FillerConfig::default();
        Self {
            ffmpeg: PathBuf::from( "ffmpeg" ),
            chunk_frames: filler.chunk_frames,
            buffers: filler.max_buffers,
            volume: 100.0,
            stream: false,
            prefer_fps: false,
        }
    }
}


impl Settings {
    /// Returns the path to the settings file.
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "hissing" ).join( "settings.json" ) )
    }


    /// Loads settings from disk, or returns defaults if not found.
    pub fn load() -> Self {
        let path = match Self::settings_path() {
            Some( p ) => p,
            None => return Self::default(),
        };

        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string( &path ) {
            Ok( contents ) => Self::parse( &contents ),
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        }
    }


    /// Parses stored settings, falling back to defaults on bad input.
    fn parse( contents: &str ) -> Self {
        serde_json::from_str( contents ).unwrap_or_else( |e| {
            tracing::warn!( "Ignoring malformed settings: {}", e );
            Self::default()
        })
    }


    /// Saves settings to disk.
    pub fn save( &self ) {
        let path = match Self::settings_path() {
            Some( p ) => p,
            None => return,
        };

        // Create parent directory if needed
        if let Some( parent ) = path.parent() {
            if !parent.exists() {
                if let Err( e ) = fs::create_dir_all( parent ) {
                    tracing::warn!( "Failed to create settings directory: {}", e );
                    return;
                }
            }
        }

        match self.to_json() {
            Ok( json ) => {
                if let Err( e ) = fs::write( &path, json ) {
                    tracing::warn!( "Failed to save settings: {}", e );
                }
            }
            Err( e ) => {
                tracing::warn!( "Failed to serialize settings: {}", e );
            }
        }
    }


    fn to_json( &self ) -> serde_json::Result<String> {
        serde_json::to_string_pretty( self )
    }


    /// Returns these settings with command-line overrides applied, leaving
    /// the stored values untouched.
    pub fn with_args( &self, args: &Args ) -> Self {
        let mut run = self.clone();
        if let Some( ref ffmpeg ) = args.ffmpeg {
            run.ffmpeg = ffmpeg.clone();
        }
        if let Some( chunk_frames ) = args.chunk_frames {
            run.chunk_frames = chunk_frames;
        }
        if let Some( buffers ) = args.buffers {
            run.buffers = buffers;
        }
        if let Some( volume ) = args.volume {
            run.volume = volume;
        }
        if args.stream {
            run.stream = true;
        }
        run
    }


    /// Builds the engine configuration.
    pub fn manager_config( &self ) -> ManagerConfig {
        ManagerConfig {
            decoder: DecoderConfig {
                program: self.ffmpeg.clone(),
                rate_source: if self.prefer_fps { RateSource::Fps } else { RateSource::Tbr },
                ..DecoderConfig::default()
            },
            filler: FillerConfig {
                chunk_frames: self.chunk_frames.max( 1 ),
                max_buffers: self.buffers.max( 1 ),
                ..FillerConfig::default()
            },
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use clap::Parser;


    #[test]
    fn test_missing_fields_take_defaults() {
        let settings = Settings::parse( r#"{ "ffmpeg": "/opt/ffmpeg/bin/ffmpeg", "buffers": 4 }"# );
        assert_eq!( settings.ffmpeg, PathBuf::from( "/opt/ffmpeg/bin/ffmpeg" ) );
        assert_eq!( settings.buffers, 4 );
        assert_eq!( settings.chunk_frames, 8192 );
        assert_eq!( settings.volume, 100.0 );
    }


    #[test]
    fn test_malformed_settings_fall_back() {
        assert_eq!( Settings::parse( "{ not json" ), Settings::default() );
    }


    #[test]
    fn test_manager_config_clamps_sizes() {
        let settings = Settings { chunk_frames: 0, buffers: 0, prefer_fps: true, ..Settings::default() };
        let config = settings.manager_config();
        assert_eq!( config.filler.chunk_frames, 1 );
        assert_eq!( config.filler.max_buffers, 1 );
        assert_eq!( config.decoder.rate_source, RateSource::Fps );
    }


    #[test]
    fn test_overrides_are_not_stored() {
        let stored = Settings::default();
        let args = Args::parse_from([ "hissing", "--stream", "--buffers", "8", "--ffmpeg", "/tmp/ffmpeg", "a.ogg" ]);

        let run = stored.with_args( &args );
        assert!( run.stream );
        assert_eq!( run.buffers, 8 );
        assert_eq!( run.ffmpeg, PathBuf::from( "/tmp/ffmpeg" ) );

        // What gets written back at exit is the loaded settings plus the volume
        let mut saved = stored.clone();
        saved.volume = 40.0;
        let reloaded = Settings::parse( &saved.to_json().unwrap() );
        assert!( !reloaded.stream );
        assert_eq!( reloaded.buffers, stored.buffers );
        assert_eq!( reloaded.ffmpeg, stored.ffmpeg );
        assert_eq!( reloaded.volume, 40.0 );
    }
}
