//! Sound manager
//!
//! Owns the playback device and every sound loaded through it, and tears
//! them down in order: sounds first, then the device.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::backend::{ Ffmpeg, MediaBackend };
use crate::config::ManagerConfig;
use crate::device::{ Device, DeviceError };
use crate::soft::SoftDevice;
use crate::sound::{ LoadMode, Sound, SourceError };


/// Handle to a sound owned by a `Manager`.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord )]
pub struct SoundId( u32 );


/// Loads files onto a device and keeps the resulting sounds alive.
pub struct Manager {
    device: Arc<dyn Device>,
    backend: Arc<dyn MediaBackend>,
    config: ManagerConfig,
    sounds: BTreeMap<SoundId, Sound>,
    next_id: u32,
    terminated: bool,
}


impl Manager {
    pub fn new( device: Arc<dyn Device>, backend: Arc<dyn MediaBackend>, config: ManagerConfig ) -> Self {
        Self {
            device,
            backend,
            config,
            sounds: BTreeMap::new(),
            next_id: 1,
            terminated: false,
        }
    }


    /// Opens the default output device and decodes with the configured
    /// ffmpeg executable.
    pub fn open( config: ManagerConfig ) -> Result<Self, DeviceError> {
        let device = Arc::new( SoftDevice::open()? );
        let backend = Arc::new( Ffmpeg::new( config.decoder.program.clone() ) );
        Ok( Self::new( device, backend, config ) )
    }


    /// Loads `path` onto a new source.
    pub fn load_file( &mut self, path: &Path, mode: LoadMode ) -> Result<SoundId, SourceError> {
        let sound = Sound::load(
            Arc::clone( &self.device ),
            Arc::clone( &self.backend ),
            path,
            mode,
            &self.config,
        )?;

        let id = SoundId( self.next_id );
        self.next_id += 1;
        self.sounds.insert( id, sound );
        Ok( id )
    }


    pub fn sound( &self, id: SoundId ) -> Option<&Sound> {
        self.sounds.get( &id )
    }


    pub fn sound_mut( &mut self, id: SoundId ) -> Option<&mut Sound> {
        self.sounds.get_mut( &id )
    }


    /// Disposes one sound. Unknown ids are ignored.
    pub fn release( &mut self, id: SoundId ) {
        if let Some( mut sound ) = self.sounds.remove( &id ) {
            sound.dispose();
        }
    }


    pub fn sound_count( &self ) -> usize {
        self.sounds.len()
    }


    pub fn listener_position( &self ) -> Result<[f32; 3], DeviceError> {
        self.device.listener_position()
    }


    pub fn set_listener_position( &self, position: [f32; 3] ) -> Result<(), DeviceError> {
        self.device.set_listener_position( position )
    }


    /// Disposes every sound, then closes the device. Safe to call repeatedly.
    pub fn terminate( &mut self ) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        for ( _, mut sound ) in std::mem::take( &mut self.sounds ) {
            sound.dispose();
        }

        if let Err( e ) = self.device.close() {
            tracing::warn!( "Failed to close device: {}", e );
        }
        tracing::info!( "Manager terminated" );
    }
}


impl Drop for Manager {
    fn drop( &mut self ) {
        self.terminate();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{ DecoderConfig, FillerConfig, PcmFormat };
    use crate::device::ErrorCode;
    use crate::testing::SyntheticBackend;


    fn manager( device: &Arc<SoftDevice> ) -> Manager {
        let config = ManagerConfig {
            decoder: DecoderConfig {
                format: PcmFormat { sample_rate: 1000, channels: 2, byte_width: 2 },
                ..DecoderConfig::default()
            },
            filler: FillerConfig {
                chunk_frames: 100,
                max_buffers: 3,
                poll_interval: Duration::from_millis( 1 ),
            },
        };
        let device: Arc<dyn Device> = device.clone();
        Manager::new( device, Arc::new( SyntheticBackend::new( 2.0 ) ), config )
    }


    #[test]
    fn test_load_and_release() {
        let device = Arc::new( SoftDevice::headless( 1000, 2 ) );
        let mut manager = manager( &device );

        let still = manager.load_file( Path::new( "a.wav" ), LoadMode::Static ).unwrap();
        let stream = manager.load_file( Path::new( "b.ogg" ), LoadMode::Stream ).unwrap();
        assert_ne!( still, stream );
        assert_eq!( manager.sound_count(), 2 );
        assert!( manager.sound( stream ).unwrap().is_stream() );
        assert_eq!( manager.sound( still ).unwrap().length(), 2.0 );

        let source = manager.sound( stream ).unwrap().source();
        manager.release( stream );
        manager.release( stream );
        assert_eq!( manager.sound_count(), 1 );
        assert!( device.source_state( source ).is_err() );
    }


    #[test]
    fn test_listener_position() {
        let device = Arc::new( SoftDevice::headless( 1000, 2 ) );
        let manager = manager( &device );

        manager.set_listener_position([ 0.5, 0.0, -2.0 ]).unwrap();
        assert_eq!( manager.listener_position().unwrap(), [ 0.5, 0.0, -2.0 ] );
    }


    #[test]
    fn test_terminate_disposes_then_closes() {
        let device = Arc::new( SoftDevice::headless( 1000, 2 ) );
        let mut manager = manager( &device );

        let id = manager.load_file( Path::new( "b.ogg" ), LoadMode::Stream ).unwrap();
        manager.sound_mut( id ).unwrap().play().unwrap();

        manager.terminate();
        assert_eq!( manager.sound_count(), 0 );

        let calls = device.call_count();
        manager.terminate();
        drop( manager );
        assert_eq!( device.call_count(), calls );

        let err = device.create_source().unwrap_err();
        assert_eq!( err.code(), Some( ErrorCode::InvalidContext ) );
    }
}
