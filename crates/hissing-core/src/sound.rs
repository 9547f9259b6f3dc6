//! Playback sources
//!
//! A `Sound` is one device source playing one file, either decoded up front
//! into a single static buffer or streamed through a `BufferFiller`.

use std::path::{ Path, PathBuf };
use std::sync::Arc;

use thiserror::Error;

use crate::backend::MediaBackend;
use crate::config::{ FillerConfig, ManagerConfig, PcmFormat };
use crate::decoder::{ DecodeSession, DecoderError };
use crate::device::{ BufferFormat, BufferId, Device, DeviceError, FloatParam, SourceId, SourceState, VectorParam };
use crate::filler::{ BufferFiller, FillerError };
use crate::probe::MediaStreamInfo;


/// Errors that can occur while loading or controlling a sound.
#[derive( Debug, Error )]
pub enum SourceError {
    #[error( transparent )]
    Decode( #[from] DecoderError ),

    #[error( transparent )]
    Device( #[from] DeviceError ),

    #[error( "Cannot switch a sound to {0:?}" )]
    InvalidTransition( PlaybackState ),

    #[error( "Streaming stopped: {0}" )]
    Filler( String ),
}


impl From<FillerError> for SourceError {
    fn from( err: FillerError ) -> Self {
        match err {
            FillerError::Decode( e ) => SourceError::Decode( e ),
            FillerError::Device( e ) => SourceError::Device( e ),
        }
    }
}


/// Playback state as reported by the device.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum PlaybackState {
    Initial,
    Playing,
    Paused,
    Stopped,
}


impl From<SourceState> for PlaybackState {
    fn from( state: SourceState ) -> Self {
        match state {
            SourceState::Initial => PlaybackState::Initial,
            SourceState::Playing => PlaybackState::Playing,
            SourceState::Paused => PlaybackState::Paused,
            SourceState::Stopped => PlaybackState::Stopped,
        }
    }
}


/// How a file is fed to the device.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum LoadMode {
    /// Decode everything into one buffer before playing.
    #[default]
    Static,
    /// Decode while playing through a small ring of buffers.
    Stream,
}


enum Mode {
    Static {
        buffer: BufferId,
    },
    Stream {
        slots: Vec<BufferId>,
        filler: Option<BufferFiller>,
        /// Held while no filler is running
        session: Option<DecodeSession>,
        config: FillerConfig,
        looped: bool,
    },
}


/// One file playing on one device source.
pub struct Sound {
    device: Arc<dyn Device>,
    source: SourceId,
    path: PathBuf,
    info: MediaStreamInfo,
    format: PcmFormat,
    mode: Mode,
    disposed: bool,
}


impl Sound {
    /// Probes and loads `path` onto a new device source.
    pub fn load(
        device: Arc<dyn Device>,
        backend: Arc<dyn MediaBackend>,
        path: &Path,
        mode: LoadMode,
        config: &ManagerConfig,
    ) -> Result<Self, SourceError> {
        let session = DecodeSession::open( path, &config.decoder, backend )?;

        match mode {
            LoadMode::Static => Self::load_static( device, session, config.filler.chunk_frames ),
            LoadMode::Stream => Self::load_stream( device, session, config.filler ),
        }
    }


    fn load_static( device: Arc<dyn Device>, mut session: DecodeSession, chunk_frames: usize ) -> Result<Self, SourceError> {
        let format = session.format();
        let buffer_format = BufferFormat::from_layout( format.channels, format.bits() )?;

        let full = chunk_frames * format.frame_bytes();
        let mut data = Vec::new();
        loop {
            let chunk = session.read_chunk( chunk_frames )?;
            let short = chunk.len() < full;
            data.extend_from_slice( &chunk );
            if short {
                break;
            }
        }
        session.close();

        let ( source, mut buffers ) = Self::allocate( &*device, 1 )?;
        let buffer = buffers.remove( 0 );

        let sound = Self {
            device,
            source,
            path: session.path().to_path_buf(),
            info: session.info().clone(),
            format,
            mode: Mode::Static { buffer },
            disposed: false,
        };

        // Dropping `sound` on failure releases the source and buffer
        sound.device.buffer_data( buffer, buffer_format, &data, format.sample_rate )?;
        sound.device.attach_buffer( source, Some( buffer ) )?;

        tracing::info!( "Loaded {:?}: {} bytes in one buffer", sound.path, data.len() );
        Ok( sound )
    }


    fn load_stream( device: Arc<dyn Device>, session: DecodeSession, config: FillerConfig ) -> Result<Self, SourceError> {
        let ( source, slots ) = Self::allocate( &*device, config.max_buffers.max( 1 ) )?;

        let mut sound = Self {
            device,
            source,
            path: session.path().to_path_buf(),
            info: session.info().clone(),
            format: session.format(),
            mode: Mode::Stream {
                slots,
                filler: None,
                session: Some( session ),
                config,
                looped: false,
            },
            disposed: false,
        };
        sound.start_filler()?;

        tracing::info!( "Streaming {:?} through {} buffers", sound.path, config.max_buffers );
        Ok( sound )
    }


    /// Creates a source and `count` buffers, releasing the source if the
    /// buffers cannot be had.
    fn allocate( device: &dyn Device, count: usize ) -> Result<( SourceId, Vec<BufferId> ), DeviceError> {
        let source = device.create_source()?;
        match device.create_buffers( count ) {
            Ok( buffers ) => Ok( ( source, buffers ) ),
            Err( e ) => {
                if let Err( err ) = device.delete_source( source ) {
                    tracing::warn!( "Failed to release source {:?}: {}", source, err );
                }
                Err( e )
            }
        }
    }


    /// Starts a filler on the held session. The queue must be empty.
    fn start_filler( &mut self ) -> Result<(), SourceError> {
        let Mode::Stream { slots, filler, session, config, looped } = &mut self.mode else {
            return Ok(());
        };

        let session = session.take().ok_or( DecoderError::Closed )?;
        *filler = Some( BufferFiller::start(
            Arc::clone( &self.device ),
            self.source,
            session,
            slots.clone(),
            *config,
            *looped,
        )? );
        Ok(())
    }


    /// Stops the filler and takes its session back.
    fn halt_filler( &mut self ) {
        let Mode::Stream { filler, session, .. } = &mut self.mode else {
            return;
        };

        if let Some( exit ) = filler.take().and_then( |mut f| f.stop() ) {
            *session = Some( exit.session );
        }
    }


    /// Puts a stream back at its first frame with a full queue.
    fn restart_stream( &mut self ) -> Result<(), SourceError> {
        self.halt_filler();

        self.device.stop( self.source )?;
        let queued = self.device.queued_buffers( self.source )?;
        self.device.unqueue_buffers( self.source, queued )?;

        if let Mode::Stream { session: Some( session ), .. } = &mut self.mode {
            session.seek( 0 )?;
        }
        self.start_filler()
    }


    fn check_fault( &self ) -> Result<(), SourceError> {
        if let Mode::Stream { filler: Some( filler ), .. } = &self.mode {
            if let Some( fault ) = filler.fault() {
                return Err( SourceError::Filler( fault ) );
            }
        }
        Ok(())
    }


    /// True when a stream has nothing left feeding it.
    fn stream_idle( &self ) -> bool {
        match &self.mode {
            Mode::Stream { filler: Some( filler ), .. } => filler.is_finished(),
            Mode::Stream { filler: None, .. } => true,
            Mode::Static { .. } => false,
        }
    }


    /// Starts or resumes playback. A stream that already ran out starts over.
    pub fn play( &mut self ) -> Result<(), SourceError> {
        self.check_fault()?;
        if self.stream_idle() {
            self.restart_stream()?;
        }
        self.device.play( self.source )?;
        Ok(())
    }


    pub fn pause( &mut self ) -> Result<(), SourceError> {
        self.device.pause( self.source )?;
        Ok(())
    }


    /// Stops playback; the next `play` starts from the beginning.
    pub fn stop( &mut self ) -> Result<(), SourceError> {
        self.halt_filler();
        self.device.stop( self.source )?;
        Ok(())
    }


    /// Returns to the beginning in the `Initial` state.
    pub fn rewind( &mut self ) -> Result<(), SourceError> {
        self.check_fault()?;
        if self.is_stream() {
            self.restart_stream()?;
        }
        self.device.rewind( self.source )?;
        Ok(())
    }


    pub fn state( &self ) -> Result<PlaybackState, SourceError> {
        self.check_fault()?;
        Ok( self.device.source_state( self.source )?.into() )
    }


    /// Drives the sound to `target`. `Initial` is only reachable by `rewind`.
    pub fn set_state( &mut self, target: PlaybackState ) -> Result<(), SourceError> {
        match target {
            PlaybackState::Initial => Err( SourceError::InvalidTransition( target ) ),
            PlaybackState::Playing => self.play(),
            PlaybackState::Paused => self.pause(),
            PlaybackState::Stopped => self.stop(),
        }
    }


    /// Seconds played so far.
    pub fn time( &self ) -> Result<f64, SourceError> {
        self.check_fault()?;

        let frames = match &self.mode {
            Mode::Stream { filler: Some( filler ), .. } => {
                filler.elapsed_frames( || self.device.sample_offset( self.source ) )?
            }
            _ => self.device.sample_offset( self.source )?,
        };

        let secs = self.format.frames_to_secs( frames );
        let length = self.length();
        match &self.mode {
            // A looping stream keeps counting across passes
            Mode::Stream { looped: true, .. } if length > 0.0 => Ok( secs % length ),
            // Decoders may run a few frames past the reported duration
            Mode::Stream { .. } => Ok( secs.min( length ) ),
            Mode::Static { .. } => Ok( secs ),
        }
    }


    /// Total duration in seconds.
    pub fn length( &self ) -> f64 {
        self.info.duration
    }


    pub fn looped( &self ) -> Result<bool, SourceError> {
        match &self.mode {
            Mode::Stream { looped, .. } => Ok( *looped ),
            Mode::Static { .. } => Ok( self.device.looping( self.source )? ),
        }
    }


    pub fn set_looped( &mut self, value: bool ) -> Result<(), SourceError> {
        self.device.set_looping( self.source, value )?;
        if let Mode::Stream { looped, filler, .. } = &mut self.mode {
            *looped = value;
            if let Some( filler ) = filler {
                filler.set_looping( value );
            }
        }
        Ok(())
    }


    /// Volume on a 0-100 scale.
    pub fn volume( &self ) -> Result<f32, SourceError> {
        Ok( self.device.float( self.source, FloatParam::Gain )? * 100.0 )
    }


    pub fn set_volume( &mut self, volume: f32 ) -> Result<(), SourceError> {
        self.device.set_float( self.source, FloatParam::Gain, volume / 100.0 )?;
        Ok(())
    }


    /// Pitch on a 0-100 scale, 100 being the original speed.
    pub fn pitch( &self ) -> Result<f32, SourceError> {
        Ok( self.device.float( self.source, FloatParam::Pitch )? * 100.0 )
    }


    pub fn set_pitch( &mut self, pitch: f32 ) -> Result<(), SourceError> {
        self.device.set_float( self.source, FloatParam::Pitch, pitch / 100.0 )?;
        Ok(())
    }


    pub fn position( &self ) -> Result<[f32; 3], SourceError> {
        Ok( self.device.vector( self.source, VectorParam::Position )? )
    }


    pub fn set_position( &mut self, position: [f32; 3] ) -> Result<(), SourceError> {
        self.device.set_vector( self.source, VectorParam::Position, position )?;
        Ok(())
    }


    pub fn velocity( &self ) -> Result<[f32; 3], SourceError> {
        Ok( self.device.vector( self.source, VectorParam::Velocity )? )
    }


    pub fn set_velocity( &mut self, velocity: [f32; 3] ) -> Result<(), SourceError> {
        self.device.set_vector( self.source, VectorParam::Velocity, velocity )?;
        Ok(())
    }


    pub fn is_stream( &self ) -> bool {
        matches!( self.mode, Mode::Stream { .. } )
    }


    pub fn path( &self ) -> &Path {
        &self.path
    }


    pub fn info( &self ) -> &MediaStreamInfo {
        &self.info
    }


    /// Device source backing this sound.
    pub fn source( &self ) -> SourceId {
        self.source
    }


    /// Releases the filler, buffers and source.
    ///
    /// A stream's filler is stopped and joined before any buffer is freed.
    /// Failures are logged, never returned. Safe to call repeatedly.
    pub fn dispose( &mut self ) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.halt_filler();

        let device = &self.device;
        let source = self.source;
        let warn = |what: &str, result: Result<(), DeviceError>| {
            if let Err( e ) = result {
                tracing::warn!( "Failed to {} for {:?}: {}", what, source, e );
            }
        };

        match &mut self.mode {
            Mode::Stream { slots, session, .. } => {
                if let Some( mut session ) = session.take() {
                    session.close();
                }

                warn( "stop source", device.stop( source ) );
                let unqueued = device
                    .queued_buffers( source )
                    .and_then( |n| device.unqueue_buffers( source, n ) )
                    .map( |_| () );
                warn( "unqueue buffers", unqueued );
                warn( "delete buffers", device.delete_buffers( slots ) );
                warn( "delete source", device.delete_source( source ) );
            }
            Mode::Static { buffer } => {
                warn( "delete source", device.delete_source( source ) );
                warn( "delete buffer", device.delete_buffers( &[ *buffer ] ) );
            }
        }

        tracing::debug!( "Disposed {:?}", self.path );
    }
}


impl Drop for Sound {
    fn drop( &mut self ) {
        self.dispose();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::atomic::{ AtomicBool, Ordering };
    use std::thread;
    use std::time::{ Duration, Instant };

    use crate::config::DecoderConfig;
    use crate::device::ErrorCode;
    use crate::soft::SoftDevice;
    use crate::testing::{ wait_for, SyntheticBackend };


    fn config( rate: u32, chunk_frames: usize ) -> ManagerConfig {
        ManagerConfig {
            decoder: DecoderConfig {
                format: PcmFormat { sample_rate: rate, channels: 1, byte_width: 2 },
                ..DecoderConfig::default()
            },
            filler: FillerConfig {
                chunk_frames,
                max_buffers: 3,
                poll_interval: Duration::from_millis( 1 ),
            },
        }
    }


    fn load( device: &Arc<SoftDevice>, duration: f64, mode: LoadMode, config: &ManagerConfig ) -> Sound {
        let device: Arc<dyn Device> = device.clone();
        let backend = Arc::new( SyntheticBackend::new( duration ) );
        Sound::load( device, backend, Path::new( "clip.flac" ), mode, config ).unwrap()
    }


    fn render( device: &SoftDevice, frames: usize ) -> Vec<f32> {
        let mut out = vec![ 0.0; frames ];
        device.render( &mut out );
        out
    }


    #[test]
    fn test_whole_file_uses_one_buffer() {
        let device = Arc::new( SoftDevice::headless( 44100, 1 ) );
        let mut sound = load( &device, 1.0, LoadMode::Static, &config( 44100, 4096 ) );

        assert!( !sound.is_stream() );
        let Mode::Static { buffer } = sound.mode else { panic!( "expected a static sound" ) };
        assert_eq!( device.buffer_bytes( buffer ), Some( 44100 * 2 ) );

        assert_eq!( sound.state().unwrap(), PlaybackState::Initial );
        sound.play().unwrap();

        let mut states = vec![ PlaybackState::Initial ];
        for _ in 0..12 {
            render( &device, 4096 );
            let state = sound.state().unwrap();
            if states.last() != Some( &state ) {
                states.push( state );
            }
        }
        assert_eq!( states, vec![ PlaybackState::Initial, PlaybackState::Playing, PlaybackState::Stopped ] );
        assert!( ( sound.time().unwrap() - 1.0 ).abs() < 1e-9 );
    }


    #[test]
    fn test_streaming_time_reaches_length() {
        let device = Arc::new( SoftDevice::headless( 44100, 1 ) );
        let mut sound = load( &device, 1.0, LoadMode::Stream, &config( 44100, 8192 ) );
        let source = sound.source();

        assert!( sound.is_stream() );
        assert_eq!( device.queued_buffers( source ).unwrap(), 3 );
        sound.play().unwrap();

        // Chunks: five full, then 3140 frames
        for k in 1..=6 {
            render( &device, 8192 );
            if k <= 3 {
                assert!( wait_for( || device.processed_buffers( source ).unwrap() == 0 ), "cycle {}", k );
            }
        }

        assert!( wait_for( || sound.stream_idle() ) );
        assert_eq!( sound.state().unwrap(), PlaybackState::Stopped );

        let calls = device.call_count();
        thread::sleep( Duration::from_millis( 20 ) );
        assert_eq!( device.call_count(), calls );

        let chunk_secs = 8192.0 / 44100.0;
        assert!( ( sound.time().unwrap() - sound.length() ).abs() <= chunk_secs );
    }


    #[test]
    fn test_stream_replays_after_end() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let mut sound = load( &device, 0.2, LoadMode::Stream, &config( 1000, 100 ) );
        sound.play().unwrap();

        render( &device, 300 );
        assert!( wait_for( || sound.stream_idle() ) );
        assert_eq!( sound.state().unwrap(), PlaybackState::Stopped );

        sound.play().unwrap();
        assert_eq!( sound.state().unwrap(), PlaybackState::Playing );
        assert_eq!( sound.time().unwrap(), 0.0 );

        let out = render( &device, 10 );
        assert_eq!( out[ 5 ], SyntheticBackend::sample( 5, 0 ) as f32 / 32768.0 );
    }


    #[test]
    fn test_stream_time_never_runs_backwards() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let mut sound = load( &device, 100.0, LoadMode::Stream, &config( 1000, 100 ) );
        sound.play().unwrap();

        let done = Arc::new( AtomicBool::new( false ) );
        let player = {
            let device = Arc::clone( &device );
            let done = Arc::clone( &done );
            thread::spawn( move || {
                while !done.load( Ordering::SeqCst ) {
                    render( &device, 10 );
                    thread::sleep( Duration::from_micros( 200 ) );
                }
            })
        };

        let deadline = Instant::now() + Duration::from_millis( 300 );
        let mut last = 0.0;
        let mut backwards = Vec::new();
        while Instant::now() < deadline {
            let now = sound.time().unwrap();
            if now < last {
                backwards.push( ( last, now ) );
            }
            last = now;
        }

        done.store( true, Ordering::SeqCst );
        player.join().unwrap();

        assert!( backwards.is_empty(), "time went backwards: {:?}", backwards );
        assert!( last > 0.0 );
    }


    #[test]
    fn test_stream_decoding_past_duration_ends_at_length() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let backend = Arc::new( SyntheticBackend::new( 1.0 ).decoding( 1.01 ) );
        let shared: Arc<dyn Device> = device.clone();
        let mut sound = Sound::load( shared, backend, Path::new( "clip.flac" ), LoadMode::Stream, &config( 1000, 100 ) ).unwrap();
        sound.play().unwrap();

        assert!( wait_for( || {
            render( &device, 50 );
            sound.stream_idle()
        }));

        assert_eq!( sound.state().unwrap(), PlaybackState::Stopped );
        assert!( !sound.looped().unwrap() );
        assert!( ( sound.time().unwrap() - sound.length() ).abs() < 1e-9 );
    }


    #[test]
    fn test_stop_then_rewind() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let mut sound = load( &device, 2.0, LoadMode::Stream, &config( 1000, 100 ) );

        sound.play().unwrap();
        render( &device, 150 );
        sound.stop().unwrap();
        assert_eq!( sound.state().unwrap(), PlaybackState::Stopped );
        assert_eq!( sound.time().unwrap(), 0.0 );

        sound.rewind().unwrap();
        assert_eq!( sound.state().unwrap(), PlaybackState::Initial );
        assert_eq!( device.queued_buffers( sound.source() ).unwrap(), 3 );
    }


    #[test]
    fn test_pause_and_resume() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let mut sound = load( &device, 1.0, LoadMode::Static, &config( 1000, 256 ) );

        sound.set_state( PlaybackState::Playing ).unwrap();
        render( &device, 250 );
        sound.set_state( PlaybackState::Paused ).unwrap();
        render( &device, 250 );
        assert_eq!( sound.state().unwrap(), PlaybackState::Paused );
        assert!( ( sound.time().unwrap() - 0.25 ).abs() < 1e-9 );

        sound.play().unwrap();
        render( &device, 250 );
        assert!( ( sound.time().unwrap() - 0.5 ).abs() < 1e-9 );
    }


    #[test]
    fn test_initial_state_cannot_be_set() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let mut sound = load( &device, 1.0, LoadMode::Static, &config( 1000, 256 ) );

        let err = sound.set_state( PlaybackState::Initial ).unwrap_err();
        assert!( matches!( err, SourceError::InvalidTransition( PlaybackState::Initial ) ) );
    }


    #[test]
    fn test_parameters_use_percent_scale() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let mut sound = load( &device, 1.0, LoadMode::Static, &config( 1000, 256 ) );

        sound.set_volume( 50.0 ).unwrap();
        sound.set_pitch( 150.0 ).unwrap();
        assert_eq!( device.float( sound.source(), FloatParam::Gain ).unwrap(), 0.5 );
        assert_eq!( sound.volume().unwrap(), 50.0 );
        assert_eq!( sound.pitch().unwrap(), 150.0 );

        sound.set_position([ 1.0, 2.0, 3.0 ]).unwrap();
        sound.set_velocity([ 0.0, 0.0, -1.0 ]).unwrap();
        assert_eq!( sound.position().unwrap(), [ 1.0, 2.0, 3.0 ] );
        assert_eq!( sound.velocity().unwrap(), [ 0.0, 0.0, -1.0 ] );

        sound.set_looped( true ).unwrap();
        assert!( sound.looped().unwrap() );

        let err = sound.set_volume( -10.0 ).unwrap_err();
        assert!( matches!( err, SourceError::Device( DeviceError::Code( ErrorCode::InvalidValue ) ) ) );
    }


    #[test]
    fn test_dispose_releases_everything_once() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let mut sound = load( &device, 2.0, LoadMode::Stream, &config( 1000, 100 ) );
        let source = sound.source();
        let Mode::Stream { slots, .. } = &sound.mode else { panic!( "expected a stream" ) };
        let slots = slots.clone();

        sound.play().unwrap();
        render( &device, 120 );

        sound.dispose();
        let calls = device.call_count();
        sound.dispose();
        drop( sound );
        assert_eq!( device.call_count(), calls );

        assert!( device.source_state( source ).is_err() );
        for slot in slots {
            assert_eq!( device.buffer_bytes( slot ), None );
        }
    }


    #[test]
    fn test_dispose_after_device_closed_does_not_fail() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let mut sound = load( &device, 1.0, LoadMode::Static, &config( 1000, 256 ) );

        device.close().unwrap();
        sound.dispose();
    }


    #[test]
    fn test_filler_fault_surfaces_from_state() {
        let device = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let sound = load( &device, 2.0, LoadMode::Stream, &config( 1000, 100 ) );

        device.delete_source( sound.source() ).unwrap();
        assert!( wait_for( || matches!( sound.state(), Err( SourceError::Filler( _ ) ) ) ) );
        assert!( matches!( sound.time(), Err( SourceError::Filler( _ ) ) ) );
    }


    #[test]
    fn test_load_missing_file() {
        let device: Arc<dyn Device> = Arc::new( SoftDevice::headless( 1000, 1 ) );
        let backend = Arc::new( SyntheticBackend::new( 1.0 ).missing() );
        let result = Sound::load( device, backend, Path::new( "nope.wav" ), LoadMode::Stream, &config( 1000, 100 ) );
        assert!( matches!( result, Err( SourceError::Decode( DecoderError::NotFound( _ ) ) ) ) );
    }
}
