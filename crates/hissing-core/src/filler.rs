//! Streaming buffer filler
//!
//! A background thread that keeps a fixed set of device buffers cycling
//! through a source's playback queue. Each buffer the device reports as
//! processed is unqueued, refilled with the next decoded chunk and queued
//! again at the tail, so chunks reach the device in strict decode order.
//!
//! The slots and the decode session move into the thread and come back
//! from `stop()`, which joins it. Nothing may release the slots before that.

use std::collections::{ HashMap, VecDeque };
use std::sync::{ Arc, Mutex, PoisonError };
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use std::thread;

use thiserror::Error;

use crate::config::FillerConfig;
use crate::decoder::{ DecodeSession, DecoderError };
use crate::device::{ BufferFormat, BufferId, Device, DeviceError, SourceId, SourceState };


/// Errors that end a filler.
#[derive( Debug, Error )]
pub enum FillerError {
    #[error( "Decode error: {0}" )]
    Decode( #[from] DecoderError ),

    #[error( "Device error: {0}" )]
    Device( #[from] DeviceError ),
}


/// What a joined filler hands back to its owner.
pub struct FillerExit {
    pub slots: Vec<BufferId>,
    pub session: DecodeSession,
}


/// State shared between the owner and the filler thread.
#[derive( Default )]
struct FillerShared {
    /// Frames in buffers that finished playing and were unqueued
    played_frames: AtomicU64,
    /// Held while a buffer leaves the queue and its frames are credited, so
    /// the device offset and `played_frames` are read as one pair
    timeline: Mutex<()>,
    stop: AtomicBool,
    /// Wrap to the start of the stream instead of draining
    looping: AtomicBool,
    finished: AtomicBool,
    fault: Mutex<Option<String>>,
}


impl FillerShared {
    fn set_fault( &self, message: String ) {
        let mut fault = self.fault.lock().unwrap_or_else( PoisonError::into_inner );
        // The first failure wins
        if fault.is_none() {
            *fault = Some( message );
        }
    }
}


/// Background producer feeding one source's buffer queue.
pub struct BufferFiller {
    shared: Arc<FillerShared>,
    thread: Option<thread::JoinHandle<FillerExit>>,
}


impl BufferFiller {
    /// Pre-fills every slot in order, queues them on `source` and starts
    /// the refill thread.
    ///
    /// Slots left empty because the stream is shorter than the queue stay
    /// with the filler.
    pub fn start(
        device: Arc<dyn Device>,
        source: SourceId,
        mut session: DecodeSession,
        slots: Vec<BufferId>,
        config: FillerConfig,
        looping: bool,
    ) -> Result<Self, FillerError> {
        let pcm = session.format();
        let format = BufferFormat::from_layout( pcm.channels, pcm.bits() )?;

        let mut state = LoopState {
            device,
            source,
            format,
            frequency: pcm.sample_rate,
            config,
            free: VecDeque::new(),
            frames: HashMap::new(),
            pending: None,
        };

        for slot in &slots {
            let chunk = session.read_chunk( config.chunk_frames )?;
            if chunk.is_empty() {
                state.free.push_back( *slot );
            } else {
                state.upload( *slot, chunk )?;
            }
        }

        tracing::debug!(
            "Filler for source {:?}: {} of {} slots pre-filled",
            source,
            slots.len() - state.free.len(),
            slots.len()
        );

        let shared = Arc::new( FillerShared::default() );
        shared.looping.store( looping, Ordering::SeqCst );
        let shared_clone = Arc::clone( &shared );

        let thread = thread::spawn( move || {
            if let Err( e ) = state.run( &mut session, &shared_clone ) {
                tracing::error!( "Filler for source {:?} stopped: {}", state.source, e );
                shared_clone.set_fault( e.to_string() );
            }
            shared_clone.finished.store( true, Ordering::SeqCst );
            FillerExit { slots, session }
        });

        Ok( Self {
            shared,
            thread: Some( thread ),
        })
    }


    /// Frames the device has finished with and given back for refill.
    pub fn played_frames( &self ) -> u64 {
        self.shared.played_frames.load( Ordering::SeqCst )
    }


    /// Frames played so far: `offset` (the device's sample offset, read
    /// under the same lock the thread unqueues with) plus the credited count.
    pub fn elapsed_frames<E>( &self, offset: impl FnOnce() -> Result<u64, E> ) -> Result<u64, E> {
        let _timeline = self.shared.timeline.lock().unwrap_or_else( PoisonError::into_inner );
        Ok( offset()? + self.shared.played_frames.load( Ordering::SeqCst ) )
    }


    /// True once the thread has exited, either drained, stopped or failed.
    pub fn is_finished( &self ) -> bool {
        self.shared.finished.load( Ordering::SeqCst )
    }


    pub fn set_looping( &self, looping: bool ) {
        self.shared.looping.store( looping, Ordering::SeqCst );
    }


    /// The error that ended the thread, if any.
    pub fn fault( &self ) -> Option<String> {
        self.shared.fault.lock().unwrap_or_else( PoisonError::into_inner ).clone()
    }


    /// Asks the thread to exit and waits for it.
    ///
    /// Returns the slots and session on the first call; later calls, or a
    /// thread that panicked, yield `None`.
    pub fn stop( &mut self ) -> Option<FillerExit> {
        let handle = self.thread.take()?;
        self.shared.stop.store( true, Ordering::SeqCst );

        match handle.join() {
            Ok( exit ) => Some( exit ),
            Err( _ ) => {
                tracing::error!( "Filler thread panicked" );
                self.shared.set_fault( "Filler thread panicked".to_string() );
                None
            }
        }
    }
}


impl Drop for BufferFiller {
    fn drop( &mut self ) {
        self.stop();
    }
}


/// Everything the refill loop owns.
struct LoopState {
    device: Arc<dyn Device>,
    source: SourceId,
    format: BufferFormat,
    frequency: u32,
    config: FillerConfig,
    /// Slots not currently on the queue
    free: VecDeque<BufferId>,
    /// Frames last uploaded into each slot
    frames: HashMap<BufferId, u64>,
    /// Decoded chunk waiting for a slot
    pending: Option<Vec<u8>>,
}


impl LoopState {
    fn upload( &mut self, slot: BufferId, chunk: Vec<u8> ) -> Result<(), DeviceError> {
        self.device.buffer_data( slot, self.format, &chunk, self.frequency )?;
        self.device.queue_buffers( self.source, &[ slot ] )?;
        self.frames.insert( slot, ( chunk.len() / self.format.frame_bytes() ) as u64 );
        Ok(())
    }


    /// Unqueues `count` processed buffers and credits the frames they held.
    fn reclaim( &mut self, count: usize, shared: &FillerShared ) -> Result<(), DeviceError> {
        let _timeline = shared.timeline.lock().unwrap_or_else( PoisonError::into_inner );

        let mut played = 0;
        for slot in self.device.unqueue_buffers( self.source, count )? {
            played += self.frames.remove( &slot ).unwrap_or( 0 );
            self.free.push_back( slot );
        }
        shared.played_frames.fetch_add( played, Ordering::SeqCst );
        Ok(())
    }


    fn run( &mut self, session: &mut DecodeSession, shared: &FillerShared ) -> Result<(), FillerError> {
        loop {
            if shared.stop.load( Ordering::SeqCst ) {
                tracing::debug!( "Filler for source {:?}: stop requested", self.source );
                return Ok(());
            }

            if self.pending.is_none() {
                // An empty stream never wraps
                if session.is_exhausted() && session.cursor() > 0 && shared.looping.load( Ordering::SeqCst ) {
                    tracing::debug!( "Filler for source {:?}: looping", self.source );
                    session.seek( 0 )?;
                }
                if !session.is_exhausted() {
                    let chunk = session.read_chunk( self.config.chunk_frames )?;
                    if !chunk.is_empty() {
                        self.pending = Some( chunk );
                    }
                }
            }

            let processed = self.device.processed_buffers( self.source )?;

            if self.pending.is_some() && processed > 0 && self.ran_dry( processed )? {
                self.recover( session, processed, shared )?;
                continue;
            }

            if self.pending.is_some() && ( processed > 0 || !self.free.is_empty() ) {
                if self.free.is_empty() {
                    self.reclaim( 1, shared )?;
                }
                if let ( Some( slot ), Some( chunk ) ) = ( self.free.pop_front(), self.pending.take() ) {
                    self.upload( slot, chunk )?;
                }
                continue;
            }

            if self.pending.is_none()
                && session.is_exhausted()
                && processed >= self.device.queued_buffers( self.source )?
            {
                tracing::debug!( "Filler for source {:?}: stream drained", self.source );
                return Ok(());
            }

            thread::sleep( self.config.poll_interval );
        }
    }


    /// True when the source stopped because it played every queued buffer.
    fn ran_dry( &self, processed: usize ) -> Result<bool, DeviceError> {
        Ok( processed == self.device.queued_buffers( self.source )?
            && self.device.source_state( self.source )? == SourceState::Stopped )
    }


    /// Refills the whole queue after an underrun and resumes the source.
    fn recover( &mut self, session: &mut DecodeSession, processed: usize, shared: &FillerShared ) -> Result<(), FillerError> {
        tracing::warn!( "Source {:?} ran out of queued audio, refilling", self.source );

        self.reclaim( processed, shared )?;

        while let Some( slot ) = self.free.pop_front() {
            let chunk = match self.pending.take() {
                Some( chunk ) => chunk,
                None if !session.is_exhausted() => session.read_chunk( self.config.chunk_frames )?,
                None => Vec::new(),
            };
            if chunk.is_empty() {
                self.free.push_front( slot );
                break;
            }
            self.upload( slot, chunk )?;
        }

        self.device.play( self.source )?;
        Ok(())
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use crate::config::{ DecoderConfig, PcmFormat };
    use crate::soft::SoftDevice;
    use crate::testing::{ wait_for, SyntheticBackend };


    const RATE: u32 = 1000;
    const CHUNK: usize = 100;


    struct Rig {
        device: Arc<SoftDevice>,
        source: SourceId,
        slots: Vec<BufferId>,
    }


    fn rig() -> Rig {
        let device = Arc::new( SoftDevice::headless( RATE, 1 ) );
        let source = device.create_source().unwrap();
        let slots = device.create_buffers( 3 ).unwrap();
        Rig { device, source, slots }
    }


    fn session( duration: f64, byte_width: u8 ) -> DecodeSession {
        let config = DecoderConfig {
            format: PcmFormat { sample_rate: RATE, channels: 1, byte_width },
            ..DecoderConfig::default()
        };
        let backend = SyntheticBackend::new( duration );
        DecodeSession::open( Path::new( "stream.ogg" ), &config, Arc::new( backend ) ).unwrap()
    }


    fn config() -> FillerConfig {
        FillerConfig {
            chunk_frames: CHUNK,
            max_buffers: 3,
            poll_interval: Duration::from_millis( 1 ),
        }
    }


    fn start( rig: &Rig, duration: f64 ) -> BufferFiller {
        let device: Arc<dyn Device> = rig.device.clone();
        BufferFiller::start( device, rig.source, session( duration, 2 ), rig.slots.clone(), config(), false ).unwrap()
    }


    fn render( device: &SoftDevice, frames: usize ) -> Vec<f32> {
        let mut out = vec![ 0.0; frames ];
        device.render( &mut out );
        out
    }


    /// `played` frames are credited and the freed slot is queued again.
    fn refilled( rig: &Rig, filler: &BufferFiller, played: u64 ) -> bool {
        filler.played_frames() == played && rig.device.queued_buffers( rig.source ).unwrap() == 3
    }


    fn ramp( frame: u64 ) -> f32 {
        SyntheticBackend::sample( frame, 0 ) as f32 / 32768.0
    }


    #[test]
    fn test_prefill_queues_slots_in_decode_order() {
        let rig = rig();
        let mut filler = start( &rig, 10.0 );

        assert_eq!( rig.device.queued_buffers( rig.source ).unwrap(), 3 );
        assert_eq!( filler.played_frames(), 0 );

        rig.device.play( rig.source ).unwrap();
        let out = render( &rig.device, 250 );
        for ( i, sample ) in out.iter().enumerate() {
            assert_eq!( *sample, ramp( i as u64 ), "frame {}", i );
        }

        let exit = filler.stop().unwrap();
        assert_eq!( exit.slots, rig.slots );
        assert!( filler.stop().is_none() );
    }


    #[test]
    fn test_played_frames_grows_one_chunk_per_refill() {
        let rig = rig();
        let filler = start( &rig, 10.0 );
        rig.device.play( rig.source ).unwrap();

        for k in 1..=5u64 {
            render( &rig.device, CHUNK );
            assert!( wait_for( || filler.played_frames() == k * CHUNK as u64 ), "cycle {}", k );

            // Nothing else is processed until more is rendered
            thread::sleep( Duration::from_millis( 10 ) );
            assert_eq!( filler.played_frames(), k * CHUNK as u64 );
            assert_eq!( rig.device.queued_buffers( rig.source ).unwrap(), 3 );
        }
    }


    #[test]
    fn test_refilled_audio_continues_the_stream() {
        let rig = rig();
        let filler = start( &rig, 10.0 );
        rig.device.play( rig.source ).unwrap();

        render( &rig.device, CHUNK );
        assert!( wait_for( || refilled( &rig, &filler, CHUNK as u64 ) ) );

        let out = render( &rig.device, 250 );
        for ( i, sample ) in out.iter().enumerate() {
            assert_eq!( *sample, ramp( ( CHUNK + i ) as u64 ) );
        }
    }


    #[test]
    fn test_no_device_calls_after_stop() {
        let rig = rig();
        let mut filler = start( &rig, 10.0 );
        rig.device.play( rig.source ).unwrap();
        render( &rig.device, 150 );
        assert!( wait_for( || filler.played_frames() == CHUNK as u64 ) );

        let exit = filler.stop().unwrap();
        let calls = rig.device.call_count();
        thread::sleep( Duration::from_millis( 30 ) );
        assert_eq!( rig.device.call_count(), calls );

        assert!( filler.is_finished() );
        assert!( filler.fault().is_none() );
        assert_eq!( exit.slots.len(), 3 );
    }


    #[test]
    fn test_drains_and_finishes_at_end_of_stream() {
        let rig = rig();
        let filler = start( &rig, 1.0 );
        rig.device.play( rig.source ).unwrap();

        for k in 1..=10u64 {
            render( &rig.device, CHUNK );
            let expected = k.min( 7 ) * CHUNK as u64;
            assert!( wait_for( || filler.played_frames() == expected ), "cycle {}", k );
        }

        assert!( wait_for( || filler.is_finished() ) );
        assert_eq!( rig.device.source_state( rig.source ).unwrap(), SourceState::Stopped );

        let offset = rig.device.sample_offset( rig.source ).unwrap();
        assert_eq!( filler.played_frames() + offset, 1000 );
        assert!( filler.fault().is_none() );
    }


    #[test]
    fn test_short_stream_leaves_slots_unqueued() {
        let rig = rig();
        let filler = start( &rig, 0.15 );

        // 150 frames: one full chunk, one half chunk, one empty slot
        assert_eq!( rig.device.queued_buffers( rig.source ).unwrap(), 2 );

        rig.device.play( rig.source ).unwrap();
        render( &rig.device, 200 );
        assert!( wait_for( || filler.is_finished() ) );
        assert_eq!( rig.device.sample_offset( rig.source ).unwrap(), 150 );
    }


    #[test]
    fn test_looping_wraps_to_stream_start() {
        let rig = rig();
        let filler = start( &rig, 0.25 );
        filler.set_looping( true );
        rig.device.play( rig.source ).unwrap();

        // 250 frames: chunks of 100, 100, 50, then the stream starts over
        render( &rig.device, 100 );
        assert!( wait_for( || refilled( &rig, &filler, 100 ) ) );

        let out = render( &rig.device, 200 );
        assert_eq!( out[ 0 ], ramp( 100 ) );
        assert_eq!( out[ 149 ], ramp( 249 ) );
        assert_eq!( out[ 150 ], ramp( 0 ) );
        assert_eq!( out[ 199 ], ramp( 49 ) );
        assert!( !filler.is_finished() );
    }


    #[test]
    fn test_underrun_refills_and_resumes() {
        let rig = rig();
        let filler = start( &rig, 10.0 );
        rig.device.play( rig.source ).unwrap();

        // Play past everything queued so the source stops
        render( &rig.device, 300 );
        assert!( wait_for( || filler.played_frames() == 300 ) );
        assert!( wait_for( || rig.device.source_state( rig.source ).unwrap() == SourceState::Playing ) );

        let out = render( &rig.device, 1 );
        assert_eq!( out[ 0 ], ramp( 300 ) );
    }


    #[test]
    fn test_device_error_becomes_sticky_fault() {
        let rig = rig();
        let filler = start( &rig, 10.0 );

        rig.device.delete_source( rig.source ).unwrap();
        assert!( wait_for( || filler.is_finished() ) );

        let fault = filler.fault().unwrap();
        assert!( fault.contains( "Invalid name" ), "{}", fault );
    }


    #[test]
    fn test_unsupported_sample_width_is_rejected() {
        let rig = rig();
        let device: Arc<dyn Device> = rig.device.clone();
        let result = BufferFiller::start( device, rig.source, session( 1.0, 4 ), rig.slots.clone(), config(), false );

        assert!( matches!(
            result,
            Err( FillerError::Device( DeviceError::UnsupportedFormat { channels: 1, bits: 32 } ) )
        ));
    }
}
