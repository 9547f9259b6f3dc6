//! Software playback device on cpal
//!
//! Keeps sources, buffers and per-source queues in memory and mixes every
//! playing source into the system output stream. Queue semantics follow the
//! native buffer-queue APIs: a buffer the source has finished stays in the
//! queue as "processed" until it is unqueued, the sample offset is counted
//! from the head of the queue, and a queued buffer can neither be
//! overwritten nor deleted.

use std::collections::{ HashMap, VecDeque };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::sync::atomic::{ AtomicU64, Ordering };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };

use crate::device::{
    BufferFormat, BufferId, Device, DeviceError, ErrorCode, FloatParam, SourceId,
    SourceState, VectorParam,
};


/// Decoded contents of one device buffer.
#[derive( Debug, Default )]
struct SoftBuffer {
    /// Interleaved samples normalised to [-1.0, 1.0]
    samples: Vec<f32>,
    channels: usize,
    frequency: u32,
    bytes: usize,
}


impl SoftBuffer {
    fn frames( &self ) -> usize {
        if self.channels == 0 { 0 } else { self.samples.len() / self.channels }
    }


    /// Sample for an output channel, mapping the buffer's channels onto it.
    fn sample( &self, frame: usize, out_channel: usize, out_channels: usize ) -> f32 {
        let base = frame * self.channels;
        if self.channels == 1 {
            self.samples[ base ]
        } else if out_channels == 1 {
            // Mix down to mono
            let sum: f32 = self.samples[ base..base + self.channels ].iter().sum();
            sum / self.channels as f32
        } else {
            self.samples[ base + out_channel % self.channels ]
        }
    }
}


#[derive( Debug )]
struct SoftSource {
    state: SourceState,
    queue: VecDeque<BufferId>,
    /// Number of queue entries the source has finished with
    processed: usize,
    /// Fractional frame position inside the current buffer
    cursor: f64,
    /// Set when the queue holds a single attached buffer
    attached: bool,
    /// Stopped by request; the offset reads zero until the next start
    halted: bool,
    looping: bool,
    gain: f32,
    pitch: f32,
    position: [f32; 3],
    velocity: [f32; 3],
}


impl Default for SoftSource {
    fn default() -> Self {
        Self {
            state: SourceState::Initial,
            queue: VecDeque::new(),
            processed: 0,
            cursor: 0.0,
            attached: false,
            halted: false,
            looping: false,
            gain: 1.0,
            pitch: 1.0,
            position: [0.0; 3],
            velocity: [0.0; 3],
        }
    }
}


impl SoftSource {
    fn restart( &mut self ) {
        self.processed = 0;
        self.cursor = 0.0;
        self.halted = false;
    }
}


/// Shared device state, locked by both the API and the output callback.
#[derive( Debug )]
struct Mixer {
    rate: u32,
    channels: u16,
    next_id: u32,
    buffers: HashMap<BufferId, SoftBuffer>,
    sources: HashMap<SourceId, SoftSource>,
    listener: [f32; 3],
    closed: bool,
}


impl Mixer {
    fn new( rate: u32, channels: u16 ) -> Self {
        Self {
            rate,
            channels,
            next_id: 1,
            buffers: HashMap::new(),
            sources: HashMap::new(),
            listener: [0.0; 3],
            closed: false,
        }
    }


    fn alloc_id( &mut self ) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }


    fn source( &mut self, id: SourceId ) -> Result<&mut SoftSource, DeviceError> {
        self.sources.get_mut( &id ).ok_or( DeviceError::Code( ErrorCode::InvalidName ) )
    }


    fn buffer_in_use( &self, id: BufferId ) -> bool {
        self.sources.values().any( |s| s.queue.contains( &id ) )
    }


    fn sample_offset( &self, src: &SoftSource ) -> u64 {
        if src.halted {
            return 0;
        }
        let finished: usize = src.queue
            .iter()
            .take( src.processed )
            .map( |id| self.buffers.get( id ).map( SoftBuffer::frames ).unwrap_or( 0 ) )
            .sum();
        finished as u64 + src.cursor.floor() as u64
    }


    /// Mixes every playing source into `out` (interleaved, device channels).
    fn render( &mut self, out: &mut [f32] ) {
        for sample in out.iter_mut() {
            *sample = 0.0;
        }

        let out_channels = self.channels as usize;
        if out_channels == 0 {
            return;
        }
        let out_frames = out.len() / out_channels;
        let rate = self.rate as f64;

        let buffers = &self.buffers;
        for src in self.sources.values_mut() {
            let mut frame = 0;

            while frame < out_frames && src.state == SourceState::Playing {
                let Some( buffer ) = src.queue.get( src.processed ).and_then( |id| buffers.get( id ) ) else {
                    // Queue ran dry
                    src.state = SourceState::Stopped;
                    src.processed = src.queue.len();
                    src.cursor = 0.0;
                    break;
                };

                let frames = buffer.frames();
                let step = buffer.frequency as f64 / rate * src.pitch.max( 0.0 ) as f64;

                if frames > 0 && step > 0.0 {
                    while frame < out_frames && src.cursor < frames as f64 {
                        let index = src.cursor.floor() as usize;
                        let next = ( index + 1 ).min( frames - 1 );
                        let frac = ( src.cursor - index as f64 ) as f32;

                        for ch in 0..out_channels {
                            let a = buffer.sample( index, ch, out_channels );
                            let b = buffer.sample( next, ch, out_channels );
                            out[ frame * out_channels + ch ] += ( a + ( b - a ) * frac ) * src.gain;
                        }

                        src.cursor += step;
                        frame += 1;
                    }

                    if src.cursor < frames as f64 {
                        break;
                    }
                    src.cursor -= frames as f64;
                } else {
                    src.cursor = 0.0;
                }

                if src.attached && src.looping {
                    continue;
                }

                src.processed += 1;
                if src.processed >= src.queue.len() {
                    // Keep the offset at the end of the queue
                    src.state = SourceState::Stopped;
                    src.processed = src.queue.len();
                    src.cursor = 0.0;
                }
            }
        }
    }
}


/// Converts PCM bytes into normalised interleaved samples.
fn decode_pcm( format: BufferFormat, data: &[u8] ) -> Vec<f32> {
    match format.byte_width() {
        1 => data.iter().map( |&b| ( b as f32 - 128.0 ) / 128.0 ).collect(),
        _ => data
            .chunks_exact( 2 )
            .map( |pair| i16::from_le_bytes([ pair[ 0 ], pair[ 1 ] ]) as f32 / 32768.0 )
            .collect(),
    }
}


/// Wrapper around cpal::Stream so the device can be shared across threads.
///
/// SAFETY: the stream is never used after creation except to be paused and
/// dropped by `close()`; all audio work happens on cpal's own callback
/// thread, which only touches the mutex-guarded mixer.
struct StreamHandle( cpal::Stream );

unsafe impl Send for StreamHandle {}
unsafe impl Sync for StreamHandle {}


/// In-memory device mixing its sources into the default output.
pub struct SoftDevice {
    mixer: Arc<Mutex<Mixer>>,
    stream: Mutex<Option<StreamHandle>>,
    calls: AtomicU64,
}


impl SoftDevice {
    /// Opens the default output device and starts mixing into it.
    pub fn open() -> Result<Self, DeviceError> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or( DeviceError::NoOutputDevice )?;

        tracing::info!( "Using output device: {:?}", device.name() );

        let config = device
            .default_output_config()
            .map_err( |e| DeviceError::Stream( e.to_string() ) )?
            .config();

        tracing::info!(
            "Audio output config: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let mixer = Arc::new( Mutex::new( Mixer::new( config.sample_rate.0, config.channels ) ) );
        let mixer_clone = Arc::clone( &mixer );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mixer_clone
                        .lock()
                        .unwrap_or_else( PoisonError::into_inner )
                        .render( data );
                },
                |err| {
                    tracing::error!( "Audio output error: {}", err );
                },
                None,
            )
            .map_err( |e| DeviceError::Stream( e.to_string() ) )?;

        stream.play().map_err( |e| DeviceError::Stream( e.to_string() ) )?;

        Ok( Self {
            mixer,
            stream: Mutex::new( Some( StreamHandle( stream ) ) ),
            calls: AtomicU64::new( 0 ),
        })
    }


    /// Creates a device without an output stream.
    ///
    /// Nothing plays until `render` pulls frames, which makes playback
    /// progress fully controlled by the caller.
    pub fn headless( rate: u32, channels: u16 ) -> Self {
        Self {
            mixer: Arc::new( Mutex::new( Mixer::new( rate, channels ) ) ),
            stream: Mutex::new( None ),
            calls: AtomicU64::new( 0 ),
        }
    }


    /// Pulls interleaved output frames, advancing every playing source.
    pub fn render( &self, out: &mut [f32] ) {
        self.lock().render( out );
    }


    /// Output sample rate.
    pub fn rate( &self ) -> u32 {
        self.lock().rate
    }


    /// Output channel count.
    pub fn channels( &self ) -> u16 {
        self.lock().channels
    }


    /// Total number of `Device` calls made so far.
    pub fn call_count( &self ) -> u64 {
        self.calls.load( Ordering::SeqCst )
    }


    /// Size in bytes of the data last uploaded into a buffer.
    pub fn buffer_bytes( &self, buffer: BufferId ) -> Option<usize> {
        self.lock().buffers.get( &buffer ).map( |b| b.bytes )
    }


    fn lock( &self ) -> MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Counts the call and runs it against the open mixer.
    fn call<T>( &self, f: impl FnOnce( &mut Mixer ) -> Result<T, DeviceError> ) -> Result<T, DeviceError> {
        self.calls.fetch_add( 1, Ordering::SeqCst );
        let mut mixer = self.lock();
        if mixer.closed {
            return Err( DeviceError::Code( ErrorCode::InvalidContext ) );
        }
        f( &mut mixer )
    }
}


impl Device for SoftDevice {
    fn create_source( &self ) -> Result<SourceId, DeviceError> {
        self.call( |m| {
            let id = SourceId( m.alloc_id() );
            m.sources.insert( id, SoftSource::default() );
            Ok( id )
        })
    }


    fn delete_source( &self, source: SourceId ) -> Result<(), DeviceError> {
        self.call( |m| {
            m.sources.remove( &source ).map( |_| () ).ok_or( DeviceError::Code( ErrorCode::InvalidName ) )
        })
    }


    fn create_buffers( &self, count: usize ) -> Result<Vec<BufferId>, DeviceError> {
        self.call( |m| {
            let ids: Vec<BufferId> = ( 0..count ).map( |_| BufferId( m.alloc_id() ) ).collect();
            for id in &ids {
                m.buffers.insert( *id, SoftBuffer::default() );
            }
            Ok( ids )
        })
    }


    fn delete_buffers( &self, buffers: &[BufferId] ) -> Result<(), DeviceError> {
        self.call( |m| {
            for id in buffers {
                if !m.buffers.contains_key( id ) {
                    return Err( DeviceError::Code( ErrorCode::InvalidName ) );
                }
                if m.buffer_in_use( *id ) {
                    return Err( DeviceError::Code( ErrorCode::InvalidOperation ) );
                }
            }
            for id in buffers {
                m.buffers.remove( id );
            }
            Ok(())
        })
    }


    fn buffer_data(
        &self,
        buffer: BufferId,
        format: BufferFormat,
        data: &[u8],
        frequency: u32,
    ) -> Result<(), DeviceError> {
        self.call( |m| {
            if !m.buffers.contains_key( &buffer ) {
                return Err( DeviceError::Code( ErrorCode::InvalidName ) );
            }
            if frequency == 0 || data.len() % format.frame_bytes() != 0 {
                return Err( DeviceError::Code( ErrorCode::InvalidValue ) );
            }
            if m.buffer_in_use( buffer ) {
                return Err( DeviceError::Code( ErrorCode::InvalidOperation ) );
            }

            let slot = m.buffers.entry( buffer ).or_default();
            slot.samples = decode_pcm( format, data );
            slot.channels = format.channels() as usize;
            slot.frequency = frequency;
            slot.bytes = data.len();
            Ok(())
        })
    }


    fn attach_buffer( &self, source: SourceId, buffer: Option<BufferId> ) -> Result<(), DeviceError> {
        self.call( |m| {
            if let Some( id ) = buffer {
                if !m.buffers.contains_key( &id ) {
                    return Err( DeviceError::Code( ErrorCode::InvalidName ) );
                }
            }
            let src = m.source( source )?;
            if matches!( src.state, SourceState::Playing | SourceState::Paused ) {
                return Err( DeviceError::Code( ErrorCode::InvalidOperation ) );
            }
            src.queue.clear();
            src.restart();
            src.attached = buffer.is_some();
            src.queue.extend( buffer );
            Ok(())
        })
    }


    fn queue_buffers( &self, source: SourceId, buffers: &[BufferId] ) -> Result<(), DeviceError> {
        self.call( |m| {
            if buffers.iter().any( |id| !m.buffers.contains_key( id ) ) {
                return Err( DeviceError::Code( ErrorCode::InvalidName ) );
            }
            let src = m.source( source )?;
            if src.attached {
                return Err( DeviceError::Code( ErrorCode::InvalidOperation ) );
            }
            src.queue.extend( buffers.iter().copied() );
            Ok(())
        })
    }


    fn unqueue_buffers( &self, source: SourceId, count: usize ) -> Result<Vec<BufferId>, DeviceError> {
        self.call( |m| {
            let src = m.source( source )?;
            if src.attached || count > src.processed {
                return Err( DeviceError::Code( ErrorCode::InvalidValue ) );
            }
            let removed: Vec<BufferId> = src.queue.drain( ..count ).collect();
            src.processed -= count;
            Ok( removed )
        })
    }


    fn processed_buffers( &self, source: SourceId ) -> Result<usize, DeviceError> {
        self.call( |m| Ok( m.source( source )?.processed ) )
    }


    fn queued_buffers( &self, source: SourceId ) -> Result<usize, DeviceError> {
        self.call( |m| Ok( m.source( source )?.queue.len() ) )
    }


    fn source_state( &self, source: SourceId ) -> Result<SourceState, DeviceError> {
        self.call( |m| Ok( m.source( source )?.state ) )
    }


    fn sample_offset( &self, source: SourceId ) -> Result<u64, DeviceError> {
        self.call( |m| {
            let src = m.sources.get( &source ).ok_or( DeviceError::Code( ErrorCode::InvalidName ) )?;
            Ok( m.sample_offset( src ) )
        })
    }


    fn set_float( &self, source: SourceId, param: FloatParam, value: f32 ) -> Result<(), DeviceError> {
        self.call( |m| {
            if !value.is_finite() || value < 0.0 {
                return Err( DeviceError::Code( ErrorCode::InvalidValue ) );
            }
            let src = m.source( source )?;
            match param {
                FloatParam::Gain => src.gain = value,
                FloatParam::Pitch => src.pitch = value,
            }
            Ok(())
        })
    }


    fn float( &self, source: SourceId, param: FloatParam ) -> Result<f32, DeviceError> {
        self.call( |m| {
            let src = m.source( source )?;
            Ok( match param {
                FloatParam::Gain => src.gain,
                FloatParam::Pitch => src.pitch,
            })
        })
    }


    fn set_vector( &self, source: SourceId, param: VectorParam, value: [f32; 3] ) -> Result<(), DeviceError> {
        self.call( |m| {
            let src = m.source( source )?;
            match param {
                VectorParam::Position => src.position = value,
                VectorParam::Velocity => src.velocity = value,
            }
            Ok(())
        })
    }


    fn vector( &self, source: SourceId, param: VectorParam ) -> Result<[f32; 3], DeviceError> {
        self.call( |m| {
            let src = m.source( source )?;
            Ok( match param {
                VectorParam::Position => src.position,
                VectorParam::Velocity => src.velocity,
            })
        })
    }


    fn set_looping( &self, source: SourceId, looping: bool ) -> Result<(), DeviceError> {
        self.call( |m| {
            m.source( source )?.looping = looping;
            Ok(())
        })
    }


    fn looping( &self, source: SourceId ) -> Result<bool, DeviceError> {
        self.call( |m| Ok( m.source( source )?.looping ) )
    }


    fn play( &self, source: SourceId ) -> Result<(), DeviceError> {
        self.call( |m| {
            let src = m.source( source )?;
            match src.state {
                SourceState::Playing => {}
                SourceState::Paused => src.state = SourceState::Playing,
                SourceState::Initial | SourceState::Stopped => {
                    src.restart();
                    src.state = SourceState::Playing;
                }
            }
            Ok(())
        })
    }


    fn pause( &self, source: SourceId ) -> Result<(), DeviceError> {
        self.call( |m| {
            let src = m.source( source )?;
            if src.state == SourceState::Playing {
                src.state = SourceState::Paused;
            }
            Ok(())
        })
    }


    fn stop( &self, source: SourceId ) -> Result<(), DeviceError> {
        self.call( |m| {
            let src = m.source( source )?;
            src.state = SourceState::Stopped;
            src.processed = src.queue.len();
            src.cursor = 0.0;
            src.halted = true;
            Ok(())
        })
    }


    fn rewind( &self, source: SourceId ) -> Result<(), DeviceError> {
        self.call( |m| {
            let src = m.source( source )?;
            src.state = SourceState::Initial;
            src.restart();
            Ok(())
        })
    }


    fn set_listener_position( &self, position: [f32; 3] ) -> Result<(), DeviceError> {
        self.call( |m| {
            m.listener = position;
            Ok(())
        })
    }


    fn listener_position( &self ) -> Result<[f32; 3], DeviceError> {
        self.call( |m| Ok( m.listener ) )
    }


    fn close( &self ) -> Result<(), DeviceError> {
        self.calls.fetch_add( 1, Ordering::SeqCst );

        if let Some( handle ) = self.stream.lock().unwrap_or_else( PoisonError::into_inner ).take() {
            if let Err( e ) = handle.0.pause() {
                tracing::warn!( "Failed to pause output stream: {}", e );
            }
        }

        let mut mixer = self.lock();
        if !mixer.closed {
            mixer.closed = true;
            mixer.sources.clear();
            mixer.buffers.clear();
            tracing::info!( "Device closed" );
        }
        Ok(())
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn pcm16( values: &[i16] ) -> Vec<u8> {
        values.iter().flat_map( |v| v.to_le_bytes() ).collect()
    }


    #[test]
    fn test_static_buffer_plays_to_end() {
        let device = SoftDevice::headless( 100, 1 );
        let source = device.create_source().unwrap();
        let buffers = device.create_buffers( 1 ).unwrap();

        device.buffer_data( buffers[ 0 ], BufferFormat::Mono16, &pcm16( &[ 16384; 50 ] ), 100 ).unwrap();
        device.attach_buffer( source, Some( buffers[ 0 ] ) ).unwrap();
        assert_eq!( device.source_state( source ).unwrap(), SourceState::Initial );

        device.play( source ).unwrap();
        let mut out = vec![ 0.0; 20 ];
        device.render( &mut out );
        assert!( ( out[ 0 ] - 0.5 ).abs() < 1e-6 );
        assert_eq!( device.sample_offset( source ).unwrap(), 20 );

        let mut out = vec![ 0.0; 40 ];
        device.render( &mut out );
        assert_eq!( device.source_state( source ).unwrap(), SourceState::Stopped );
        assert_eq!( device.sample_offset( source ).unwrap(), 50 );
        // Frames past the end are silent
        assert_eq!( out[ 39 ], 0.0 );
    }


    #[test]
    fn test_looping_static_buffer_keeps_playing() {
        let device = SoftDevice::headless( 100, 1 );
        let source = device.create_source().unwrap();
        let buffers = device.create_buffers( 1 ).unwrap();

        device.buffer_data( buffers[ 0 ], BufferFormat::Mono16, &pcm16( &[ 1000; 10 ] ), 100 ).unwrap();
        device.attach_buffer( source, Some( buffers[ 0 ] ) ).unwrap();
        device.set_looping( source, true ).unwrap();
        device.play( source ).unwrap();

        let mut out = vec![ 0.0; 35 ];
        device.render( &mut out );
        assert_eq!( device.source_state( source ).unwrap(), SourceState::Playing );
        assert_eq!( device.sample_offset( source ).unwrap(), 5 );
    }


    #[test]
    fn test_queue_reports_processed_in_order() {
        let device = SoftDevice::headless( 100, 1 );
        let source = device.create_source().unwrap();
        let buffers = device.create_buffers( 3 ).unwrap();

        for ( i, id ) in buffers.iter().enumerate() {
            device.buffer_data( *id, BufferFormat::Mono16, &pcm16( &[ i as i16; 10 ] ), 100 ).unwrap();
        }
        device.queue_buffers( source, &buffers ).unwrap();
        device.play( source ).unwrap();

        let mut out = vec![ 0.0; 25 ];
        device.render( &mut out );
        assert_eq!( device.processed_buffers( source ).unwrap(), 2 );
        assert_eq!( device.sample_offset( source ).unwrap(), 25 );

        let removed = device.unqueue_buffers( source, 1 ).unwrap();
        assert_eq!( removed, vec![ buffers[ 0 ] ] );
        assert_eq!( device.processed_buffers( source ).unwrap(), 1 );
        assert_eq!( device.sample_offset( source ).unwrap(), 15 );
    }


    #[test]
    fn test_queued_buffer_cannot_be_overwritten_or_deleted() {
        let device = SoftDevice::headless( 100, 1 );
        let source = device.create_source().unwrap();
        let buffers = device.create_buffers( 1 ).unwrap();
        let data = pcm16( &[ 0; 10 ] );

        device.buffer_data( buffers[ 0 ], BufferFormat::Mono16, &data, 100 ).unwrap();
        device.queue_buffers( source, &buffers ).unwrap();

        let err = device.buffer_data( buffers[ 0 ], BufferFormat::Mono16, &data, 100 ).unwrap_err();
        assert_eq!( err.code(), Some( ErrorCode::InvalidOperation ) );

        let err = device.delete_buffers( &buffers ).unwrap_err();
        assert_eq!( err.code(), Some( ErrorCode::InvalidOperation ) );

        let err = device.unqueue_buffers( source, 1 ).unwrap_err();
        assert_eq!( err.code(), Some( ErrorCode::InvalidValue ) );
    }


    #[test]
    fn test_stop_marks_whole_queue_processed() {
        let device = SoftDevice::headless( 100, 1 );
        let source = device.create_source().unwrap();
        let buffers = device.create_buffers( 2 ).unwrap();

        for id in &buffers {
            device.buffer_data( *id, BufferFormat::Mono16, &pcm16( &[ 0; 10 ] ), 100 ).unwrap();
        }
        device.queue_buffers( source, &buffers ).unwrap();

        // Even a source that never played
        device.stop( source ).unwrap();
        assert_eq!( device.source_state( source ).unwrap(), SourceState::Stopped );
        assert_eq!( device.processed_buffers( source ).unwrap(), 2 );
        assert_eq!( device.sample_offset( source ).unwrap(), 0 );

        assert_eq!( device.unqueue_buffers( source, 2 ).unwrap(), buffers );
        device.delete_buffers( &buffers ).unwrap();
    }


    #[test]
    fn test_unknown_handles_are_invalid_names() {
        let device = SoftDevice::headless( 100, 1 );
        let err = device.play( SourceId( 99 ) ).unwrap_err();
        assert_eq!( err.code(), Some( ErrorCode::InvalidName ) );
        assert_eq!( err.to_string(), "Invalid name" );
    }


    #[test]
    fn test_pitch_scales_playback_rate() {
        let device = SoftDevice::headless( 100, 1 );
        let source = device.create_source().unwrap();
        let buffers = device.create_buffers( 1 ).unwrap();

        device.buffer_data( buffers[ 0 ], BufferFormat::Mono16, &pcm16( &[ 0; 100 ] ), 100 ).unwrap();
        device.attach_buffer( source, Some( buffers[ 0 ] ) ).unwrap();
        device.set_float( source, FloatParam::Pitch, 2.0 ).unwrap();
        device.play( source ).unwrap();

        let mut out = vec![ 0.0; 10 ];
        device.render( &mut out );
        assert_eq!( device.sample_offset( source ).unwrap(), 20 );
    }


    #[test]
    fn test_stereo_to_mono_mixdown() {
        let device = SoftDevice::headless( 100, 1 );
        let source = device.create_source().unwrap();
        let buffers = device.create_buffers( 1 ).unwrap();

        device.buffer_data( buffers[ 0 ], BufferFormat::Stereo16, &pcm16( &[ 16384, 0, 16384, 0 ] ), 100 ).unwrap();
        device.attach_buffer( source, Some( buffers[ 0 ] ) ).unwrap();
        device.play( source ).unwrap();

        let mut out = vec![ 0.0; 1 ];
        device.render( &mut out );
        assert!( ( out[ 0 ] - 0.25 ).abs() < 1e-6 );
    }


    #[test]
    fn test_closed_device_rejects_calls() {
        let device = SoftDevice::headless( 100, 1 );
        device.create_source().unwrap();
        device.close().unwrap();
        device.close().unwrap();

        let err = device.create_source().unwrap_err();
        assert_eq!( err.code(), Some( ErrorCode::InvalidContext ) );
    }
}
