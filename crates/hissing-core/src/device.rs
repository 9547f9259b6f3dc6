//! Playback device surface
//!
//! The narrow contract the engine needs from a sound device: sources,
//! buffers, a per-source buffer queue, and a handful of source parameters.
//! It follows the shape of the classic native buffer-queue audio APIs, so an
//! implementation backed by such a library maps onto it one call per method.

use std::fmt;

use thiserror::Error;


/// Raw code reported when a call succeeded, in both error tables.
pub const NO_ERROR: i32 = 0;


/// Device error codes, mirroring the native error tables.
///
/// Source and buffer calls report through the global table, device and
/// context calls through the context table. Both share numeric ranges, so a
/// raw value is only meaningful together with the table it came from.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum ErrorCode {
    InvalidName,
    InvalidEnum,
    InvalidValue,
    InvalidOperation,
    OutOfMemory,
    InvalidDevice,
    InvalidContext,
    InvalidContextEnum,
    InvalidContextValue,
    ContextOutOfMemory,
    Unknown( i32 ),
}


impl ErrorCode {
    /// Maps a raw code from the global table. `NO_ERROR` has no variant.
    pub fn from_global( raw: i32 ) -> Option<Self> {
        match raw {
            NO_ERROR => None,
            0xA001 => Some( ErrorCode::InvalidName ),
            0xA002 => Some( ErrorCode::InvalidEnum ),
            0xA003 => Some( ErrorCode::InvalidValue ),
            0xA004 => Some( ErrorCode::InvalidOperation ),
            0xA005 => Some( ErrorCode::OutOfMemory ),
            other => Some( ErrorCode::Unknown( other ) ),
        }
    }


    /// Maps a raw code from the device/context table.
    pub fn from_context( raw: i32 ) -> Option<Self> {
        match raw {
            NO_ERROR => None,
            0xA001 => Some( ErrorCode::InvalidDevice ),
            0xA002 => Some( ErrorCode::InvalidContext ),
            0xA003 => Some( ErrorCode::InvalidContextEnum ),
            0xA004 => Some( ErrorCode::InvalidContextValue ),
            0xA005 => Some( ErrorCode::ContextOutOfMemory ),
            other => Some( ErrorCode::Unknown( other ) ),
        }
    }


    /// Human readable message from the fixed table.
    pub fn message( self ) -> String {
        match self {
            ErrorCode::InvalidName => "Invalid name".into(),
            ErrorCode::InvalidEnum => "Invalid enum".into(),
            ErrorCode::InvalidValue => "Invalid value".into(),
            ErrorCode::InvalidOperation => "Invalid operation".into(),
            ErrorCode::OutOfMemory | ErrorCode::ContextOutOfMemory => "Out of memory".into(),
            ErrorCode::InvalidDevice => "Invalid device".into(),
            ErrorCode::InvalidContext => "Invalid context".into(),
            ErrorCode::InvalidContextEnum => "Invalid context enum".into(),
            ErrorCode::InvalidContextValue => "Invalid context value".into(),
            ErrorCode::Unknown( raw ) => format!( "Unknown error code {}", raw ),
        }
    }


    /// Turns a raw last-error value into a result.
    ///
    /// `context` selects the device/context table, otherwise the global one.
    pub fn check( raw: i32, context: bool ) -> Result<(), DeviceError> {
        let code = if context { Self::from_context( raw ) } else { Self::from_global( raw ) };
        match code {
            None => Ok(()),
            Some( code ) => Err( DeviceError::Code( code ) ),
        }
    }
}


impl fmt::Display for ErrorCode {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.write_str( &self.message() )
    }
}


/// Errors reported by a playback device.
#[derive( Debug, Clone, Error )]
pub enum DeviceError {
    #[error( "{0}" )]
    Code( ErrorCode ),

    #[error( "Unsupported sound format: {channels} channels, {bits} bits" )]
    UnsupportedFormat { channels: u16, bits: u16 },

    #[error( "No output device available" )]
    NoOutputDevice,

    #[error( "Output stream error: {0}" )]
    Stream( String ),
}


impl DeviceError {
    /// Returns the device error code, if this error carries one.
    pub fn code( &self ) -> Option<ErrorCode> {
        match self {
            DeviceError::Code( code ) => Some( *code ),
            _ => None,
        }
    }
}


impl From<ErrorCode> for DeviceError {
    fn from( code: ErrorCode ) -> Self {
        DeviceError::Code( code )
    }
}


/// Device source handle.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord )]
pub struct SourceId( pub u32 );


/// Device buffer handle.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord )]
pub struct BufferId( pub u32 );


/// PCM layout of a device buffer.
///
/// 8-bit data is unsigned, 16-bit data is signed little-endian.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum BufferFormat {
    Mono8,
    Mono16,
    Stereo8,
    Stereo16,
}


impl BufferFormat {
    /// Picks the buffer format for a channel count and bit depth.
    pub fn from_layout( channels: u16, bits: u16 ) -> Result<Self, DeviceError> {
        match ( channels, bits ) {
            ( 1, 8 ) => Ok( BufferFormat::Mono8 ),
            ( 1, 16 ) => Ok( BufferFormat::Mono16 ),
            ( 2, 8 ) => Ok( BufferFormat::Stereo8 ),
            ( 2, 16 ) => Ok( BufferFormat::Stereo16 ),
            _ => Err( DeviceError::UnsupportedFormat { channels, bits } ),
        }
    }


    pub fn channels( self ) -> u16 {
        match self {
            BufferFormat::Mono8 | BufferFormat::Mono16 => 1,
            BufferFormat::Stereo8 | BufferFormat::Stereo16 => 2,
        }
    }


    /// Bytes per sample of one channel.
    pub fn byte_width( self ) -> usize {
        match self {
            BufferFormat::Mono8 | BufferFormat::Stereo8 => 1,
            BufferFormat::Mono16 | BufferFormat::Stereo16 => 2,
        }
    }


    /// Bytes per interleaved frame.
    pub fn frame_bytes( self ) -> usize {
        self.channels() as usize * self.byte_width()
    }
}


/// State of a device source.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum SourceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}


/// Scalar source parameters.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum FloatParam {
    Gain,
    Pitch,
}


/// Vector source parameters.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum VectorParam {
    Position,
    Velocity,
}


/// A sound device with per-source buffer queues.
///
/// Every call reports failures synchronously. Implementations must be safe
/// to drive from several threads; a streaming source's producer thread calls
/// into the device concurrently with the owner.
pub trait Device: Send + Sync {
    fn create_source( &self ) -> Result<SourceId, DeviceError>;

    fn delete_source( &self, source: SourceId ) -> Result<(), DeviceError>;

    fn create_buffers( &self, count: usize ) -> Result<Vec<BufferId>, DeviceError>;

    /// Deletes buffers. Fails for a buffer that is still queued or attached.
    fn delete_buffers( &self, buffers: &[BufferId] ) -> Result<(), DeviceError>;

    /// Uploads PCM bytes into a buffer that is not currently queued.
    fn buffer_data(
        &self,
        buffer: BufferId,
        format: BufferFormat,
        data: &[u8],
        frequency: u32,
    ) -> Result<(), DeviceError>;

    /// Attaches a single static buffer, or detaches everything with `None`.
    fn attach_buffer( &self, source: SourceId, buffer: Option<BufferId> ) -> Result<(), DeviceError>;

    /// Appends buffers to the tail of the source's playback queue.
    fn queue_buffers( &self, source: SourceId, buffers: &[BufferId] ) -> Result<(), DeviceError>;

    /// Removes `count` processed buffers from the head of the queue.
    fn unqueue_buffers( &self, source: SourceId, count: usize ) -> Result<Vec<BufferId>, DeviceError>;

    /// Number of queued buffers the source has finished with.
    fn processed_buffers( &self, source: SourceId ) -> Result<usize, DeviceError>;

    /// Number of buffers currently in the source's queue.
    fn queued_buffers( &self, source: SourceId ) -> Result<usize, DeviceError>;

    fn source_state( &self, source: SourceId ) -> Result<SourceState, DeviceError>;

    /// Playback offset in frames, counted from the head of the queue.
    fn sample_offset( &self, source: SourceId ) -> Result<u64, DeviceError>;

    fn set_float( &self, source: SourceId, param: FloatParam, value: f32 ) -> Result<(), DeviceError>;

    fn float( &self, source: SourceId, param: FloatParam ) -> Result<f32, DeviceError>;

    fn set_vector( &self, source: SourceId, param: VectorParam, value: [f32; 3] ) -> Result<(), DeviceError>;

    fn vector( &self, source: SourceId, param: VectorParam ) -> Result<[f32; 3], DeviceError>;

    fn set_looping( &self, source: SourceId, looping: bool ) -> Result<(), DeviceError>;

    fn looping( &self, source: SourceId ) -> Result<bool, DeviceError>;

    fn play( &self, source: SourceId ) -> Result<(), DeviceError>;

    fn pause( &self, source: SourceId ) -> Result<(), DeviceError>;

    fn stop( &self, source: SourceId ) -> Result<(), DeviceError>;

    fn rewind( &self, source: SourceId ) -> Result<(), DeviceError>;

    fn set_listener_position( &self, position: [f32; 3] ) -> Result<(), DeviceError>;

    fn listener_position( &self ) -> Result<[f32; 3], DeviceError>;

    /// Releases the output stream and context. Idempotent.
    fn close( &self ) -> Result<(), DeviceError>;
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_error_messages() {
        assert_eq!( ErrorCode::InvalidName.message(), "Invalid name" );
        assert_eq!( ErrorCode::OutOfMemory.message(), "Out of memory" );
        assert_eq!( ErrorCode::InvalidContext.message(), "Invalid context" );
        assert_eq!( ErrorCode::Unknown( 42 ).message(), "Unknown error code 42" );
    }


    #[test]
    fn test_check_raw_codes() {
        assert!( ErrorCode::check( NO_ERROR, false ).is_ok() );
        assert!( ErrorCode::check( NO_ERROR, true ).is_ok() );

        let err = ErrorCode::check( 0xA004, false ).unwrap_err();
        assert_eq!( err.code(), Some( ErrorCode::InvalidOperation ) );
        assert_eq!( err.to_string(), "Invalid operation" );

        let err = ErrorCode::check( 7, false ).unwrap_err();
        assert_eq!( err.to_string(), "Unknown error code 7" );
    }


    #[test]
    fn test_tables_share_numeric_range() {
        assert_eq!( ErrorCode::from_global( 0xA001 ), Some( ErrorCode::InvalidName ) );
        assert_eq!( ErrorCode::from_context( 0xA001 ), Some( ErrorCode::InvalidDevice ) );
        assert_eq!( ErrorCode::from_context( 0xA002 ).map( ErrorCode::message ).as_deref(), Some( "Invalid context" ) );
    }


    #[test]
    fn test_buffer_format_from_layout() {
        assert_eq!( BufferFormat::from_layout( 1, 16 ).unwrap(), BufferFormat::Mono16 );
        assert_eq!( BufferFormat::from_layout( 2, 8 ).unwrap(), BufferFormat::Stereo8 );
        assert_eq!( BufferFormat::Stereo16.frame_bytes(), 4 );

        let result = BufferFormat::from_layout( 6, 16 );
        assert!( matches!( result, Err( DeviceError::UnsupportedFormat { channels: 6, bits: 16 } ) ) );

        let result = BufferFormat::from_layout( 2, 24 );
        assert!( matches!( result, Err( DeviceError::UnsupportedFormat { .. } ) ) );
    }
}
