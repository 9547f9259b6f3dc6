//! Hissing Core - Media playback through an external decoder
//!
//! This crate decodes media files by running an ffmpeg-compatible process
//! and plays the resulting PCM on a buffer-queue playback device, either
//! from one static buffer or streamed through a background buffer filler.
//! A windowed frame cache offers random access to decoded samples.

pub mod backend;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod device;
pub mod filler;
pub mod manager;
pub mod probe;
pub mod soft;
pub mod sound;

#[cfg( test )]
mod testing;

pub use backend::{ Ffmpeg, MediaBackend, PcmPipe };
pub use cache::FrameCache;
pub use config::{ DecoderConfig, FillerConfig, ManagerConfig, PcmFormat, RateSource };
pub use decoder::{ DecodeSession, DecoderError };
pub use device::{ BufferFormat, BufferId, Device, DeviceError, ErrorCode, SourceId, SourceState };
pub use filler::{ BufferFiller, FillerError, FillerExit };
pub use manager::{ Manager, SoundId };
pub use probe::{ MediaStreamInfo, VideoInfo };
pub use soft::SoftDevice;
pub use sound::{ LoadMode, PlaybackState, Sound, SourceError };
