//! Command-line argument parsing for Hissing.

use std::path::PathBuf;

use clap::Parser;


/// Hissing - plays media files through ffmpeg in the terminal.
#[derive( Parser, Debug )]
#[command( name = "hissing" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Stream through a buffer queue instead of decoding each file up front.
    #[arg( short, long )]
    pub stream: bool,

    /// Loop the current file.
    #[arg( short, long = "loop" )]
    pub looped: bool,

    /// ffmpeg executable to decode with.
    #[arg( long )]
    pub ffmpeg: Option<PathBuf>,

    /// Frames decoded per chunk.
    #[arg( long )]
    pub chunk_frames: Option<usize>,

    /// Buffers cycling through the queue when streaming.
    #[arg( long )]
    pub buffers: Option<usize>,

    /// Starting volume, 0 to 100.
    #[arg( long )]
    pub volume: Option<f32>,

    /// Print stream information for each file and exit.
    #[arg( long )]
    pub probe: bool,

    /// Print the samples at these times (seconds) of each file and exit.
    #[arg( long, value_delimiter = ',' )]
    pub sample: Vec<f64>,

    /// Files to play, in order.
    #[arg( required = true )]
    pub files: Vec<PathBuf>,
}
