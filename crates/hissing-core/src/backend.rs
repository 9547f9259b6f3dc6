//! External decoder process
//!
//! The engine never decodes media itself. It runs an ffmpeg-compatible
//! executable twice per file: once to print stream information, and once
//! per decode session to write raw PCM to its standard output.

use std::ffi::OsString;
use std::io::{ self, BufRead, BufReader, Read };
use std::path::{ Path, PathBuf };
use std::process::{ Child, ChildStdout, Command, Stdio };
use std::thread;

use crate::config::PcmFormat;
use crate::decoder::DecoderError;
use crate::probe::needs_full_decode;


/// The decoder lands this many seconds early and then discards the overlap,
/// giving it room to settle before the requested start.
const SEEK_PREROLL_SECS: f64 = 1.0;


/// A raw PCM byte stream produced by a decoder.
pub trait PcmPipe: Read + Send {
    /// Stops the producer and releases its resources. Idempotent.
    fn terminate( &mut self );
}


/// Access to an external media decoder.
pub trait MediaBackend: Send + Sync {
    /// Runs the decoder in information mode and returns its diagnostic text.
    fn report( &self, path: &Path ) -> Result<String, DecoderError>;


    /// Starts decoding `path` at `start` seconds into raw PCM.
    fn spawn( &self, path: &Path, start: f64, format: &PcmFormat ) -> Result<Box<dyn PcmPipe>, DecoderError>;
}


/// ffmpeg executable used as the media backend.
#[derive( Debug, Clone )]
pub struct Ffmpeg {
    program: PathBuf,
}


impl Ffmpeg {
    pub fn new( program: impl Into<PathBuf> ) -> Self {
        Self { program: program.into() }
    }


    pub fn program( &self ) -> &Path {
        &self.program
    }


    fn command( &self ) -> Command {
        let mut cmd = Command::new( &self.program );
        cmd.stdin( Stdio::null() );

        #[cfg( windows )]
        {
            use std::os::windows::process::CommandExt;
            // CREATE_NO_WINDOW
            cmd.creation_flags( 0x0800_0000 );
        }

        cmd
    }


    fn spawn_error( &self, source: io::Error ) -> DecoderError {
        DecoderError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}


impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new( "ffmpeg" )
    }
}


/// Arguments for an information run.
pub fn report_args( path: &Path ) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![ "-i".into(), path.into() ];
    if needs_full_decode( path ) {
        args.extend([ "-f", "null", "-" ].map( OsString::from ));
    }
    args
}


/// Arguments for a decode run starting at `start` seconds.
pub fn decode_args( path: &Path, start: f64, format: &PcmFormat ) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    if start > 0.0 {
        let offset = SEEK_PREROLL_SECS.min( start );
        args.push( "-ss".into() );
        args.push( format!( "{:.5}", start - offset ).into() );
        args.push( "-i".into() );
        args.push( path.into() );
        args.push( "-vn".into() );
        args.push( "-ss".into() );
        args.push( format!( "{:.5}", offset ).into() );
    } else {
        args.push( "-i".into() );
        args.push( path.into() );
        args.push( "-vn".into() );
    }

    for arg in [
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        format.decoder_format(),
        "-acodec".to_string(),
        format.decoder_codec(),
        "-ar".to_string(),
        format.sample_rate.to_string(),
        "-ac".to_string(),
        format.channels.to_string(),
        "-".to_string(),
    ] {
        args.push( arg.into() );
    }

    args
}


impl MediaBackend for Ffmpeg {
    fn report( &self, path: &Path ) -> Result<String, DecoderError> {
        let output = self
            .command()
            .args( report_args( path ) )
            .stdout( Stdio::null() )
            .stderr( Stdio::piped() )
            .output()
            .map_err( |e| self.spawn_error( e ) )?;

        // Exit status is non-zero without an output file; the text is what matters
        Ok( String::from_utf8_lossy( &output.stderr ).into_owned() )
    }


    fn spawn( &self, path: &Path, start: f64, format: &PcmFormat ) -> Result<Box<dyn PcmPipe>, DecoderError> {
        let args = decode_args( path, start, format );
        tracing::debug!( "Spawning {:?} {:?}", self.program, args );

        let mut child = self
            .command()
            .args( &args )
            .stdout( Stdio::piped() )
            .stderr( Stdio::piped() )
            .spawn()
            .map_err( |e| self.spawn_error( e ) )?;

        let stdout = child.stdout.take();

        // Forward decoder complaints to the log until the pipe closes
        let stderr_thread = child.stderr.take().map( |stderr| {
            thread::spawn( move || {
                for line in BufReader::new( stderr ).lines().map_while( Result::ok ) {
                    tracing::warn!( "decoder: {}", line );
                }
            })
        });

        Ok( Box::new( FfmpegPipe {
            child,
            stdout,
            stderr_thread,
        }))
    }
}


/// Running decoder process writing PCM to its standard output.
struct FfmpegPipe {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_thread: Option<thread::JoinHandle<()>>,
}


impl Read for FfmpegPipe {
    fn read( &mut self, buf: &mut [u8] ) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some( stdout ) => stdout.read( buf ),
            None => Ok( 0 ),
        }
    }
}


impl PcmPipe for FfmpegPipe {
    fn terminate( &mut self ) {
        // Closing our end first unblocks a decoder stuck writing
        let Some( stdout ) = self.stdout.take() else {
            return;
        };
        drop( stdout );

        if let Err( e ) = self.child.kill() {
            // Already exited
            if e.kind() != io::ErrorKind::InvalidInput {
                tracing::warn!( "Failed to kill decoder: {}", e );
            }
        }
        if let Err( e ) = self.child.wait() {
            tracing::warn!( "Failed to reap decoder: {}", e );
        }
        if let Some( handle ) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}


impl Drop for FfmpegPipe {
    fn drop( &mut self ) {
        self.terminate();
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn strings( args: Vec<OsString> ) -> Vec<String> {
        args.into_iter().map( |a| a.to_string_lossy().into_owned() ).collect()
    }


    #[test]
    fn test_decode_args_from_start() {
        let format = PcmFormat { sample_rate: 44100, channels: 1, byte_width: 2 };
        let args = strings( decode_args( Path::new( "song.ogg" ), 0.0, &format ) );

        assert_eq!( args, vec![
            "-i", "song.ogg", "-vn", "-loglevel", "error", "-f", "s16le",
            "-acodec", "pcm_s16le", "-ar", "44100", "-ac", "1", "-",
        ]);
    }


    #[test]
    fn test_decode_args_with_preroll() {
        let args = strings( decode_args( Path::new( "song.ogg" ), 12.5, &PcmFormat::default() ) );
        assert_eq!( &args[ ..7 ], &[ "-ss", "11.50000", "-i", "song.ogg", "-vn", "-ss", "1.00000" ] );
    }


    #[test]
    fn test_decode_args_preroll_shorter_than_second() {
        let args = strings( decode_args( Path::new( "song.ogg" ), 0.25, &PcmFormat::default() ) );
        assert_eq!( &args[ ..7 ], &[ "-ss", "0.00000", "-i", "song.ogg", "-vn", "-ss", "0.25000" ] );
    }


    #[test]
    fn test_report_args_force_null_output_for_gif() {
        assert_eq!( strings( report_args( Path::new( "a.mp3" ) ) ), vec![ "-i", "a.mp3" ] );
        assert_eq!(
            strings( report_args( Path::new( "a.gif" ) ) ),
            vec![ "-i", "a.gif", "-f", "null", "-" ]
        );
    }


    #[test]
    fn test_missing_executable_is_spawn_error() {
        let backend = Ffmpeg::new( "/nonexistent/hissing-decoder" );
        let result = backend.report( Path::new( "a.mp3" ) );
        assert!( matches!( result, Err( DecoderError::Spawn { .. } ) ) );
    }
}
