//! Decoder report parsing
//!
//! The decoder prints stream information on its diagnostic output when run
//! with only an input file. This module extracts duration, video geometry,
//! frame rate and the audio sample rate from that text.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{ PcmFormat, RateSource };
use crate::decoder::DecoderError;


/// Broadcast rates the decoder reports rounded when they are really x * 1000/1001.
const NTSC_BASES: [f64; 5] = [ 23.0, 24.0, 25.0, 30.0, 50.0 ];

/// Distance under which a reported rate snaps to its x * 1000/1001 value.
const NTSC_EPSILON: f64 = 0.01;


/// Video stream properties. Carried along but not used for audio playback.
#[derive( Debug, Clone, PartialEq )]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Rotation in degrees from the stream's metadata
    pub rotation: u32,
    pub frame_count: u64,
}


/// Probed properties of a media file, computed once per file.
#[derive( Debug, Clone, PartialEq )]
pub struct MediaStreamInfo {
    /// Duration in seconds
    pub duration: f64,
    /// Output sample rate the file is decoded at
    pub sample_rate: u32,
    pub channels: u16,
    pub byte_width: u8,
    /// `floor(sample_rate * duration) + 1`
    pub frame_count: u64,
    /// Sample rate of the file's own audio stream, if reported
    pub source_rate: Option<u32>,
    pub video: Option<VideoInfo>,
}


/// Duration as an exact fraction, so frame counts do not suffer float rounding.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
struct Timestamp {
    numerator: u64,
    denominator: u64,
}


impl Timestamp {
    fn secs( self ) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }


    fn frames_at( self, rate: u64 ) -> u64 {
        rate * self.numerator / self.denominator
    }
}


fn regex( cell: &'static OnceLock<Regex>, pattern: &str ) -> &'static Regex {
    cell.get_or_init( || Regex::new( pattern ).expect( "static pattern" ) )
}


fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex( &RE, r"(\d{2}):(\d{2}):(\d{2})\.(\d+)" )
}


fn size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex( &RE, r" (\d+)x(\d+)[, ]" )
}


fn tbr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex( &RE, r" ([0-9.]+)(k?) tbr" )
}


fn fps_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex( &RE, r" ([0-9.]+) fps" )
}


fn hz_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex( &RE, r" (\d+) Hz" )
}


fn rotate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex( &RE, r"rotate\s+:\s*(\d+)$" )
}


fn geometry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex( &RE, r"\d+x\d+" )
}


/// Parses an `HH:MM:SS.ff` timestamp.
fn parse_timestamp( line: &str ) -> Option<Timestamp> {
    let caps = timestamp_re().captures( line )?;
    let hours: u64 = caps[ 1 ].parse().ok()?;
    let minutes: u64 = caps[ 2 ].parse().ok()?;
    let seconds: u64 = caps[ 3 ].parse().ok()?;
    let fraction = &caps[ 4 ];
    let denominator = 10u64.checked_pow( fraction.len() as u32 )?;
    let whole = hours * 3600 + minutes * 60 + seconds;

    Some( Timestamp {
        numerator: whole * denominator + fraction.parse::<u64>().ok()?,
        denominator,
    })
}


/// Parses the "tbr" value, which may carry a `k` (thousands) suffix.
fn parse_tbr( line: &str ) -> Option<f64> {
    let caps = tbr_re().captures( line )?;
    let value: f64 = caps[ 1 ].parse().ok()?;
    Some( if &caps[ 2 ] == "k" { value * 1000.0 } else { value } )
}


fn parse_fps( line: &str ) -> Option<f64> {
    fps_re().captures( line )?[ 1 ].parse().ok()
}


/// Snaps rates like 23.98 to their exact 24 * 1000/1001 value.
pub fn correct_frame_rate( fps: f64 ) -> f64 {
    let coef = 1000.0 / 1001.0;
    for base in NTSC_BASES {
        if fps != base && ( fps - base * coef ).abs() < NTSC_EPSILON {
            return base * coef;
        }
    }
    fps
}


fn probe_error( field: &'static str, path: &Path, report: &str ) -> DecoderError {
    DecoderError::Probe {
        field,
        path: path.to_path_buf(),
        report: report.to_string(),
    }
}


/// Returns true for containers whose duration only shows up while decoding.
pub fn needs_full_decode( path: &Path ) -> bool {
    path.extension()
        .and_then( |e| e.to_str() )
        .map( |e| e.eq_ignore_ascii_case( "gif" ) )
        .unwrap_or( false )
}


/// Extracts stream information from a decoder report.
///
/// @param report - Diagnostic text printed by the decoder for `path`
/// @param path - The probed file, used for messages and container quirks
/// @param rate_source - Which frame-rate field to trust first
/// @param format - Output format the file will be decoded to
pub fn parse_report(
    report: &str,
    path: &Path,
    rate_source: RateSource,
    format: PcmFormat,
) -> Result<MediaStreamInfo, DecoderError> {
    let lines: Vec<&str> = report.lines().collect();

    if lines.last().map( |l| l.contains( "No such file or directory" ) ).unwrap_or( false ) {
        return Err( DecoderError::NotFound( path.to_path_buf() ) );
    }

    // Animated GIFs report their length on the last progress line
    let is_gif = needs_full_decode( path );
    let keyword = if is_gif { "frame=" } else { "Duration: " };
    let mut duration_lines = lines.iter().filter( |l| l.contains( keyword ) );
    let duration_line = if is_gif { duration_lines.last() } else { duration_lines.next() };

    let duration = duration_line
        .and_then( |line| parse_timestamp( line ) )
        .ok_or_else( || probe_error( "duration", path, report ) )?;

    let video_line = lines
        .iter()
        .find( |l| l.contains( " Video: " ) && geometry_re().is_match( l ) );

    let video = match video_line {
        Some( line ) => Some( parse_video( line, &lines, duration, rate_source )
            .ok_or_else( || probe_error( "video", path, report ) )? ),
        None => None,
    };

    let source_rate = lines
        .iter()
        .find( |l| l.contains( " Audio: " ) )
        .and_then( |line| hz_re().captures( line ) )
        .and_then( |caps| caps[ 1 ].parse().ok() );

    Ok( MediaStreamInfo {
        duration: duration.secs(),
        sample_rate: format.sample_rate,
        channels: format.channels,
        byte_width: format.byte_width,
        frame_count: duration.frames_at( format.sample_rate as u64 ) + 1,
        source_rate,
        video,
    })
}


fn parse_video( line: &str, lines: &[&str], duration: Timestamp, rate_source: RateSource ) -> Option<VideoInfo> {
    let caps = size_re().captures( line )?;
    let width = caps[ 1 ].parse().ok()?;
    let height = caps[ 2 ].parse().ok()?;

    let fps = match rate_source {
        RateSource::Tbr => parse_tbr( line ).or_else( || parse_fps( line ) ),
        RateSource::Fps => parse_fps( line ).or_else( || parse_tbr( line ) ),
    }?;
    let fps = correct_frame_rate( fps );

    let rotation = lines
        .iter()
        .find_map( |l| rotate_re().captures( l.trim_end() ) )
        .and_then( |caps| caps[ 1 ].parse().ok() )
        .unwrap_or( 0 );

    Some( VideoInfo {
        width,
        height,
        fps,
        rotation,
        frame_count: ( duration.secs() * fps ) as u64 + 1,
    })
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::path::PathBuf;


    const AUDIO_REPORT: &str = "\
ffmpeg version 6.0 Copyright (c) 2000-2023 the FFmpeg developers
Input #0, mp3, from 'ice_cube.mp3':
  Duration: 00:03:25.47, start: 0.025057, bitrate: 128 kb/s
    Stream #0:0: Audio: mp3, 44100 Hz, stereo, fltp, 128 kb/s
At least one output file must be specified";


    const VIDEO_REPORT: &str = "\
Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'bbb.mp4':
  Duration: 00:00:10.00, start: 0.000000, bitrate: 1205 kb/s
    Stream #0:0(und): Video: h264 (High), yuv420p, 1280x720 [SAR 1:1 DAR 16:9], 1000 kb/s, 23.98 fps, 23.98 tbr, 24k tbn (default)
    Metadata:
      rotate          : 90
    Stream #0:1(und): Audio: aac (LC), 48000 Hz, stereo, fltp, 192 kb/s (default)
At least one output file must be specified";


    fn path( name: &str ) -> PathBuf {
        PathBuf::from( name )
    }


    #[test]
    fn test_parse_audio_duration_and_frames() {
        let format = PcmFormat::default();
        let info = parse_report( AUDIO_REPORT, &path( "ice_cube.mp3" ), RateSource::Tbr, format ).unwrap();

        assert!( ( info.duration - 205.47 ).abs() < 1e-9 );
        assert_eq!( info.frame_count, 44100 * 20547 / 100 + 1 );
        assert_eq!( info.source_rate, Some( 44100 ) );
        assert_eq!( info.sample_rate, 44100 );
        assert!( info.video.is_none() );
    }


    #[test]
    fn test_frame_count_follows_output_rate() {
        let format = PcmFormat { sample_rate: 22050, channels: 1, byte_width: 2 };
        let info = parse_report( VIDEO_REPORT, &path( "bbb.mp4" ), RateSource::Tbr, format ).unwrap();

        assert_eq!( info.frame_count, 220501 );
        assert_eq!( info.channels, 1 );
        assert_eq!( info.source_rate, Some( 48000 ) );
    }


    #[test]
    fn test_parse_video_line() {
        let info = parse_report( VIDEO_REPORT, &path( "bbb.mp4" ), RateSource::Tbr, PcmFormat::default() ).unwrap();
        let video = info.video.unwrap();

        assert_eq!( ( video.width, video.height ), ( 1280, 720 ) );
        assert_eq!( video.rotation, 90 );
        // 23.98 snaps to 24000/1001
        assert!( ( video.fps - 24.0 * 1000.0 / 1001.0 ).abs() < 1e-12 );
        assert_eq!( video.frame_count, ( 10.0 * 24.0 * 1000.0 / 1001.0 ) as u64 + 1 );
    }


    #[test]
    fn test_rate_source_preference_and_fallback() {
        let line = "    Stream #0:0: Video: vp9, yuv420p, 640x360, 30 fps, 12k tbr, 1k tbn";
        let report = format!( "  Duration: 00:00:02.00, start: 0.0\n{}\n", line );

        let info = parse_report( &report, &path( "a.webm" ), RateSource::Tbr, PcmFormat::default() ).unwrap();
        assert_eq!( info.video.unwrap().fps, 12000.0 );

        let info = parse_report( &report, &path( "a.webm" ), RateSource::Fps, PcmFormat::default() ).unwrap();
        assert_eq!( info.video.unwrap().fps, 30.0 );

        // No tbr on the line: fall back to fps
        let report = "  Duration: 00:00:02.00\n    Stream #0:0: Video: vp9, 640x360, 25 fps, 1k tbn\n";
        let info = parse_report( report, &path( "a.webm" ), RateSource::Tbr, PcmFormat::default() ).unwrap();
        assert_eq!( info.video.unwrap().fps, 25.0 );
    }


    #[test]
    fn test_correct_frame_rate() {
        assert_eq!( correct_frame_rate( 25.0 ), 25.0 );
        assert!( ( correct_frame_rate( 29.97 ) - 30000.0 / 1001.0 ).abs() < 1e-12 );
        assert!( ( correct_frame_rate( 49.95 ) - 50000.0 / 1001.0 ).abs() < 1e-12 );
        assert_eq!( correct_frame_rate( 29.5 ), 29.5 );
    }


    #[test]
    fn test_missing_file() {
        let report = "ffmpeg version 6.0\nnope.mp3: No such file or directory";
        let result = parse_report( report, &path( "nope.mp3" ), RateSource::Tbr, PcmFormat::default() );
        assert!( matches!( result, Err( DecoderError::NotFound( _ ) ) ) );
    }


    #[test]
    fn test_missing_duration_keeps_report() {
        let report = "Input #0, wav, from 'x.wav':\n  Duration: N/A, bitrate: N/A";
        match parse_report( report, &path( "x.wav" ), RateSource::Tbr, PcmFormat::default() ) {
            Err( DecoderError::Probe { field, report: text, .. } ) => {
                assert_eq!( field, "duration" );
                assert!( text.contains( "Duration: N/A" ) );
            }
            other => panic!( "unexpected result: {:?}", other ),
        }
    }


    #[test]
    fn test_gif_duration_from_last_progress_line() {
        let report = "\
  Duration: N/A, start: 0.000000, bitrate: N/A
    Stream #0:0: Video: gif, bgra, 320x240, 10 fps, 10 tbr, 100 tbn
frame=   10 fps=0.0 q=-0.0 size=N/A time=00:00:01.00 bitrate=N/A
frame=   35 fps=0.0 q=-0.0 Lsize=N/A time=00:00:03.50 bitrate=N/A";

        let info = parse_report( report, &path( "anim.GIF" ), RateSource::Tbr, PcmFormat::default() ).unwrap();
        assert!( ( info.duration - 3.5 ).abs() < 1e-9 );
        assert_eq!( info.video.unwrap().frame_count, 36 );
    }
}
