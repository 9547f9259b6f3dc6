//! Hissing CLI - Terminal media player

mod cli;
mod settings;

use std::fs;
use std::io;
use std::path::{ Path, PathBuf };
use std::sync::{ Arc, Mutex };
use std::time::{ Duration, Instant };

use anyhow::{ Context, Result };
use clap::Parser;
use crossterm::{
    event::{ self, Event, KeyCode, KeyEventKind },
    terminal::{ disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen },
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{ Block, Borders, Gauge, Paragraph },
};
use tracing_subscriber::EnvFilter;

use cli::Args;
use settings::Settings;

use hissing_core::{
    DecodeSession, Ffmpeg, FrameCache, LoadMode, Manager, MediaStreamInfo, PlaybackState, Sound,
    SoundId, SourceError,
};


/// Frames kept around each lookup by `--sample`.
const SAMPLE_WINDOW_FRAMES: usize = 1 << 16;

/// Volume change per key press.
const VOLUME_STEP: f32 = 5.0;


/// Application state.
struct App {
    manager: Manager,
    files: Vec<PathBuf>,
    index: usize,
    current: Option<SoundId>,
    mode: LoadMode,
    volume: f32,
    looped: bool,
    /// Set by `s` so that a stopped file is not treated as finished
    user_stopped: bool,
    should_quit: bool,

    // Status message (shown in status bar)
    status_message: Option<String>,
    status_clear_at: Option<Instant>,

    /// Settings as loaded; only the volume is written back
    stored: Settings,
}


impl App {
    /// Creates a new App and starts the first file.
    fn new( args: &Args, settings: &Settings, stored: Settings ) -> Result<Self> {
        let manager = Manager::open( settings.manager_config() )
            .context( "Failed to open the audio device" )?;

        let mode = if settings.stream { LoadMode::Stream } else { LoadMode::Static };

        let mut app = Self {
            manager,
            files: args.files.clone(),
            index: 0,
            current: None,
            mode,
            volume: settings.volume.clamp( 0.0, 100.0 ),
            looped: args.looped,
            user_stopped: false,
            should_quit: false,
            status_message: None,
            status_clear_at: None,
            stored,
        };
        app.start( 0 );
        Ok( app )
    }


    /// Sets a status message that clears after a few seconds.
    fn set_status( &mut self, message: impl Into<String> ) {
        self.status_message = Some( message.into() );
        self.status_clear_at = Some( Instant::now() + Duration::from_secs( 3 ) );
    }


    fn sound( &self ) -> Option<&Sound> {
        self.current.and_then( |id| self.manager.sound( id ) )
    }


    /// Releases the current file and plays the one at `index`.
    fn start( &mut self, index: usize ) {
        if let Some( id ) = self.current.take() {
            self.manager.release( id );
        }

        self.index = index;
        self.user_stopped = false;
        let path = self.files[ index ].clone();

        match self.load( &path ) {
            Ok( id ) => {
                self.current = Some( id );
                self.set_status( format!( "Playing {}", display_name( &path ) ) );
            }
            Err( e ) => {
                tracing::error!( "Failed to play {:?}: {}", path, e );
                self.set_status( format!( "Error: {}", e ) );
            }
        }
    }


    fn load( &mut self, path: &Path ) -> Result<SoundId, SourceError> {
        let id = self.manager.load_file( path, self.mode )?;
        let ( volume, looped ) = ( self.volume, self.looped );

        let prepared = match self.manager.sound_mut( id ) {
            Some( sound ) => sound
                .set_volume( volume )
                .and_then( |_| sound.set_looped( looped ) )
                .and_then( |_| sound.play() ),
            None => Ok(()),
        };

        if let Err( e ) = prepared {
            self.manager.release( id );
            return Err( e );
        }
        Ok( id )
    }


    /// Runs `f` on the current sound, reporting failures in the status bar.
    fn with_sound( &mut self, f: impl FnOnce( &mut Sound ) -> Result<(), SourceError> ) {
        let Some( sound ) = self.current.and_then( |id| self.manager.sound_mut( id ) ) else {
            return;
        };
        if let Err( e ) = f( sound ) {
            tracing::warn!( "Playback command failed: {}", e );
            self.set_status( format!( "Error: {}", e ) );
        }
    }


    /// Advances past finished files and surfaces streaming faults.
    fn tick( &mut self ) {
        if let Some( clear_at ) = self.status_clear_at {
            if Instant::now() >= clear_at {
                self.status_message = None;
                self.status_clear_at = None;
            }
        }

        let Some( sound ) = self.sound() else {
            return;
        };

        match sound.state() {
            Ok( PlaybackState::Stopped ) if !self.user_stopped && !self.looped => {
                if self.index + 1 < self.files.len() {
                    self.start( self.index + 1 );
                } else {
                    self.user_stopped = true;
                    self.set_status( "End of list" );
                }
            }
            Ok( _ ) => {}
            Err( e ) => {
                tracing::error!( "Playback failed: {}", e );
                self.set_status( format!( "Error: {}", e ) );
                if let Some( id ) = self.current.take() {
                    self.manager.release( id );
                }
            }
        }
    }


    /// Handles a key press.
    fn handle_key( &mut self, code: KeyCode ) {
        match code {
            KeyCode::Char( 'q' ) | KeyCode::Esc => self.should_quit = true,

            KeyCode::Char( ' ' ) => {
                if self.current.is_none() {
                    self.start( self.index );
                    return;
                }
                self.user_stopped = false;
                self.with_sound( |sound| match sound.state()? {
                    PlaybackState::Playing => sound.pause(),
                    _ => sound.play(),
                });
            }

            KeyCode::Char( 's' ) => {
                self.user_stopped = true;
                self.with_sound( Sound::stop );
            }

            KeyCode::Char( 'r' ) => {
                self.user_stopped = true;
                self.with_sound( Sound::rewind );
            }

            KeyCode::Char( 'l' ) => {
                self.looped = !self.looped;
                let looped = self.looped;
                self.with_sound( |sound| sound.set_looped( looped ) );
                self.set_status( if looped { "Loop on" } else { "Loop off" } );
            }

            KeyCode::Char( '+' ) | KeyCode::Char( '=' ) => self.change_volume( VOLUME_STEP ),
            KeyCode::Char( '-' ) => self.change_volume( -VOLUME_STEP ),

            KeyCode::Char( 'n' ) => {
                let next = ( self.index + 1 ) % self.files.len();
                self.start( next );
            }

            KeyCode::Char( 'p' ) => {
                let prev = ( self.index + self.files.len() - 1 ) % self.files.len();
                self.start( prev );
            }

            _ => {}
        }
    }


    fn change_volume( &mut self, delta: f32 ) {
        self.volume = ( self.volume + delta ).clamp( 0.0, 100.0 );
        let volume = self.volume;
        self.with_sound( |sound| sound.set_volume( volume ) );
    }


    /// Stores the volume for next time and shuts the engine down.
    fn shutdown( &mut self ) {
        self.stored.volume = self.volume;
        self.stored.save();
        self.manager.terminate();
    }
}


fn display_name( path: &Path ) -> String {
    path.file_name()
        .map( |n| n.to_string_lossy().to_string() )
        .unwrap_or_else( || path.display().to_string() )
}


/// Formats seconds as M:SS.
fn format_time( secs: f64 ) -> String {
    let secs = secs.max( 0.0 ) as u64;
    format!( "{}:{:02}", secs / 60, secs % 60 )
}


/// Sends logs to a file; the terminal belongs to the UI.
fn init_logging() {
    let Some( dir ) = dirs::data_local_dir().map( |d| d.join( "hissing" ) ) else {
        return;
    };
    if let Err( e ) = fs::create_dir_all( &dir ) {
        eprintln!( "Failed to create log directory {}: {}", dir.display(), e );
        return;
    }

    match fs::File::create( dir.join( "hissing.log" ) ) {
        Ok( file ) => {
            tracing_subscriber::fmt()
                .with_env_filter( EnvFilter::try_from_env( "HISSING_LOG" ).unwrap_or_else( |_| {
                    EnvFilter::new( "info" )
                }))
                .with_writer( Mutex::new( file ) )
                .with_ansi( false )
                .init();
        }
        Err( e ) => eprintln!( "Failed to create log file: {}", e ),
    }
}


fn describe( path: &Path, info: &MediaStreamInfo ) -> Vec<String> {
    let mut lines = vec![
        format!( "{}", path.display() ),
        format!( "  length:   {:.2}s ({} frames)", info.duration, info.frame_count ),
        format!(
            "  decoding: {} Hz, {} ch, {}-bit",
            info.sample_rate,
            info.channels,
            info.byte_width as u32 * 8
        ),
    ];
    if let Some( rate ) = info.source_rate {
        lines.push( format!( "  source:   {} Hz", rate ) );
    }
    if let Some( ref video ) = info.video {
        lines.push( format!(
            "  video:    {}x{} @ {:.3} fps, rotation {}, {} frames",
            video.width, video.height, video.fps, video.rotation, video.frame_count
        ));
    }
    lines
}


/// `--probe` and `--sample`: print and exit without touching the device.
fn inspect( args: &Args, settings: &Settings ) -> Result<()> {
    let config = settings.manager_config();
    let backend = Arc::new( Ffmpeg::new( config.decoder.program.clone() ) );

    for path in &args.files {
        let session = DecodeSession::open( path, &config.decoder, backend.clone() )
            .with_context( || format!( "Failed to open {}", path.display() ) )?;

        for line in describe( path, session.info() ) {
            println!( "{}", line );
        }

        if !args.sample.is_empty() {
            let mut cache = FrameCache::new( session, SAMPLE_WINDOW_FRAMES );
            let frames = cache.get_frames( &args.sample )?;
            for ( time, frame ) in args.sample.iter().zip( frames ) {
                let values: Vec<String> = frame.iter().map( |v| format!( "{:+.5}", v ) ).collect();
                println!( "  {:>10.4}s  {}", time, values.join( " " ) );
            }
        }
    }
    Ok(())
}


fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let stored = Settings::load();
    let settings = stored.with_args( &args );

    if args.probe || !args.sample.is_empty() {
        return inspect( &args, &settings );
    }

    // Create app before taking over the terminal so errors print normally
    let mut app = App::new( &args, &settings, stored )?;

    // Setup terminal
    enable_raw_mode()?;
    io::stdout().execute( EnterAlternateScreen )?;

    let mut terminal = Terminal::new( CrosstermBackend::new( io::stdout() ) )?;

    // Main loop
    loop {
        // Update state
        app.tick();

        // Draw UI
        terminal.draw( |frame| draw_ui( frame, &app ) )?;

        // Handle events with timeout
        if event::poll( Duration::from_millis( 100 ) )? {
            if let Event::Key( key ) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key( key.code );
                }
            }
        }

        if app.should_quit {
            app.shutdown();
            break;
        }
    }

    // Cleanup
    disable_raw_mode()?;
    io::stdout().execute( LeaveAlternateScreen )?;

    Ok(())
}


/// Draws the main UI.
fn draw_ui( frame: &mut Frame, app: &App ) {
    let area = frame.area();

    let chunks = Layout::default()
        .direction( Direction::Vertical )
        .constraints([
            Constraint::Length( 2 ),  // Header
            Constraint::Min( 0 ),     // File info
            Constraint::Length( 3 ),  // Progress
            Constraint::Length( 1 ),  // Status bar
        ])
        .split( area );

    let mode = match app.mode {
        LoadMode::Static => "WHOLE FILE",
        LoadMode::Stream => "STREAMING",
    };
    let header = Paragraph::new( format!( "  HISSING - {}", mode ) )
        .style( Style::default().fg( Color::Cyan ).bold() )
        .block( Block::default().borders( Borders::BOTTOM ) );
    frame.render_widget( header, chunks[0] );

    draw_info( frame, app, chunks[1] );
    draw_progress( frame, app, chunks[2] );
    draw_status_bar( frame, app, chunks[3] );
}


fn draw_info( frame: &mut Frame, app: &App, area: Rect ) {
    let path = &app.files[ app.index ];

    let mut lines = vec![
        Line::from( Span::styled( format!( " {}", display_name( path ) ), Style::default().bold() ) ),
        Line::from( Span::styled(
            format!( " File {} of {}", app.index + 1, app.files.len() ),
            Style::default().fg( Color::Gray ),
        )),
        Line::from( "" ),
    ];

    if let Some( sound ) = app.sound() {
        for line in describe( path, sound.info() ).into_iter().skip( 1 ) {
            lines.push( Line::from( line ) );
        }
    }

    let info = Paragraph::new( lines )
        .block( Block::default().title( " Now Playing " ).borders( Borders::ALL ) );
    frame.render_widget( info, area );
}


fn draw_progress( frame: &mut Frame, app: &App, area: Rect ) {
    let ( state, time, length ) = match app.sound() {
        Some( sound ) => (
            sound.state().ok(),
            sound.time().unwrap_or( 0.0 ),
            sound.length(),
        ),
        None => ( None, 0.0, 0.0 ),
    };

    let state_str = match state {
        Some( PlaybackState::Playing ) => "▶",
        Some( PlaybackState::Paused ) => "⏸",
        Some( PlaybackState::Initial ) | Some( PlaybackState::Stopped ) => "⏹",
        None => "-",
    };

    let ratio = if length > 0.0 { ( time / length ).clamp( 0.0, 1.0 ) } else { 0.0 };
    let loop_str = if app.looped { " loop" } else { "" };
    let label = format!(
        "{} {} / {}  vol {}%{}",
        state_str,
        format_time( time ),
        format_time( length ),
        app.volume as i32,
        loop_str
    );

    let gauge = Gauge::default()
        .block( Block::default().borders( Borders::ALL ) )
        .gauge_style( Style::default().fg( Color::Cyan ) )
        .ratio( ratio )
        .label( label );
    frame.render_widget( gauge, area );
}


fn draw_status_bar( frame: &mut Frame, app: &App, area: Rect ) {
    let ( text, style ) = match app.status_message {
        Some( ref msg ) => ( msg.clone(), Style::default().fg( Color::Green ) ),
        None => (
            " [Space]Play/Pause [s]Stop [r]Rewind [l]Loop [+/-]Volume [n/p]Next/Prev [q]Quit ".to_string(),
            Style::default().fg( Color::DarkGray ),
        ),
    };

    let status = Paragraph::new( text ).style( style );
    frame.render_widget( status, area );
}
