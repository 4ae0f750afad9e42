//! midiplay - A command-line MIDI player.
//!
//! Plays a Standard MIDI File through a SoundFont synthesizer on the default
//! audio device, or renders it to a WAV file.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- song.mid                   # Play with the built-in sound bank
//! cargo run -- -sf GM.sf2 song.mid        # Play with a SoundFont
//! cargo run -- -o song.wav song.mid       # Render to WAV instead of playing
//! cargo run -- device://midi              # Play a short live-input demo
//! ```
//!
//! Set `RUST_LOG=debug` for playback diagnostics on stderr.

use anyhow::{bail, Context, Result};
use midiplay::audio::{export_to_wav, RodioTransport};
use midiplay::{
    FrameProducer, Locator, Player, PlayerConfig, PlayerEvent, SoundBankRegistry, SynthEngine,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Notes of the live-input demo: a C major arpeggio.
const DEMO_NOTES: [u8; 8] = [60, 64, 67, 72, 76, 72, 67, 64];

/// How long each demo note sounds.
const DEMO_NOTE_LENGTH: Duration = Duration::from_millis(250);

/// Audio rendered for a live-input session when writing a WAV file.
const DEMO_RENDER_LIMIT: Duration = Duration::from_secs(3);

/// Command-line options for the application.
struct CliOptions {
    /// File path or `device://midi`.
    locator: String,
    /// Path to a custom SoundFont file.
    soundfont: Option<PathBuf>,
    /// Path to a JSON configuration file.
    config: Option<PathBuf>,
    /// Render to this WAV file instead of playing.
    render: Option<PathBuf>,
    /// Loop count passed to the session; -1 repeats forever.
    loop_count: Option<i32>,
}

fn print_help(program: &str) {
    eprintln!("midiplay - Command-line MIDI player");
    eprintln!();
    eprintln!("Usage: {} [OPTIONS] <LOCATOR>", program);
    eprintln!();
    eprintln!("LOCATOR is a MIDI file path or device://midi for a live-input demo.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -sf, --soundfont PATH  Load a specific SoundFont file (.sf2)");
    eprintln!("  -c, --config PATH      Read player settings from a JSON file");
    eprintln!("  -o, --render PATH      Render to a WAV file instead of playing");
    eprintln!("  -l, --loop N           Play N times in total (-1 repeats forever)");
    eprintln!("  -h, --help             Print this help message");
    eprintln!();
    eprintln!("Without a SoundFont a built-in sine instrument is used.");
}

fn arg_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a String> {
    args.get(i)
        .with_context(|| format!("{} requires an argument", flag))
}

impl CliOptions {
    /// Parses command-line arguments.
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let program = args.first().map(String::as_str).unwrap_or("midiplay");
        let mut locator = None;
        let mut soundfont = None;
        let mut config = None;
        let mut render = None;
        let mut loop_count = None;
        let mut i = 1;

        while i < args.len() {
            match args[i].as_str() {
                "--soundfont" | "-sf" => {
                    i += 1;
                    soundfont = Some(PathBuf::from(arg_value(&args, i, "--soundfont")?));
                }
                "--config" | "-c" => {
                    i += 1;
                    config = Some(PathBuf::from(arg_value(&args, i, "--config")?));
                }
                "--render" | "-o" => {
                    i += 1;
                    render = Some(PathBuf::from(arg_value(&args, i, "--render")?));
                }
                "--loop" | "-l" => {
                    i += 1;
                    let raw = arg_value(&args, i, "--loop")?;
                    let count: i32 = raw
                        .parse()
                        .with_context(|| format!("Invalid loop count: {}", raw))?;
                    loop_count = Some(count);
                }
                "--help" | "-h" => {
                    print_help(program);
                    std::process::exit(0);
                }
                other if other.starts_with('-') && other.len() > 1 => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
                other => {
                    if locator.is_some() {
                        bail!("Only one locator may be given (got another: {})", other);
                    }
                    locator = Some(other.to_string());
                }
            }
            i += 1;
        }

        let Some(locator) = locator else {
            print_help(program);
            std::process::exit(1);
        };

        Ok(Self {
            locator,
            soundfont,
            config,
            render,
            loop_count,
        })
    }
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    // Initialize logging (optional, for debugging)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => PlayerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => PlayerConfig::default(),
    };
    // CLI-specified SoundFont takes priority over the config file
    if let Some(sf_path) = cli.soundfont.clone() {
        config.sound_bank = Some(sf_path);
    }
    config.validate().context("Invalid configuration")?;

    let sound_bank = SoundBankRegistry::global()
        .init(config.sound_bank.as_deref())
        .context("Failed to load sound bank")?;
    let engine = SynthEngine::new(sound_bank, &config);
    let locator = Locator::parse(&cli.locator);

    match &cli.render {
        Some(output) => render(&engine, locator, output, &cli),
        None => play(&engine, locator, &config, &cli),
    }
}

/// Renders the locator to a WAV file.
fn render(engine: &SynthEngine, locator: Locator, output: &Path, cli: &CliOptions) -> Result<()> {
    if cli.loop_count == Some(-1) {
        bail!("Cannot render an endless loop to a file");
    }
    let interactive = matches!(locator, Locator::Interactive);
    let mut session = engine
        .open_session(locator)
        .with_context(|| format!("Failed to open {}", cli.locator))?;
    if let Some(count) = cli.loop_count {
        session.set_loop_count(count)?;
    }

    let limit = if interactive {
        // Hold a chord of the first three demo notes.
        for &note in DEMO_NOTES.iter().take(3) {
            session.write_event(&[0x90, note, 100])?;
        }
        Some(DEMO_RENDER_LIMIT)
    } else {
        None
    };

    let mut last_percent = 0;
    export_to_wav(
        &mut session,
        engine.sample_rate(),
        output,
        limit,
        Some(|progress: f32| {
            let percent = (progress * 100.0) as u32;
            if percent != last_percent {
                last_percent = percent;
                eprint!("\rRendering... {:3}%", percent);
                let _ = std::io::stderr().flush();
            }
        }),
    )?;
    eprintln!();
    eprintln!("Wrote {}", output.display());
    Ok(())
}

/// Plays the locator on the default output device until it ends.
fn play(engine: &SynthEngine, locator: Locator, config: &PlayerConfig, cli: &CliOptions) -> Result<()> {
    let interactive = matches!(locator, Locator::Interactive);
    let mut player = Player::create(engine, locator, Box::new(RodioTransport::new()), config)
        .with_context(|| format!("Failed to open {}", cli.locator))?;
    let events = player.subscribe();

    if let Some(count) = cli.loop_count {
        player.set_loop_count(count)?;
    }
    if let Some(duration) = player.duration() {
        eprintln!("Playing {} ({:.1}s)", cli.locator, duration.as_secs_f64());
    }
    player.prefetch().context("Failed to start playback")?;

    if interactive {
        for &note in DEMO_NOTES.iter() {
            player.write_event(&[0x90, note, 100])?;
            thread::sleep(DEMO_NOTE_LENGTH);
            player.write_event(&[0x80, note, 0])?;
        }
        // Let the last note release.
        thread::sleep(Duration::from_millis(500));
        player.close();
        return Ok(());
    }

    let result = loop {
        match events.recv() {
            Ok(PlayerEvent::EndOfMedia) => break Ok(()),
            Ok(PlayerEvent::Error(reason)) => break Err(anyhow::anyhow!("Playback failed: {}", reason)),
            Ok(PlayerEvent::Closed) | Err(_) => break Ok(()),
            Ok(event) => tracing::debug!(?event, "player event"),
        }
    };
    // The device may still hold the tail of the last buffer.
    thread::sleep(Duration::from_millis(200));
    player.close();
    result
}
