//! # Resound CLI
//!
//! Command-line front end for the Resound audio engine. Playback runs on
//! the virtual backend, whose clock is advanced in real time.
//!
//! ## Commands
//! - `devices` - List output devices
//! - `play` - Stream a file as a track
//! - `sample` - Fire a file repeatedly as a pooled sample
//! - `config` - Print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use resound_audio::{AudioConfig, AudioThread, BiquadParameters, EffectParameters, FilterKind};
use resound_platform::{DirectoryStore, VirtualBackend};

/// Resound audio engine CLI
#[derive(Parser)]
#[command(name = "resound")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output device, overriding the configuration
    #[arg(short, long)]
    pub device: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// List output devices
    Devices,

    /// Stream a file as a track
    Play {
        /// Audio file
        file: PathBuf,

        /// Loop playback
        #[arg(short, long = "loop")]
        looping: bool,

        /// Volume from 0 to 1
        #[arg(long, default_value = "1.0")]
        volume: f64,

        /// Start position in milliseconds
        #[arg(long, default_value = "0")]
        seek: f64,

        /// Filter applied to the track mixer
        #[arg(short, long, value_enum)]
        filter: Option<FilterArg>,

        /// Filter cutoff or center frequency in Hz
        #[arg(long, default_value = "1000")]
        cutoff: f64,

        /// Stop after this many seconds. Looping playback otherwise runs until interrupted
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Fire a file repeatedly as a pooled sample
    Sample {
        /// Audio file
        file: PathBuf,

        /// Number of plays
        #[arg(short = 'n', long, default_value = "8")]
        count: usize,

        /// Maximum simultaneous voices
        #[arg(long, default_value = "4")]
        voices: usize,

        /// Delay between plays in milliseconds
        #[arg(long, default_value = "50")]
        interval_ms: u64,
    },

    /// Print the effective configuration
    Config,
}

/// Filter shapes selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterArg {
    Lowpass,
    Highpass,
    Bandpass,
    Notch,
}

impl From<FilterArg> for FilterKind {
    fn from(arg: FilterArg) -> Self {
        match arg {
            FilterArg::Lowpass => FilterKind::LowPass,
            FilterArg::Highpass => FilterKind::HighPass,
            FilterArg::Bandpass => FilterKind::BandPass,
            FilterArg::Notch => FilterKind::Notch,
        }
    }
}

/// Settings for [`play_track`]
#[derive(Debug, Clone)]
pub struct PlayOptions {
    pub looping: bool,
    pub volume: f64,
    pub seek: f64,
    pub filter: Option<BiquadParameters>,
    pub duration: Option<Duration>,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            looping: false,
            volume: 1.0,
            seek: 0.0,
            filter: None,
            duration: None,
        }
    }
}

/// Outcome of a track playback
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackReport {
    pub length_ms: f64,
    pub position_ms: f64,
    pub completed: bool,
    pub decode_steps: u64,
}

/// Outcome of a sample run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleReport {
    pub plays: u64,
    pub peak_voices: usize,
}

/// Period of the real-time clock driving the virtual backend
const CLOCK_TICK: Duration = Duration::from_millis(5);

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let config = load_config(cli.config.as_deref(), cli.device)?;

    match cli.command {
        Commands::Devices => {
            let backend = Arc::new(VirtualBackend::new());
            let audio = AudioThread::spawn(backend, config)?;
            let devices = audio.manager().device_manager();
            let current = devices.current_device();
            for device in devices.list_devices() {
                let marker = if current.as_deref() == Some(device.as_str()) { "*" } else { " " };
                println!("{} {}", marker, device);
            }
            if !devices.is_current_device_valid() {
                log::warn!("No usable output device");
            }
            audio.stop()?;
        }

        Commands::Play {
            file,
            looping,
            volume,
            seek,
            filter,
            cutoff,
            duration,
        } => {
            let options = PlayOptions {
                looping,
                volume,
                seek,
                filter: filter.map(|kind| BiquadParameters {
                    kind: kind.into(),
                    center_hz: cutoff,
                    ..BiquadParameters::default()
                }),
                duration: duration.map(Duration::from_secs_f64),
            };
            let backend = Arc::new(VirtualBackend::new());
            let audio = AudioThread::spawn(backend.clone(), config)?;
            let report = play_track(&audio, &backend, &file, &options)?;
            log::info!(
                "Played {:.0} of {:.0} ms ({} decode steps)",
                report.position_ms,
                report.length_ms,
                report.decode_steps
            );
            audio.stop()?;
        }

        Commands::Sample {
            file,
            count,
            voices,
            interval_ms,
        } => {
            let backend = Arc::new(VirtualBackend::new());
            let audio = AudioThread::spawn(backend.clone(), config)?;
            let report = fire_sample(
                &audio,
                &backend,
                &file,
                count,
                voices,
                Duration::from_millis(interval_ms),
            )?;
            log::info!("{} plays, at most {} voices at once", report.plays, report.peak_voices);
            audio.stop()?;
        }

        Commands::Config => {
            println!("{}", config.to_json()?);
        }
    }

    Ok(())
}

/// Load the configuration file, if any, and apply the device override
pub fn load_config(path: Option<&Path>, device: Option<String>) -> Result<AudioConfig> {
    let mut config = match path {
        Some(path) => AudioConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AudioConfig::default(),
    };
    if device.is_some() {
        config.device = device;
    }
    Ok(config)
}

/// Split a file path into a directory store and the name within it
fn open_store(file: &Path) -> Result<(DirectoryStore, String)> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Not a file: {}", file.display()))?;
    let root = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((DirectoryStore::new(root), name))
}

/// Advance the virtual clock in real time until `done` holds or `limit` passes
fn run_clock(
    backend: &VirtualBackend,
    limit: Option<Duration>,
    mut done: impl FnMut() -> bool,
) -> Duration {
    let started = Instant::now();
    let mut last = started;
    loop {
        if done() || limit.is_some_and(|limit| started.elapsed() >= limit) {
            return started.elapsed();
        }
        thread::sleep(CLOCK_TICK);
        let now = Instant::now();
        backend.advance(now - last);
        last = now;
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + LOAD_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Stream `file` through the track mixer until it completes or the
/// duration limit passes
pub fn play_track(
    audio: &AudioThread,
    backend: &VirtualBackend,
    file: &Path,
    options: &PlayOptions,
) -> Result<PlaybackReport> {
    let manager = audio.manager();
    let (store, name) = open_store(file)?;
    manager.set_track_store(Arc::new(store));

    let track = manager.track_from_store(&name)?;
    if !wait_for(|| track.is_fully_loaded() || track.load_failed()) {
        bail!("Timed out loading {}", file.display());
    }
    if track.load_failed() {
        bail!("Could not decode {}", file.display());
    }

    let effect = match options.filter {
        Some(parameters) => {
            let effect = manager.track_mixer().get_new_effect(0);
            effect.set_parameters(EffectParameters::BiquadFilter(parameters));
            effect.apply().wait()?;
            Some(effect)
        }
        None => None,
    };

    track.set_volume(options.volume);
    track.set_looping(options.looping);
    if options.seek > 0.0 && !track.seek(options.seek)? {
        log::warn!("Start position clamped to {:.0} ms", track.current_time());
    }
    track.start()?;
    log::info!("Playing '{}' ({:.0} ms)", track.name(), track.length());

    let played = run_clock(backend, options.duration, || track.has_completed());
    log::debug!("Clock ran for {:?}", played);

    track.stop()?;
    if let Some(effect) = effect {
        effect.remove().wait()?;
    }

    let report = PlaybackReport {
        length_ms: track.length(),
        position_ms: track.current_time(),
        completed: track.has_completed(),
        decode_steps: track.decode_steps(),
    };
    track.dispose();
    Ok(report)
}

/// Play `file` `count` times through a factory capped at `voices`
pub fn fire_sample(
    audio: &AudioThread,
    backend: &VirtualBackend,
    file: &Path,
    count: usize,
    voices: usize,
    interval: Duration,
) -> Result<SampleReport> {
    let manager = audio.manager();
    let (store, name) = open_store(file)?;
    manager.set_sample_store(Arc::new(store));

    let factory = manager.sample_from_store(&name)?;
    factory.set_concurrency(voices);
    if !wait_for(|| factory.is_loaded() || factory.load_failed()) {
        bail!("Timed out loading {}", file.display());
    }
    if factory.load_failed() {
        bail!("Could not decode {}", file.display());
    }

    let plays_before = backend.stats().sample_plays;
    let mut peak_voices = 0;
    let mut channels = Vec::with_capacity(count);
    for _ in 0..count {
        let channel = factory.create_channel()?;
        channel.play()?;
        channels.push(channel);

        run_clock(backend, Some(interval), || false);
        peak_voices = peak_voices.max(backend.playing_samples());
    }

    if !wait_for(|| channels.iter().all(|c| !c.is_play_pending())) {
        log::warn!("Some plays were still pending at exit");
    }
    // Let the tick that resolved the last deferred play finish
    audio.wait_for_update(LOAD_TIMEOUT);
    let report = SampleReport {
        plays: backend.stats().sample_plays - plays_before,
        peak_voices,
    };

    for channel in &channels {
        channel.dispose();
    }
    log::debug!("Released {} channels of '{}'", channels.len(), factory.name());
    Ok(report)
}
