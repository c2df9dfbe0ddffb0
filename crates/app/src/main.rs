mod console;

use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    thread,
};

use bpm_osc_core::{
    analysis::synthetic::click_track,
    display::DEFAULT_DISPLAY_CAPACITY,
    AppConfig, BeatEngine, DisplayHandle, TempoEstimator, TempoTracker, TrackerConfig,
};
use clap::{Parser, Subcommand};
use console::{Command, Renderer, HELP};
use tracing_subscriber::EnvFilter;

fn main() -> bpm_osc_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Live(args) => run_live(args),
        Commands::Simulate {
            bpm,
            seconds,
            frame_size,
        } => run_simulate(bpm, seconds, frame_size),
    }
}

fn run_live(args: LiveArgs) -> bpm_osc_core::Result<()> {
    let config = args.resolve_config()?;
    tracing::info!(
        host = %config.osc.host,
        port = config.osc.port,
        device = ?config.audio.device_index,
        "starting live mode"
    );

    let (display, events) = DisplayHandle::channel(DEFAULT_DISPLAY_CAPACITY);
    let json = args.json;
    let renderer = thread::Builder::new()
        .name("display".into())
        .spawn(move || {
            let mut renderer = Renderer::new(json);
            let stdout = io::stdout();
            for event in events {
                if let Some(line) = renderer.render(&event) {
                    let mut out = stdout.lock();
                    let _ = writeln!(out, "{line}");
                    let _ = out.flush();
                }
            }
        })?;

    let mut engine = BeatEngine::new(config, display)?;
    if let Err(err) = engine.start() {
        tracing::error!("could not start audio input: {err}");
    }
    eprintln!("type `help` for commands");

    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(err) = execute(&mut engine, command) {
                    tracing::error!("{err}");
                }
            }
            Err(err) => eprintln!("{err}"),
        }
    }

    engine.stop()?;
    drop(engine);
    let _ = renderer.join();
    Ok(())
}

fn execute(engine: &mut BeatEngine, command: Command) -> bpm_osc_core::Result<()> {
    match command {
        Command::Start => engine.start()?,
        Command::Stop => engine.stop()?,
        Command::Tap => {
            engine.tap()?;
        }
        Command::Sync(enabled) => engine.set_sync_enabled(enabled)?,
        Command::Divider(divider) => engine.set_beat_divider(divider),
        Command::Adjust(adjust) => {
            if engine.adjust_send_bpm(adjust).is_none() {
                eprintln!("send bpm must stay within 20..=500");
            }
        }
        Command::Resync => {
            if !engine.resync_bar() {
                eprintln!("not running");
            }
        }
        Command::Status => {
            let state = engine.state();
            eprintln!(
                "running: {}  sync: {}  divider: {}  send bpm: {}",
                engine.is_running(),
                if state.sync_enabled { "on" } else { "off" },
                state.beat_divider.factor(),
                state.send_bpm
            );
        }
        Command::Help => eprintln!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn run_simulate(bpm: f32, seconds: f32, frame_size: usize) -> bpm_osc_core::Result<()> {
    if !(bpm > 0.0 && seconds > 0.0) {
        return Err("bpm and seconds must be positive".into());
    }
    let sample_rate = AppConfig::default().audio.sample_rate;
    tracing::info!(bpm, seconds, frame_size, "simulating click track");

    let mut tracker = TempoTracker::new(TrackerConfig::new(frame_size, sample_rate))?;
    let period = (60.0 * sample_rate as f32 / bpm).round() as usize;
    let total = (seconds * sample_rate as f32) as usize;
    let signal = click_track(period.max(1), total, sample_rate);

    let mut beats = 0usize;
    for (index, frame) in signal.chunks_exact(frame_size).enumerate() {
        let event = tracker.process(frame)?;
        if event.occurred {
            beats += 1;
            let seconds = (index * frame_size) as f32 / sample_rate as f32;
            tracing::info!(seconds, bpm = event.bpm, "beat");
        }
    }

    match tracker.bpm() {
        Some(estimate) => {
            tracing::info!(beats, estimate, "simulation finished");
            println!("{estimate:.2}");
        }
        None => tracing::warn!(beats, "no tempo established; try a longer run"),
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live tempo detection sent over OSC", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen to an input device and send the detected tempo.
    Live(LiveArgs),
    /// Run the tempo tracker over a synthetic click track.
    Simulate {
        /// Tempo of the generated click track.
        #[arg(long)]
        bpm: f32,
        /// Length of the generated signal in seconds.
        #[arg(long, default_value_t = 20.0)]
        seconds: f32,
        /// Samples per analysis frame.
        #[arg(long, default_value_t = 512)]
        frame_size: usize,
    },
}

#[derive(clap::Args, Debug)]
struct LiveArgs {
    /// TOML or JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// OSC receiver host, overrides the configuration.
    #[arg(long)]
    host: Option<String>,
    /// OSC receiver port, overrides the configuration.
    #[arg(short, long)]
    port: Option<u16>,
    /// Input device index, overrides the configuration.
    #[arg(short, long)]
    device: Option<usize>,
    /// Samples per analysis frame, overrides the configuration.
    #[arg(long)]
    frame_size: Option<usize>,
    /// Print display events as JSON lines.
    #[arg(long)]
    json: bool,
}

impl LiveArgs {
    fn resolve_config(&self) -> bpm_osc_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(host) = &self.host {
            config.osc.host = host.clone();
        }
        if let Some(port) = self.port {
            config.osc.port = port;
        }
        if let Some(device) = self.device {
            config.audio.device_index = Some(device);
        }
        if let Some(frame_size) = self.frame_size {
            config.audio.frame_size = frame_size;
        }
        config.validate()?;
        Ok(config)
    }
}
