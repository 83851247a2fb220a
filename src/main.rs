use std::path::{Path, PathBuf};
use std::process::Command as Process;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gifrec::capture::{list_monitors, Rectangle, ScreenCapture};
use gifrec::config::Config;
use gifrec::recording::{
    estimate_gif_size, CursorProvider, NoCursor, RecordingController, SessionState, SystemCursor,
};

#[derive(Parser, Debug)]
#[command(name = "gifrec", version, about = "Record a screen region to an animated GIF")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a region of the desktop.
    Record(RecordArgs),
    /// List connected monitors and their desktop coordinates.
    Monitors,
    /// Write the default config file if none exists.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Parser, Debug)]
struct RecordArgs {
    #[arg(long, allow_hyphen_values = true)]
    x: i32,

    #[arg(long, allow_hyphen_values = true)]
    y: i32,

    #[arg(long)]
    width: u32,

    #[arg(long)]
    height: u32,

    /// Stop after this many seconds. Without it, the configured limit applies.
    #[arg(long, conflicts_with = "no_limit")]
    duration: Option<u32>,

    /// Record until Enter is pressed, ignoring the configured limit.
    #[arg(long)]
    no_limit: bool,

    /// Frames per second, overriding the config.
    #[arg(long)]
    fps: Option<u32>,

    /// Output GIF path. Defaults to a timestamped file in the configured directory.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Config file to use instead of the user config.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Record(args) => cmd_record(args),
        Command::Monitors => cmd_monitors(),
        Command::InitConfig { force } => cmd_init_config(force),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn cmd_record(args: RecordArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(fps) = args.fps {
        config.recording.fps = fps;
    }
    if args.no_limit {
        config.recording.max_duration_secs = None;
    } else if args.duration.is_some() {
        config.recording.max_duration_secs = args.duration;
    }

    let output = match args.output {
        Some(path) => path,
        None => {
            config.ensure_output_dir()?;
            config.output_path()
        }
    };

    let region = Rectangle::new(args.x, args.y, args.width, args.height);
    if let Some(ticks) = config.recording.max_ticks() {
        let estimate = estimate_gif_size(ticks, region.width, region.height, &config.recording);
        tracing::info!("estimated size up to {} KiB", estimate / 1024);
    }

    let cursor: Arc<dyn CursorProvider> = if config.recording.show_cursor {
        match SystemCursor::new() {
            Ok(cursor) => Arc::new(cursor),
            Err(e) => {
                tracing::warn!("cursor position unavailable, recording without it: {:#}", e);
                Arc::new(NoCursor)
            }
        }
    } else {
        Arc::new(NoCursor)
    };
    let mut controller = RecordingController::new(Arc::new(ScreenCapture::new()), cursor);
    controller.start(config.recording.clone(), region, &output)?;

    let report = match config.recording.max_duration_secs {
        Some(secs) => {
            eprintln!("Recording for {}s (press Ctrl+C to abort)...", secs);
            controller.wait()?
        }
        None => {
            eprintln!("Recording... press Enter to stop.");
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .context("reading stdin")?;
            controller.stop()?
        }
    };

    let stats = report.stats;
    match report.state {
        SessionState::Completed => {
            println!(
                "{} ({} frames, {} bytes; {} similar, {} skipped, {} queue drops)",
                output.display(),
                stats.frames_written,
                report.bytes_written,
                stats.dropped_similar,
                stats.skipped,
                stats.dropped_queue,
            );
            if let Some(command) = config.post_command_for(&output) {
                run_post_command(&command)?;
            }
            Ok(())
        }
        state => match report.last_error {
            Some(error) => bail!("recording ended {:?}: {}", state, error),
            None => bail!("recording ended {:?}: no output written", state),
        },
    }
}

fn run_post_command(command: &str) -> anyhow::Result<()> {
    tracing::info!("running post command: {}", command);
    #[cfg(windows)]
    let status = Process::new("cmd").args(["/C", command]).status();
    #[cfg(not(windows))]
    let status = Process::new("sh").args(["-c", command]).status();

    let status = status.with_context(|| format!("spawning '{}'", command))?;
    if !status.success() {
        bail!("post command exited with {}", status);
    }
    Ok(())
}

fn cmd_monitors() -> anyhow::Result<()> {
    for monitor in list_monitors()? {
        println!(
            "{}{}: {}x{} at ({}, {}) {}",
            monitor.id,
            if monitor.is_primary { "*" } else { "" },
            monitor.width,
            monitor.height,
            monitor.x,
            monitor.y,
            monitor.name,
        );
    }
    Ok(())
}

fn cmd_init_config(force: bool) -> anyhow::Result<()> {
    let path = Config::config_path().context("no config directory available")?;
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save_to(&path)?;
    println!("{}", path.display());
    Ok(())
}
