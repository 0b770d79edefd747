//! Livecast backend process
//!
//! Captures audio from an input device and takes control commands on stdin,
//! one `key=value` per line. Replies go to stdout, logs to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{select, tick, unbounded};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livecast::{
    audio::{device::list_input_devices, AudioCapture, Watchdog},
    backend::Backend,
    command::Dispatcher,
    config::AppConfig,
};

#[derive(Parser, Debug)]
#[command(name = "livecast", version, about = "Real-time audio encode and fan-out backend")]
struct Args {
    /// Configuration file, defaults to the platform config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input device name, overrides the configuration
    #[arg(short, long)]
    device: Option<String>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in list_input_devices() {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => AppConfig::load()?,
    };
    if args.device.is_some() {
        config.audio.device = args.device.clone();
    }
    if args.dump_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting livecast");
    let backend = Arc::new(Backend::new(&config)?);

    let mut capture = AudioCapture::new(config.audio.device.as_deref(), config.audio.sample_rate)?;
    backend.feed.set_sample_rate(capture.sample_rate());
    capture.start(backend.feed.clone())?;

    let (shutdown_tx, shutdown_rx) = unbounded();
    let mut watchdog = Watchdog::spawn(
        backend.feed.heartbeat(),
        Duration::from_secs(config.audio.watchdog_timeout_secs),
        Duration::from_millis(250),
        shutdown_tx,
    )?;

    // stdin is read on its own thread so the main loop can also watch the
    // watchdog and the capture stream
    let (line_tx, line_rx) = unbounded::<String>();
    thread::Builder::new()
        .name("control-reader".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Control channel read failed: {}", e);
                        break;
                    }
                }
            }
        })
        .context("spawning control reader")?;

    let mut dispatcher = Dispatcher::new(backend.clone());
    let health = tick(Duration::from_secs(1));
    let stdout = std::io::stdout();

    loop {
        select! {
            recv(line_rx) -> line => {
                let Ok(line) = line else {
                    tracing::info!("Control channel closed");
                    break;
                };
                if let Some(response) = dispatcher.handle_line(&line) {
                    let mut out = stdout.lock();
                    for reply in response.lines() {
                        writeln!(out, "{}", reply)?;
                    }
                    out.flush()?;
                }
            }
            recv(shutdown_rx) -> reason => {
                tracing::error!("Shutting down: {:?}", reason);
                break;
            }
            recv(health) -> _ => {
                if let Some(e) = capture.check_errors() {
                    tracing::error!("Audio capture failed: {}", e);
                    break;
                }
            }
        }
    }

    watchdog.stop();
    capture.stop();
    drop(dispatcher);
    tracing::info!("Livecast stopped");
    Ok(())
}
