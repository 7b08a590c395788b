//! jury-replays
//!
//! Records every lifting attempt from the platform cameras, trims each clip
//! to the lift itself, and serves the replays to jury browsers.

mod attempt;
mod capture;
mod clock;
mod config;
mod crash;
mod logging;
mod router;
mod session;
mod status;
mod supervisor;
mod ui;
mod web;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use capture::{process, FfmpegDriver, FfmpegSettings};
use clock::SystemClock;
use config::{CameraConfig, Config};
use router::{BrokerTopics, EventRouter};
use session::SessionIndex;
use status::{StatusBus, StatusMessage};
use supervisor::{Supervisor, SupervisorSettings};
use web::{ListingPage, WebState};

/// Command line options
#[derive(Debug, Default)]
struct Options {
    config_path: Option<PathBuf>,
    broker_stdin: bool,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }
    let options = parse_args(&args)?;

    let _log_guard = logging::init_logging()?;
    match logging::get_log_dir().and_then(|dir| Ok(crash::init_crash_handler(&dir)?)) {
        Ok(path) => info!("Crash log at {:?}", path),
        Err(e) => warn!("Crash handler not installed: {}", e),
    }

    info!("jury-replays {} starting...", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(options));

    // Whatever happened, no capture child outlives the recorder
    process::kill_registered();

    match &result {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => error!("Exiting: {:#}", e),
    }
    result
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut options = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = iter.next().context("--config needs a path")?;
                options.config_path = Some(PathBuf::from(path));
            }
            "--broker-stdin" => options.broker_stdin = true,
            other => bail!("Unknown argument: {} (try --help)", other),
        }
    }
    Ok(options)
}

async fn run(options: Options) -> Result<()> {
    let bus = StatusBus::new(16);
    let shutdown = CancellationToken::new();
    let display = tokio::spawn(ui::run_status_display(bus.subscribe_ui(), shutdown.clone()));

    let startup = startup(&options).await;
    let (config, cameras, driver) = match startup {
        Ok(ready) => ready,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            bus.publish(StatusMessage::error(format!("ERROR: {}", e), ""));
            bus.close();
            shutdown.cancel();
            let _ = display.await;
            return Err(e);
        }
    };
    let camera_count = cameras.len() as u32;

    let clock = Arc::new(SystemClock);
    let (supervisor, handle) = Supervisor::new(
        SupervisorSettings::from_config(&config.recording),
        cameras,
        Arc::new(driver),
        clock.clone(),
        bus.clone(),
    );
    let supervisor_task = tokio::spawn(supervisor.run());

    let router = EventRouter::new(handle.clone(), clock, BrokerTopics::new(&config.broker));

    let listener = match web::bind(&config.server).await {
        Ok(listener) => listener,
        Err(e) => {
            bus.publish(StatusMessage::error(format!("ERROR: {}", e), ""));
            handle.shutdown().await;
            shutdown.cancel();
            let _ = supervisor_task.await;
            let _ = display.await;
            return Err(e);
        }
    };

    let state = WebState {
        router: router.clone(),
        index: SessionIndex::new(&config.recording.video_dir),
        bus: bus.clone(),
        supervisor: handle.clone(),
        page: Arc::new(ListingPage::new()?),
        cameras: camera_count,
    };
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = web::serve(listener, state, server_shutdown).await {
            error!("HTTP server error: {:#}", e);
        }
    });

    let line_feed = options.broker_stdin.then(|| {
        let topics = router.broker().subscriptions();
        info!("Expecting broker topics on stdin: {:?}", topics);
        tokio::spawn(router::run_line_feed(
            BufReader::new(tokio::io::stdin()),
            router.clone(),
            shutdown.clone(),
        ))
    });

    // Ctrl+C, SIGTERM and SIGHUP all land here
    let (signal_tx, mut signal_rx) = mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .context("Failed to install the termination handler")?;

    bus.publish(StatusMessage::ready("No active session", ""));
    info!("Recording {} camera(s), press Ctrl+C to exit", camera_count);

    signal_rx.recv().await;
    info!("Termination requested, shutting down...");

    handle.shutdown().await;
    shutdown.cancel();

    let _ = supervisor_task.await;
    let _ = server.await;
    if let Some(task) = line_feed {
        // stdin reads are not cancellable, do not wait for the next line
        task.abort();
    }
    let _ = display.await;
    Ok(())
}

/// Everything that must hold before the first attempt can be recorded
async fn startup(options: &Options) -> Result<(Config, Vec<CameraConfig>, FfmpegDriver)> {
    let config = Config::load(options.config_path.as_deref())?;
    info!("Configuration loaded from {:?}", config.config_path()?);

    let cameras = config.validate()?;
    process::ensure_supported().map_err(anyhow::Error::msg)?;

    let driver = FfmpegDriver::new(FfmpegSettings::from_config(&config.recording));
    let version = driver
        .check_installed()
        .await
        .with_context(|| format!("ffmpeg not usable at {:?}", config.recording.ffmpeg_path))?;
    info!("Using {}", version);

    let video_dir = &config.recording.video_dir;
    std::fs::create_dir_all(video_dir)
        .with_context(|| format!("Failed to create video directory: {:?}", video_dir))?;
    let working_dir = config.recording.working_dir();
    std::fs::create_dir_all(&working_dir)
        .with_context(|| format!("Failed to create working directory: {:?}", working_dir))?;

    Ok((config, cameras, driver))
}

fn print_help() {
    println!("jury-replays - Jury replay recorder for weightlifting platforms");
    println!();
    println!("USAGE:");
    println!("    jury-replays [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help            Print this help message");
    println!("    -c, --config <PATH>   Use this config file instead of the default one");
    println!("        --broker-stdin    Read broker messages as `topic payload` lines from stdin");
    println!("                          (e.g. piped from `mosquitto_sub -v -t 'owlcms/fop/#'`)");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                Set log level (e.g., debug, info, warn)");
    println!("    JURY_REPLAYS_LOG_PATH   Override the log directory");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let options = parse_args(&args(&["--config", "/etc/replays.toml", "--broker-stdin"])).unwrap();
        assert_eq!(options.config_path, Some(PathBuf::from("/etc/replays.toml")));
        assert!(options.broker_stdin);

        let options = parse_args(&[]).unwrap();
        assert!(options.config_path.is_none());
        assert!(!options.broker_stdin);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&args(&["-c"])).is_err());
        assert!(parse_args(&args(&["--setup"])).is_err());
    }
}
