use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use usbcap_core::events::{CaptureEvent, CaptureObserver, TracingObserver};
use usbcap_core::session::{CaptureSession, SessionConfig, SessionOutcome, Stage};
use usbcap_core::stream::{KeepAliveFailurePolicy, RetryPolicy, StopSignal};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB capture device loader and streamer", long_about = None)]
struct Args {
    /// Upload the USB controller firmware, then exit
    #[arg(long)]
    stage1: bool,

    /// Upload the FPGA bitstream, activate and capture
    #[arg(long)]
    stage2: bool,

    /// Session configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Firmware script (.toml or packed .bin)
    #[arg(long)]
    firmware_script: Option<String>,

    /// Bitstream script (.toml or packed .bin)
    #[arg(long)]
    bitstream_script: Option<String>,

    /// Capture output file
    #[arg(short, long)]
    output: Option<String>,

    /// Keep-alive failure handling: ignore or log
    #[arg(long)]
    keepalive_policy: Option<KeepAliveFailurePolicy>,

    /// Give up capturing after this many consecutive read failures
    #[arg(long)]
    max_consecutive_failures: Option<u32>,

    /// Stop capturing after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Prints progress ticks, resource markers and the byte counter to stdout,
/// and forwards everything to the log.
struct ConsoleObserver {
    log: TracingObserver,
}

impl CaptureObserver for ConsoleObserver {
    fn on_event(&self, event: &CaptureEvent) {
        let mut out = std::io::stdout().lock();
        match event {
            CaptureEvent::ProgressTick { symbol, .. } => {
                let _ = write!(out, "{}", symbol);
                let _ = out.flush();
            }
            CaptureEvent::ReplayFinished { .. } => {
                let _ = writeln!(out);
            }
            CaptureEvent::ResourceAcquired { resource } => {
                let _ = writeln!(out, "{}", resource);
            }
            CaptureEvent::BytesCaptured { total, .. } => {
                let _ = write!(out, "\rBytes Read: {}   ", total);
                let _ = out.flush();
            }
            CaptureEvent::Stopped { .. } => {
                let _ = writeln!(out);
            }
            _ => {}
        }
        drop(out);
        self.log.on_event(event);
    }
}

fn build_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(path) = &args.firmware_script {
        config.firmware_script = path.clone();
    }
    if let Some(path) = &args.bitstream_script {
        config.bitstream_script = path.clone();
    }
    if let Some(path) = &args.output {
        config.output_path = path.clone();
    }
    if let Some(policy) = args.keepalive_policy {
        config.keepalive_policy = policy;
    }
    if let Some(max) = args.max_consecutive_failures {
        config.retry = RetryPolicy::hardened(max);
    }
    if args.duration.is_some() {
        config.capture_secs = args.duration;
    }
    Ok(config)
}

/// First Ctrl-C ends the capture in order; a second one exits immediately.
fn install_interrupt_handler(stop: StopSignal) -> Result<()> {
    ctrlc::set_handler(move || {
        if stop.is_stopped() {
            std::process::exit(130);
        }
        info!("Interrupted, stopping capture");
        stop.stop();
    })
    .context("Installing Ctrl-C handler")
}

fn run(args: &Args) -> Result<()> {
    let stage = Stage::from_flags(args.stage1, args.stage2)?;
    let config = build_config(args)?;

    let session = CaptureSession::with_observer(
        config,
        Arc::new(ConsoleObserver {
            log: TracingObserver,
        }),
    );

    if stage == Stage::Bitstream {
        install_interrupt_handler(session.stop_signal())?;
    }

    match session.run(stage)? {
        SessionOutcome::FirmwareLoaded { firmware } => {
            info!(
                issued = firmware.issued,
                failures = firmware.failures,
                "Firmware loaded, waiting for re-enumeration"
            );
        }
        SessionOutcome::Streamed { stream, .. } => {
            info!(
                bytes = stream.capture.bytes,
                reads = stream.capture.reads,
                keepalive_rounds = stream.keepalive.rounds,
                "Capture finished"
            );
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting usbcap (nusb backend)...");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
