//! Capture Session - high-level orchestrator for one process run.
//!
//! Stage 1 replays the firmware script and ends. Stage 2 replays the
//! bitstream script, activates the device and streams until stopped.

use std::fs::File;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::bringup::{ActivationReport, ActivationRoutine, BringupSequencer, ReplayReport};
use crate::device::DeviceSession;
use crate::events::{CaptureEvent, CaptureObserver, LogLevel, TracingObserver};
use crate::protocol::ControlTransfer;
use crate::protocol::constants::*;
use crate::script::{ControlScript, ScriptKind};
use crate::stream::{
    CaptureCounter, KeepAliveFailurePolicy, KeepAliveTask, RetryPolicy, StopSignal,
    StreamCapture, StreamReport, run_streaming,
};
use crate::transport::UsbTransport;

/// Which bring-up stage this run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Load the USB controller firmware, then exit.
    Firmware,
    /// Load the FPGA bitstream, activate and stream.
    Bitstream,
}

impl Stage {
    /// Resolve the `--stage1` / `--stage2` flag pair. Exactly one must be set.
    pub fn from_flags(stage1: bool, stage2: bool) -> Result<Self> {
        match (stage1, stage2) {
            (true, false) => Ok(Stage::Firmware),
            (false, true) => Ok(Stage::Bitstream),
            (false, false) => bail!("Set --stage1 or --stage2"),
            (true, true) => bail!("--stage1 and --stage2 are mutually exclusive"),
        }
    }
}

/// Configuration for a capture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// USB vendor ID of the capture device.
    pub vendor_id: u16,
    /// USB product ID of the capture device.
    pub product_id: u16,
    /// Path to the firmware script.
    pub firmware_script: String,
    /// Path to the bitstream script.
    pub bitstream_script: String,
    /// Capture output file, truncated on open.
    pub output_path: String,
    /// Timeout of one control transfer.
    pub control_timeout_ms: u64,
    /// Delay between bitstream load and activation.
    pub settle_delay_ms: u64,
    /// Pause before exiting after stage 1.
    pub stage1_exit_delay_ms: u64,
    /// Pause between keep-alive rounds.
    pub keepalive_interval_ms: u64,
    /// Reporting of keep-alive failures.
    pub keepalive_policy: KeepAliveFailurePolicy,
    /// Capacity of each bulk read.
    pub read_size: usize,
    /// Bulk read retry behaviour.
    pub retry: RetryPolicy,
    /// Stop streaming after this many seconds; unbounded when unset.
    pub capture_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: CAPTURE_VENDOR_ID,
            product_id: CAPTURE_PRODUCT_ID,
            firmware_script: "scripts/firmware.toml".into(),
            bitstream_script: "scripts/bitstream.toml".into(),
            output_path: "./debug".into(),
            control_timeout_ms: DEFAULT_CONTROL_TIMEOUT_MS,
            settle_delay_ms: ACTIVATION_SETTLE_DELAY.as_millis() as u64,
            stage1_exit_delay_ms: STAGE1_EXIT_DELAY.as_millis() as u64,
            keepalive_interval_ms: KEEPALIVE_INTERVAL.as_millis() as u64,
            keepalive_policy: KeepAliveFailurePolicy::default(),
            read_size: CAPTURE_READ_SIZE,
            retry: RetryPolicy::default(),
            capture_secs: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Stage 1 finished; the process should exit with status 0.
    FirmwareLoaded { firmware: ReplayReport },
    /// Stage 2 streamed until stopped.
    Streamed {
        bitstream: ReplayReport,
        activation: ActivationReport,
        stream: StreamReport,
    },
}

/// The stage-2 pre-read issued before the bitstream upload.
pub fn fpga_query() -> ControlTransfer {
    ControlTransfer::vendor_in(VENDOR_REQ_FPGA_QUERY, FPGA_QUERY_VALUE, 0, FPGA_QUERY_LEN)
}

/// Capture Session - orchestrates bring-up and streaming.
pub struct CaptureSession<O: CaptureObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    stop: StopSignal,
    counter: Arc<CaptureCounter>,
}

impl CaptureSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: CaptureObserver + 'static> CaptureSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            stop: StopSignal::new(),
            counter: Arc::new(CaptureCounter::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Signal that ends streaming when raised.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Bytes captured so far.
    pub fn counter(&self) -> Arc<CaptureCounter> {
        Arc::clone(&self.counter)
    }

    fn load_script(&self, stage: Stage) -> Result<ControlScript> {
        let (kind, path) = match stage {
            Stage::Firmware => (ScriptKind::Firmware, &self.config.firmware_script),
            Stage::Bitstream => (ScriptKind::Bitstream, &self.config.bitstream_script),
        };
        ControlScript::load(kind, path).with_context(|| format!("Loading {} script {}", kind, path))
    }

    /// Open the configured device and run `stage` on it.
    #[instrument(skip(self))]
    pub fn run(&self, stage: Stage) -> Result<SessionOutcome> {
        let script = self.load_script(stage)?;

        info!("Opening device...");
        let session = DeviceSession::open(
            self.config.vendor_id,
            self.config.product_id,
            Duration::from_millis(self.config.control_timeout_ms),
        )
        .context("Could not open a device")?;

        self.run_with_session(session, stage, &script)
    }

    /// Run `stage` against an already opened device.
    pub fn run_with_session<T: UsbTransport>(
        &self,
        mut session: DeviceSession<T>,
        stage: Stage,
        script: &ControlScript,
    ) -> Result<SessionOutcome> {
        let expected = match stage {
            Stage::Firmware => ScriptKind::Firmware,
            Stage::Bitstream => ScriptKind::Bitstream,
        };
        if script.kind() != expected {
            return Err(anyhow!(
                "Stage {:?} needs a {} script, got {}",
                stage,
                expected,
                script.kind()
            ));
        }

        self.emit(CaptureEvent::DeviceOpened {
            vid: session.vendor_id(),
            pid: session.product_id(),
        });
        self.emit(CaptureEvent::Interfaces {
            config: CAPTURE_CONFIGURATION,
            interfaces: session.describe(CAPTURE_CONFIGURATION),
        });

        match stage {
            Stage::Firmware => self.run_firmware(&mut session, script),
            Stage::Bitstream => self.run_bitstream(&mut session, script),
        }
    }

    fn run_firmware<T: UsbTransport>(
        &self,
        session: &mut DeviceSession<T>,
        script: &ControlScript,
    ) -> Result<SessionOutcome> {
        info!("Loading USB controller firmware");
        let firmware = BringupSequencer::new(self.observer.as_ref()).load(session, script)?;

        thread::sleep(Duration::from_millis(self.config.stage1_exit_delay_ms));
        Ok(SessionOutcome::FirmwareLoaded { firmware })
    }

    fn run_bitstream<T: UsbTransport>(
        &self,
        session: &mut DeviceSession<T>,
        script: &ControlScript,
    ) -> Result<SessionOutcome> {
        match session.control(&fpga_query()) {
            Ok(data) => self.emit(CaptureEvent::Diagnostic {
                label: "fpga-query".into(),
                data,
            }),
            Err(e) => warn!(error = %e, "FPGA query failed"),
        }

        info!("Loading FPGA bitstream");
        let bitstream = BringupSequencer::new(self.observer.as_ref()).load(session, script)?;

        let activation = ActivationRoutine::new(self.observer.as_ref())
            .with_settle_delay(Duration::from_millis(self.config.settle_delay_ms))
            .run(session)?;

        let mut sink = File::create(&self.config.output_path)
            .with_context(|| format!("Creating output {}", self.config.output_path))?;

        let _timer = self
            .config
            .capture_secs
            .map(|secs| self.stop.stop_after(Duration::from_secs(secs)));

        self.emit(CaptureEvent::Log {
            level: LogLevel::Info,
            message: format!("Streaming to {}", self.config.output_path),
        });

        let stream = run_streaming(
            session,
            &KeepAliveTask::new(
                Duration::from_millis(self.config.keepalive_interval_ms),
                self.config.keepalive_policy,
            ),
            &StreamCapture::new(self.config.read_size, self.config.retry),
            &mut sink,
            &self.counter,
            self.observer.as_ref(),
            &self.stop,
        )?;

        Ok(SessionOutcome::Streamed {
            bitstream,
            activation,
            stream,
        })
    }

    fn emit(&self, event: CaptureEvent) {
        self.observer.on_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_flags() {
        assert_eq!(Stage::from_flags(true, false).unwrap(), Stage::Firmware);
        assert_eq!(Stage::from_flags(false, true).unwrap(), Stage::Bitstream);
        assert!(Stage::from_flags(false, false).is_err());
        assert!(Stage::from_flags(true, true).is_err());
    }

    #[test]
    fn test_config_defaults_and_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbcap.toml");
        std::fs::write(
            &path,
            "output_path = \"capture.raw\"\nkeepalive_policy = \"ignore\"\n\n[retry]\nmax_consecutive_failures = 50\n",
        )
        .unwrap();

        let config = SessionConfig::load_from_file(&path).unwrap();

        assert_eq!(config.output_path, "capture.raw");
        assert_eq!(config.keepalive_policy, KeepAliveFailurePolicy::Ignore);
        assert_eq!(config.retry.max_consecutive_failures, Some(50));
        assert_eq!(config.vendor_id, 0x5555);
        assert_eq!(config.product_id, 0x3382);
        assert_eq!(config.settle_delay_ms, 2000);
        assert_eq!(config.stage1_exit_delay_ms, 1000);
        assert_eq!(config.keepalive_interval_ms, 200);
        assert_eq!(config.read_size, 368_640);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbcap.toml");
        let config = SessionConfig {
            capture_secs: Some(10),
            ..SessionConfig::default()
        };

        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();

        assert_eq!(loaded.capture_secs, Some(10));
        assert_eq!(loaded.bitstream_script, config.bitstream_script);
    }

    #[test]
    fn test_fpga_query_shape() {
        let t = fpga_query();
        assert_eq!(t.request_type(), 0xC0);
        assert_eq!(t.request(), 185);
        assert_eq!(t.value(), 0x0021);
        assert_eq!(t.length(), 64);
    }
}
