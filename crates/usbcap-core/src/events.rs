//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front-end) to subscribe to bring-up and
//! capture events without tight coupling to the core logic.

use std::fmt;
use std::sync::Mutex;

use crate::script::ScriptKind;
use crate::state::BringupState;
use crate::transport::InterfaceSummary;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Resource acquired during activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Config,
    Interface,
    Endpoint,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Config => write!(f, "Config"),
            Resource::Interface => write!(f, "Interface"),
            Resource::Endpoint => write!(f, "Endpoint"),
        }
    }
}

/// Events emitted by a capture session.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// Device opened.
    DeviceOpened { vid: u16, pid: u16 },
    /// Descriptor layout of the capture configuration.
    Interfaces { config: u8, interfaces: Vec<InterfaceSummary> },
    /// Bring-up state changed.
    PhaseChanged { from: BringupState, to: BringupState },
    /// Script replay starting.
    ReplayStarted { kind: ScriptKind, total: usize },
    /// Progress tick for the current replay.
    ProgressTick {
        kind: ScriptKind,
        symbol: char,
        index: usize,
        total: usize,
    },
    /// One scripted transfer failed; replay continues.
    TransferFailed {
        kind: ScriptKind,
        index: usize,
        request: u8,
        message: String,
    },
    /// Script replay finished.
    ReplayFinished {
        kind: ScriptKind,
        issued: usize,
        failures: usize,
    },
    /// Activation acquired a resource.
    ResourceAcquired { resource: Resource },
    /// Opaque bytes read back from the device.
    Diagnostic { label: String, data: Vec<u8> },
    /// A keep-alive transfer failed.
    KeepAliveFailed { request: u8, message: String },
    /// Bytes appended to the sink.
    BytesCaptured { chunk: usize, total: u64 },
    /// A bulk read failed and will be retried.
    ReadFailed { consecutive: u32, message: String },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Background activities stopped.
    Stopped { total: u64 },
}

/// Observer trait for receiving capture events.
///
/// Implement this trait in your UI layer to receive updates. Events arrive
/// from both background threads while streaming.
pub trait CaptureObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &CaptureEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl CaptureObserver for NullObserver {
    fn on_event(&self, _event: &CaptureEvent) {}
}

/// Observer that keeps every event, for inspection in tests.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<CaptureEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CaptureEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Progress symbols in emission order.
    pub fn ticks(&self) -> String {
        self.events()
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::ProgressTick { symbol, .. } => Some(*symbol),
                _ => None,
            })
            .collect()
    }
}

impl CaptureObserver for RecordingObserver {
    fn on_event(&self, event: &CaptureEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl CaptureObserver for TracingObserver {
    fn on_event(&self, event: &CaptureEvent) {
        match event {
            CaptureEvent::DeviceOpened { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device opened");
            }
            CaptureEvent::Interfaces { config, interfaces } => {
                for iface in interfaces {
                    tracing::debug!(
                        config,
                        interface = iface.interface,
                        alt = iface.alt_setting,
                        endpoints = %crate::transport::format_endpoints(&iface.endpoints),
                        "Interface"
                    );
                }
            }
            CaptureEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            CaptureEvent::ReplayStarted { kind, total } => {
                tracing::info!(kind = %kind, total, "Replaying script");
            }
            CaptureEvent::ProgressTick {
                kind,
                symbol,
                index,
                total,
            } => {
                tracing::debug!(kind = %kind, symbol = %symbol, index, total, "Progress");
            }
            CaptureEvent::TransferFailed {
                kind,
                index,
                request,
                message,
            } => {
                tracing::warn!(kind = %kind, index, request, "Scripted transfer failed: {}", message);
            }
            CaptureEvent::ReplayFinished {
                kind,
                issued,
                failures,
            } => {
                if *failures > 0 {
                    tracing::warn!(kind = %kind, issued, failures, "Replay finished with failures");
                } else {
                    tracing::info!(kind = %kind, issued, "Replay finished");
                }
            }
            CaptureEvent::ResourceAcquired { resource } => {
                tracing::info!(resource = %resource, "Acquired");
            }
            CaptureEvent::Diagnostic { label, data } => {
                tracing::info!(label = %label, blob = %hex::encode(data), "Diagnostic blob");
            }
            CaptureEvent::KeepAliveFailed { request, message } => {
                tracing::warn!(request, "Keep-alive transfer failed: {}", message);
            }
            CaptureEvent::BytesCaptured { chunk, total } => {
                tracing::trace!(chunk, total, "Captured");
            }
            CaptureEvent::ReadFailed {
                consecutive,
                message,
            } => {
                tracing::warn!(consecutive, "Bulk read failed: {}", message);
            }
            CaptureEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            CaptureEvent::Stopped { total } => {
                tracing::info!(total_bytes = total, "Capture stopped");
            }
        }
    }
}
