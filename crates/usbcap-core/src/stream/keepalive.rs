//! Periodic keep-alive writes.
//!
//! Without them the device stops producing data shortly after activation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::StopSignal;
use crate::device::DeviceSession;
use crate::events::{CaptureEvent, CaptureObserver};
use crate::protocol::ControlTransfer;
use crate::protocol::constants::*;
use crate::transport::UsbTransport;

/// What to do when a keep-alive transfer fails. Failures are never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepAliveFailurePolicy {
    /// Drop the error silently.
    Ignore,
    /// Report the error and keep going.
    #[default]
    Log,
}

impl FromStr for KeepAliveFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown keep-alive policy '{other}' (expected ignore|log)")),
        }
    }
}

impl fmt::Display for KeepAliveFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignore => write!(f, "ignore"),
            Self::Log => write!(f, "log"),
        }
    }
}

/// The two transfers sent every round: register blob, then run command.
pub fn keepalive_transfers() -> [ControlTransfer; 2] {
    [
        ControlTransfer::vendor_out(VENDOR_REQ_REGISTER_WRITE, 0, 0, &KEEPALIVE_REGISTER_BLOB),
        ControlTransfer::vendor_out(VENDOR_REQ_RUN, RUN_VALUE, 0, &[]),
    ]
}

/// Counters of a finished keep-alive run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveStats {
    pub rounds: u64,
    pub failures: u64,
}

pub struct KeepAliveTask {
    interval: Duration,
    policy: KeepAliveFailurePolicy,
}

impl Default for KeepAliveTask {
    fn default() -> Self {
        Self::new(KEEPALIVE_INTERVAL, KeepAliveFailurePolicy::default())
    }
}

impl KeepAliveTask {
    pub fn new(interval: Duration, policy: KeepAliveFailurePolicy) -> Self {
        Self { interval, policy }
    }

    /// Send both transfers, pause, repeat until `stop` is raised.
    pub fn run<T: UsbTransport, O: CaptureObserver + ?Sized>(
        &self,
        session: &DeviceSession<T>,
        observer: &O,
        stop: &StopSignal,
    ) -> KeepAliveStats {
        let transfers = keepalive_transfers();
        let mut stats = KeepAliveStats::default();

        while !stop.is_stopped() {
            for transfer in &transfers {
                if let Err(e) = session.control(transfer) {
                    stats.failures += 1;
                    if self.policy == KeepAliveFailurePolicy::Log {
                        observer.on_event(&CaptureEvent::KeepAliveFailed {
                            request: transfer.request(),
                            message: e.to_string(),
                        });
                    }
                }
            }
            stats.rounds += 1;

            if stop.wait_timeout(self.interval) {
                break;
            }
        }

        tracing::debug!(rounds = stats.rounds, failures = stats.failures, "Keep-alive stopped");
        stats
    }
}
