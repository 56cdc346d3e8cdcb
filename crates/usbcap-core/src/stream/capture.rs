//! Bulk capture loop.
//!
//! Every iteration reads into a fresh buffer and appends exactly the bytes
//! received to the sink, flushed before they are counted. Read failures are retried; the default policy
//! retries immediately and forever, a hardened policy backs off and gives up
//! after a run of consecutive failures.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::StopSignal;
use crate::device::DeviceSession;
use crate::events::{CaptureEvent, CaptureObserver};
use crate::protocol::constants::CAPTURE_READ_SIZE;
use crate::transport::UsbTransport;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to write capture output: {0}")]
    Sink(#[from] std::io::Error),
    #[error("Giving up after {consecutive} consecutive read failures: {last}")]
    CircuitOpen { consecutive: u32, last: String },
}

/// Running total of captured bytes. Only the capture loop adds to it.
#[derive(Debug, Default)]
pub struct CaptureCounter(AtomicU64);

impl CaptureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::AcqRel) + n
    }
}

/// Retry behaviour after a failed bulk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failure of a run; zero retries immediately.
    pub backoff_initial_ms: u64,
    /// Upper bound of the doubling delay.
    pub backoff_max_ms: u64,
    /// Stop capturing after this many consecutive failures.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_initial_ms: 0,
            backoff_max_ms: 0,
            max_consecutive_failures: None,
        }
    }
}

impl RetryPolicy {
    /// Bounded exponential backoff with a circuit breaker.
    pub fn hardened(max_consecutive_failures: u32) -> Self {
        Self {
            backoff_initial_ms: 10,
            backoff_max_ms: 1000,
            max_consecutive_failures: Some(max_consecutive_failures),
        }
    }

    /// Delay before retrying after the `consecutive`-th failure in a row.
    pub fn delay_for(&self, consecutive: u32) -> Duration {
        if self.backoff_initial_ms == 0 || consecutive == 0 {
            return Duration::ZERO;
        }
        let shift = (consecutive - 1).min(16);
        let ms = self
            .backoff_initial_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms.max(self.backoff_initial_ms));
        Duration::from_millis(ms)
    }

    fn trips(&self, consecutive: u32) -> bool {
        self.max_consecutive_failures
            .is_some_and(|max| consecutive >= max)
    }
}

/// Counters of a finished capture run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub reads: u64,
    pub failed_reads: u64,
    pub bytes: u64,
}

pub struct StreamCapture {
    read_size: usize,
    retry: RetryPolicy,
}

impl Default for StreamCapture {
    fn default() -> Self {
        Self::new(CAPTURE_READ_SIZE, RetryPolicy::default())
    }
}

impl StreamCapture {
    pub fn new(read_size: usize, retry: RetryPolicy) -> Self {
        Self { read_size, retry }
    }

    /// Read from the capture endpoint into `sink` until `stop` is raised.
    pub fn run<T, W, O>(
        &self,
        session: &DeviceSession<T>,
        sink: &mut W,
        counter: &CaptureCounter,
        observer: &O,
        stop: &StopSignal,
    ) -> Result<CaptureSummary, CaptureError>
    where
        T: UsbTransport,
        W: Write + ?Sized,
        O: CaptureObserver + ?Sized,
    {
        let mut summary = CaptureSummary::default();
        let mut consecutive: u32 = 0;

        while !stop.is_stopped() {
            summary.reads += 1;
            match session.read_bulk(self.read_size) {
                Ok(data) => {
                    consecutive = 0;
                    sink.write_all(&data)?;
                    sink.flush()?;
                    let total = counter.add(data.len() as u64);
                    summary.bytes += data.len() as u64;
                    observer.on_event(&CaptureEvent::BytesCaptured {
                        chunk: data.len(),
                        total,
                    });
                }
                Err(e) => {
                    consecutive = consecutive.saturating_add(1);
                    summary.failed_reads += 1;
                    let message = e.to_string();
                    observer.on_event(&CaptureEvent::ReadFailed {
                        consecutive,
                        message: message.clone(),
                    });

                    if self.retry.trips(consecutive) {
                        sink.flush()?;
                        return Err(CaptureError::CircuitOpen {
                            consecutive,
                            last: message,
                        });
                    }

                    let delay = self.retry.delay_for(consecutive);
                    if !delay.is_zero() && stop.wait_timeout(delay) {
                        break;
                    }
                }
            }
        }

        sink.flush()?;
        Ok(summary)
    }
}
