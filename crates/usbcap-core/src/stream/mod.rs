//! Streaming: keep-alive and capture running side by side.
//!
//! Both activities run on scoped threads and share the device session by
//! reference. The caller's stop signal ends capture. The keep-alive has its
//! own signal, raised only once the capture thread has returned: a bulk read
//! still in flight needs the device to keep producing data.

pub mod capture;
pub mod keepalive;
pub mod stop;

use std::io::Write;
use std::thread;

use thiserror::Error;

use crate::device::DeviceSession;
use crate::events::{CaptureEvent, CaptureObserver};
use crate::state::BringupState;
use crate::transport::UsbTransport;

pub use capture::{CaptureCounter, CaptureError, CaptureSummary, RetryPolicy, StreamCapture};
pub use keepalive::{KeepAliveFailurePolicy, KeepAliveStats, KeepAliveTask, keepalive_transfers};
pub use stop::StopSignal;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Streaming requires state STREAMING, session is {0}")]
    NotStreaming(BringupState),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("Streaming thread panicked")]
    Panicked,
}

/// Counters of a finished streaming run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamReport {
    pub capture: CaptureSummary,
    pub keepalive: KeepAliveStats,
}

/// Run keep-alive and capture until `stop` is raised or capture fails.
pub fn run_streaming<T, W, O>(
    session: &DeviceSession<T>,
    keepalive: &KeepAliveTask,
    capture: &StreamCapture,
    sink: &mut W,
    counter: &CaptureCounter,
    observer: &O,
    stop: &StopSignal,
) -> Result<StreamReport, StreamError>
where
    T: UsbTransport,
    W: Write + Send + ?Sized,
    O: CaptureObserver + ?Sized,
{
    if !session.state().is_streaming() {
        return Err(StreamError::NotStreaming(session.state()));
    }

    let keepalive_stop = StopSignal::new();
    let (keepalive_stats, capture_result) = thread::scope(|s| {
        let keepalive_handle = thread::Builder::new()
            .name("keepalive".into())
            .spawn_scoped(s, || keepalive.run(session, observer, &keepalive_stop));
        let capture_handle = thread::Builder::new()
            .name("capture".into())
            .spawn_scoped(s, || {
                let result = capture.run(session, sink, counter, observer, stop);
                stop.stop();
                result
            });

        let capture_result = match capture_handle {
            Ok(handle) => handle.join().map_err(|_| StreamError::Panicked),
            Err(e) => {
                tracing::error!("Failed to spawn capture thread: {}", e);
                Err(StreamError::Panicked)
            }
        };
        stop.stop();
        keepalive_stop.stop();
        let keepalive_stats = match keepalive_handle {
            Ok(handle) => handle.join().unwrap_or_default(),
            Err(e) => {
                tracing::error!("Failed to spawn keep-alive thread: {}", e);
                KeepAliveStats::default()
            }
        };
        (keepalive_stats, capture_result)
    });

    observer.on_event(&CaptureEvent::Stopped {
        total: counter.get(),
    });

    let capture_summary = capture_result??;
    Ok(StreamReport {
        capture: capture_summary,
        keepalive: keepalive_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn session_in(state_path: &[BringupState]) -> DeviceSession<MockTransport> {
        let mut session = DeviceSession::new(MockTransport::new());
        session.acquire_configuration(1).unwrap();
        session.claim_interface(0, 0).unwrap();
        session.resolve_in_endpoint(2).unwrap();
        for state in state_path {
            session.advance(*state).unwrap();
        }
        session
    }

    #[test]
    fn test_refuses_to_stream_before_activation() {
        let session = session_in(&[BringupState::BitstreamLoaded]);

        let err = run_streaming(
            &session,
            &KeepAliveTask::default(),
            &StreamCapture::default(),
            &mut Vec::new(),
            &CaptureCounter::new(),
            &NullObserver,
            &StopSignal::new(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StreamError::NotStreaming(BringupState::BitstreamLoaded)
        ));
        assert_eq!(session.transport().bulk_reads(), 0);
        assert!(session.transport().controls().is_empty());
    }

    #[test]
    fn test_runs_both_until_stopped() {
        let session = session_in(&[
            BringupState::BitstreamLoaded,
            BringupState::Activated,
            BringupState::Streaming,
        ]);
        session.transport().queue_bulk(&[7u8; 512]);
        let stop = StopSignal::new();
        let counter = CaptureCounter::new();
        let mut sink = Vec::new();
        let _timer = stop.stop_after(Duration::from_millis(50));

        let report = run_streaming(
            &session,
            &KeepAliveTask::new(Duration::from_millis(5), KeepAliveFailurePolicy::Log),
            &StreamCapture::default(),
            &mut sink,
            &counter,
            &NullObserver,
            &stop,
        )
        .unwrap();

        assert_eq!(report.capture.bytes, 512);
        assert_eq!(sink, vec![7u8; 512]);
        assert!(report.keepalive.rounds >= 1);
        assert_eq!(
            session.transport().count_requests(184) as u64,
            report.keepalive.rounds
        );
    }

    #[test]
    fn test_keepalive_outlives_stop_while_read_in_flight() {
        let session = session_in(&[
            BringupState::BitstreamLoaded,
            BringupState::Activated,
            BringupState::Streaming,
        ]);
        session.transport().queue_bulk(&[3u8; 64]);
        session.transport().delay_reads(Duration::from_millis(200));
        let stop = StopSignal::new();
        let _timer = stop.stop_after(Duration::from_millis(20));

        let report = run_streaming(
            &session,
            &KeepAliveTask::new(Duration::from_millis(5), KeepAliveFailurePolicy::Log),
            &StreamCapture::default(),
            &mut Vec::new(),
            &CaptureCounter::new(),
            &NullObserver,
            &stop,
        )
        .unwrap();

        // The read started before the stop and returned ~180 ms after it;
        // keep-alive rounds continued until then.
        assert_eq!(report.capture.bytes, 64);
        assert_eq!(report.capture.reads, 1);
        assert!(report.keepalive.rounds >= 8, "rounds = {}", report.keepalive.rounds);
    }

    #[test]
    fn test_capture_failure_stops_keepalive() {
        let session = session_in(&[
            BringupState::BitstreamLoaded,
            BringupState::Activated,
            BringupState::Streaming,
        ]);
        session
            .transport()
            .queue_bulk_error(crate::transport::TransportError::Disconnected);
        let stop = StopSignal::new();

        let err = run_streaming(
            &session,
            &KeepAliveTask::default(),
            &StreamCapture::new(64, RetryPolicy {
                max_consecutive_failures: Some(1),
                ..RetryPolicy::default()
            }),
            &mut Vec::new(),
            &CaptureCounter::new(),
            &NullObserver,
            &stop,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StreamError::Capture(CaptureError::CircuitOpen { .. })
        ));
        assert!(stop.is_stopped());
    }
}
