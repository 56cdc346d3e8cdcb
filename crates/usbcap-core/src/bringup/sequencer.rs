//! Script replay.
//!
//! Replay is best-effort: a failed transfer is recorded and reported, and
//! the next descriptor is issued anyway. Loaders on this device tolerate a
//! few rejected vendor commands (status polls, mostly).

use crate::device::DeviceSession;
use crate::events::{CaptureEvent, CaptureObserver};
use crate::script::{ControlScript, ScriptKind};
use crate::state::{BringupState, StateError};
use crate::transport::UsbTransport;

/// Outcome of one script replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Transfers issued (always the script length).
    pub issued: usize,
    /// Transfers that failed.
    pub failures: usize,
    /// Script indices of the failed transfers, ascending.
    pub failed_indices: Vec<usize>,
}

impl ReplayReport {
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

/// Replays control scripts against a device session.
pub struct BringupSequencer<'a, O: CaptureObserver + ?Sized> {
    observer: &'a O,
}

impl<'a, O: CaptureObserver + ?Sized> BringupSequencer<'a, O> {
    pub fn new(observer: &'a O) -> Self {
        Self { observer }
    }

    /// Issue every descriptor of `script`, in order.
    pub fn replay<T: UsbTransport>(
        &self,
        session: &DeviceSession<T>,
        script: &ControlScript,
    ) -> ReplayReport {
        let kind = script.kind();
        let total = script.len();
        let plan = script.progress_plan();
        let mut report = ReplayReport::default();

        self.observer
            .on_event(&CaptureEvent::ReplayStarted { kind, total });

        for (index, transfer) in script.iter().enumerate() {
            if let Some(symbol) = plan.symbol_at(index, total) {
                self.observer.on_event(&CaptureEvent::ProgressTick {
                    kind,
                    symbol,
                    index,
                    total,
                });
            }

            report.issued += 1;
            if let Err(e) = session.control(transfer) {
                report.failures += 1;
                report.failed_indices.push(index);
                self.observer.on_event(&CaptureEvent::TransferFailed {
                    kind,
                    index,
                    request: transfer.request(),
                    message: e.to_string(),
                });
            }
        }

        self.observer.on_event(&CaptureEvent::ReplayFinished {
            kind,
            issued: report.issued,
            failures: report.failures,
        });
        report
    }

    /// Replay `script` and move the session to the matching loaded state.
    ///
    /// The transition is checked before anything is sent, so a bitstream is
    /// never replayed against a session that is already past that point.
    pub fn load<T: UsbTransport>(
        &self,
        session: &mut DeviceSession<T>,
        script: &ControlScript,
    ) -> Result<ReplayReport, StateError> {
        let target = match script.kind() {
            ScriptKind::Firmware => BringupState::FirmwareLoaded,
            ScriptKind::Bitstream => BringupState::BitstreamLoaded,
        };
        let from = session.state();
        if !from.can_transition(target) {
            return Err(StateError { from, to: target });
        }

        let report = self.replay(session, script);

        session.advance(target)?;
        self.observer
            .on_event(&CaptureEvent::PhaseChanged { from, to: target });
        Ok(report)
    }
}
