//! Mock USB transport for testing.
//!
//! Simulates the capture peripheral: records every control transfer, lets a
//! test inject failures at each bring-up step and serves queued bulk chunks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::traits::{InterfaceSummary, TransportError, UsbTransport};
use crate::protocol::constants::{CAPTURE_PRODUCT_ID, CAPTURE_VENDOR_ID};
use crate::protocol::{ControlTransfer, TransferDirection};

/// Mock transport for unit testing bring-up and streaming logic.
///
/// Clones share the transfer log and the queues.
#[derive(Clone)]
pub struct MockTransport {
    /// Captured control transfers, in issue order (failed ones included).
    control_log: Arc<Mutex<Vec<ControlTransfer>>>,
    /// Number of upcoming control transfers that fail.
    fail_controls: Arc<AtomicUsize>,
    /// Queued IN control responses.
    control_responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Queued bulk read results.
    bulk_queue: Arc<Mutex<VecDeque<Result<Vec<u8>, TransportError>>>>,
    /// Number of bulk reads attempted.
    bulk_reads: Arc<AtomicUsize>,
    /// Time each bulk read blocks before completing, in milliseconds.
    read_delay_ms: Arc<AtomicU64>,
    /// Configuration values the device offers.
    configurations: Vec<u8>,
    /// Endpoint addresses exposed on interface 0 / alt 0.
    endpoints: Vec<u8>,
    fail_claim: bool,
    claimed: Arc<Mutex<Option<(u8, u8)>>>,
    resolved: Arc<Mutex<Option<u8>>>,
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            control_log: Arc::new(Mutex::new(Vec::new())),
            fail_controls: Arc::new(AtomicUsize::new(0)),
            control_responses: Arc::new(Mutex::new(VecDeque::new())),
            bulk_queue: Arc::new(Mutex::new(VecDeque::new())),
            bulk_reads: Arc::new(AtomicUsize::new(0)),
            read_delay_ms: Arc::new(AtomicU64::new(0)),
            configurations: vec![1],
            endpoints: vec![0x82],
            fail_claim: false,
            claimed: Arc::new(Mutex::new(None)),
            resolved: Arc::new(Mutex::new(None)),
            vid: CAPTURE_VENDOR_ID,
            pid: CAPTURE_PRODUCT_ID,
        }
    }

    /// Fail the next `count` control transfers.
    pub fn fail_next_controls(&self, count: usize) {
        self.fail_controls.store(count, Ordering::SeqCst);
    }

    /// Queue the data returned by the next IN control transfer.
    pub fn queue_control_response(&self, data: &[u8]) {
        self.control_responses
            .lock()
            .unwrap()
            .push_back(data.to_vec());
    }

    /// Queue a chunk returned by a bulk read.
    pub fn queue_bulk(&self, data: &[u8]) {
        self.bulk_queue.lock().unwrap().push_back(Ok(data.to_vec()));
    }

    /// Queue a failing bulk read.
    pub fn queue_bulk_error(&self, error: TransportError) {
        self.bulk_queue.lock().unwrap().push_back(Err(error));
    }

    /// Replace the configurations the device offers.
    pub fn set_configurations(&mut self, configurations: &[u8]) {
        self.configurations = configurations.to_vec();
    }

    /// Replace the endpoints exposed on interface 0.
    pub fn set_endpoints(&mut self, endpoints: &[u8]) {
        self.endpoints = endpoints.to_vec();
    }

    /// Block every bulk read for `delay`, like a transfer waiting on the device.
    pub fn delay_reads(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make interface claims fail.
    pub fn fail_interface_claim(&mut self) {
        self.fail_claim = true;
    }

    /// Get all captured control transfers.
    pub fn controls(&self) -> Vec<ControlTransfer> {
        self.control_log.lock().unwrap().clone()
    }

    /// Count captured control transfers with the given bRequest.
    pub fn count_requests(&self, request: u8) -> usize {
        self.control_log
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.request() == request)
            .count()
    }

    /// Clear captured control transfers.
    pub fn clear_controls(&self) {
        self.control_log.lock().unwrap().clear();
    }

    /// Number of bulk reads attempted so far.
    pub fn bulk_reads(&self) -> usize {
        self.bulk_reads.load(Ordering::SeqCst)
    }

    /// Bulk results still waiting in the queue.
    pub fn pending_bulk(&self) -> usize {
        self.bulk_queue.lock().unwrap().len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn control(&self, transfer: &ControlTransfer) -> Result<Vec<u8>, TransportError> {
        self.control_log.lock().unwrap().push(transfer.clone());

        let failing = self
            .fail_controls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::ControlFailed {
                request: transfer.request(),
                message: "simulated stall".into(),
            });
        }

        match transfer.direction() {
            TransferDirection::Out => Ok(Vec::new()),
            TransferDirection::In => {
                let mut data = self
                    .control_responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| vec![0u8; transfer.length()]);
                data.truncate(transfer.length());
                Ok(data)
            }
        }
    }

    fn set_configuration(&self, config: u8) -> Result<(), TransportError> {
        if self.configurations.contains(&config) {
            Ok(())
        } else {
            Err(TransportError::ConfigurationUnavailable {
                config,
                message: "simulated missing configuration".into(),
            })
        }
    }

    fn claim_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        if self.fail_claim || interface != 0 || alt_setting != 0 {
            return Err(TransportError::ClaimInterfaceFailed {
                interface,
                alt_setting,
                message: "simulated busy interface".into(),
            });
        }
        *self.claimed.lock().unwrap() = Some((interface, alt_setting));
        Ok(())
    }

    fn resolve_in_endpoint(&self, number: u8) -> Result<u8, TransportError> {
        let (interface, _) = self
            .claimed
            .lock()
            .unwrap()
            .ok_or(TransportError::NotClaimed)?;
        let address = self
            .endpoints
            .iter()
            .copied()
            .find(|addr| addr & 0x80 != 0 && addr & 0x0F == number)
            .ok_or_else(|| TransportError::EndpointNotFound {
                requested: number,
                interface,
                available: self.endpoints.clone(),
            })?;
        *self.resolved.lock().unwrap() = Some(address);
        Ok(address)
    }

    fn read_bulk(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if self.resolved.lock().unwrap().is_none() {
            return Err(TransportError::NotClaimed);
        }
        self.bulk_reads.fetch_add(1, Ordering::SeqCst);

        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }

        let next = self.bulk_queue.lock().unwrap().pop_front();
        match next {
            Some(Ok(mut data)) => {
                data.truncate(max_len);
                Ok(data)
            }
            Some(Err(e)) => Err(e),
            None => {
                // Idle bus: behave like a short read timeout.
                thread::sleep(Duration::from_millis(1));
                Err(TransportError::Timeout { timeout_ms: 1 })
            }
        }
    }

    fn describe(&self, config: u8) -> Vec<InterfaceSummary> {
        if !self.configurations.contains(&config) {
            return Vec::new();
        }
        vec![InterfaceSummary {
            interface: 0,
            alt_setting: 0,
            endpoints: self.endpoints.clone(),
        }]
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_control_capture() {
        let mock = MockTransport::new();
        mock.control(&ControlTransfer::vendor_out(1, 0, 0, b"Hello"))
            .unwrap();
        mock.control(&ControlTransfer::vendor_out(2, 0, 0, b"World"))
            .unwrap();

        let controls = mock.controls();
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[0].payload(), b"Hello");
        assert_eq!(controls[1].request(), 2);
    }

    #[test]
    fn test_mock_failure_injection() {
        let mock = MockTransport::new();
        mock.fail_next_controls(2);

        let t = ControlTransfer::vendor_out(9, 0, 0, &[]);
        assert!(mock.control(&t).is_err());
        assert!(mock.control(&t).is_err());
        assert!(mock.control(&t).is_ok());
        assert_eq!(mock.count_requests(9), 3);
    }

    #[test]
    fn test_mock_in_response() {
        let mock = MockTransport::new();
        mock.queue_control_response(&[1, 2, 3, 4]);

        let data = mock
            .control(&ControlTransfer::vendor_in(177, 0, 0, 12))
            .unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);

        // Nothing queued: device answers with a zeroed buffer.
        let data = mock
            .control(&ControlTransfer::vendor_in(177, 0, 0, 12))
            .unwrap();
        assert_eq!(data, vec![0u8; 12]);
    }

    #[test]
    fn test_mock_bulk_requires_endpoint() {
        let mock = MockTransport::new();
        mock.queue_bulk(b"data");
        assert!(matches!(mock.read_bulk(16), Err(TransportError::NotClaimed)));

        mock.claim_interface(0, 0).unwrap();
        assert_eq!(mock.resolve_in_endpoint(2).unwrap(), 0x82);
        assert_eq!(mock.read_bulk(16).unwrap(), b"data");
        assert_eq!(mock.bulk_reads(), 1);
    }

    #[test]
    fn test_mock_missing_endpoint() {
        let mut mock = MockTransport::new();
        mock.set_endpoints(&[0x81]);
        mock.claim_interface(0, 0).unwrap();

        let err = mock.resolve_in_endpoint(2).unwrap_err();
        assert!(matches!(
            err,
            TransportError::EndpointNotFound { requested: 2, .. }
        ));
    }
}
