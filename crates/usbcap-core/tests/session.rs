use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use usbcap_core::device::DeviceSession;
use usbcap_core::events::{CaptureEvent, RecordingObserver};
use usbcap_core::protocol::ControlTransfer;
use usbcap_core::script::{ControlScript, ScriptKind};
use usbcap_core::session::{CaptureSession, SessionConfig, SessionOutcome, Stage};
use usbcap_core::state::BringupState;
use usbcap_core::transport::MockTransport;

fn script(kind: ScriptKind, n: usize) -> ControlScript {
    let transfers = (0..n)
        .map(|i| ControlTransfer::vendor_out(0xA0, i as u16, 0, &[i as u8; 4]))
        .collect();
    ControlScript::new(kind, transfers)
}

fn fast_config(dir: &tempfile::TempDir) -> SessionConfig {
    SessionConfig {
        output_path: dir.path().join("debug").to_string_lossy().into_owned(),
        settle_delay_ms: 0,
        stage1_exit_delay_ms: 0,
        keepalive_interval_ms: 5,
        ..SessionConfig::default()
    }
}

#[test]
fn stage1_replays_firmware_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let session = CaptureSession::with_observer(fast_config(&dir), Arc::clone(&observer));
    let mock = MockTransport::new();

    let outcome = session
        .run_with_session(
            DeviceSession::new(mock.clone()),
            Stage::Firmware,
            &script(ScriptKind::Firmware, 30),
        )
        .unwrap();

    match outcome {
        SessionOutcome::FirmwareLoaded { firmware } => {
            assert_eq!(firmware.issued, 30);
            assert!(firmware.is_clean());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(observer.ticks(), "USB");
    assert_eq!(mock.controls().len(), 30);
    assert_eq!(mock.bulk_reads(), 0);
    assert!(!dir.path().join("debug").exists());
    assert!(observer.events().iter().any(|e| matches!(
        e,
        CaptureEvent::Interfaces { config: 1, interfaces }
            if interfaces.len() == 1 && interfaces[0].endpoints == vec![0x82]
    )));
    assert!(observer.events().iter().any(|e| matches!(
        e,
        CaptureEvent::PhaseChanged {
            to: BringupState::FirmwareLoaded,
            ..
        }
    )));
}

#[test]
fn stage2_streams_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let session = CaptureSession::with_observer(fast_config(&dir), Arc::clone(&observer));
    let mock = MockTransport::new();
    mock.queue_control_response(&[0x5A; 64]);
    mock.queue_bulk(&[1u8; 1000]);
    mock.queue_bulk(&[2u8; 24]);

    let stop = session.stop_signal();
    let counter = session.counter();
    let stopper = thread::spawn(move || {
        let start = Instant::now();
        while counter.get() < 1024 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        stop.stop();
    });

    let outcome = session
        .run_with_session(
            DeviceSession::new(mock.clone()),
            Stage::Bitstream,
            &script(ScriptKind::Bitstream, 240),
        )
        .unwrap();
    stopper.join().unwrap();

    let SessionOutcome::Streamed {
        bitstream,
        activation,
        stream,
    } = outcome
    else {
        panic!("stage 2 must stream");
    };
    assert_eq!(bitstream.issued, 240);
    assert_eq!(activation.endpoint, 0x82);
    assert_eq!(stream.capture.bytes, 1024);
    assert!(stream.keepalive.rounds >= 1);

    let written = std::fs::read(dir.path().join("debug")).unwrap();
    assert_eq!(written.len(), 1024);
    assert_eq!(&written[..1000], &[1u8; 1000][..]);

    // FPGA query first, then the bitstream in order.
    let controls = mock.controls();
    assert_eq!(controls[0].request(), 185);
    assert_eq!(controls[0].value(), 0x0021);
    for (i, t) in controls[1..241].iter().enumerate() {
        assert_eq!(t.value(), i as u16);
    }
    assert_eq!(observer.ticks(), "FPGA");
    assert!(observer.events().iter().any(|e| matches!(
        e,
        CaptureEvent::Diagnostic { label, data } if label == "fpga-query" && data.len() == 64
    )));
}

#[test]
fn output_file_keeps_up_with_counter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("debug");
    let session = CaptureSession::with_observer(
        fast_config(&dir),
        Arc::new(RecordingObserver::new()),
    );
    let mock = MockTransport::new();
    mock.queue_bulk(&[0xEE; 4096]);

    let stop = session.stop_signal();
    let counter = session.counter();
    let watched = path.clone();
    let watcher = thread::spawn(move || {
        let start = Instant::now();
        while counter.get() < 4096 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        // Still streaming: the bytes already counted must be in the file.
        let on_disk = std::fs::metadata(&watched).map(|m| m.len()).unwrap_or(0);
        stop.stop();
        on_disk
    });

    session
        .run_with_session(
            DeviceSession::new(mock),
            Stage::Bitstream,
            &script(ScriptKind::Bitstream, 8),
        )
        .unwrap();

    assert_eq!(watcher.join().unwrap(), 4096);
    assert_eq!(std::fs::read(&path).unwrap().len(), 4096);
}

#[test]
fn stage1_pauses_before_exit() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        stage1_exit_delay_ms: SessionConfig::default().stage1_exit_delay_ms,
        ..fast_config(&dir)
    };
    let session = CaptureSession::new(config);

    let start = Instant::now();
    let outcome = session
        .run_with_session(
            DeviceSession::new(MockTransport::new()),
            Stage::Firmware,
            &script(ScriptKind::Firmware, 30),
        )
        .unwrap();

    assert!(matches!(outcome, SessionOutcome::FirmwareLoaded { .. }));
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[test]
fn missing_endpoint_fails_before_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let session = CaptureSession::with_observer(
        fast_config(&dir),
        Arc::new(RecordingObserver::new()),
    );
    let mut mock = MockTransport::new();
    mock.set_endpoints(&[0x81, 0x01]);
    let handle = mock.clone();

    let err = session
        .run_with_session(
            DeviceSession::new(mock),
            Stage::Bitstream,
            &script(ScriptKind::Bitstream, 10),
        )
        .unwrap_err();

    let message = format!("{:#}", err);
    assert!(message.contains("0x81"), "{}", message);
    assert_eq!(handle.bulk_reads(), 0);
    assert_eq!(handle.count_requests(184), 0);
    assert!(!dir.path().join("debug").exists());
}

#[test]
fn bitstream_failures_are_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let session = CaptureSession::with_observer(
        fast_config(&dir),
        Arc::new(RecordingObserver::new()),
    );
    let mock = MockTransport::new();
    // The FPGA query and the first five bitstream transfers fail.
    mock.fail_next_controls(6);
    session.stop_signal().stop();

    let outcome = session
        .run_with_session(
            DeviceSession::new(mock.clone()),
            Stage::Bitstream,
            &script(ScriptKind::Bitstream, 20),
        )
        .unwrap();

    let SessionOutcome::Streamed {
        bitstream, stream, ..
    } = outcome
    else {
        panic!("stage 2 must stream");
    };
    assert_eq!(bitstream.failures, 5);
    assert_eq!(bitstream.failed_indices, vec![0, 1, 2, 3, 4]);
    assert_eq!(stream.capture.reads, 0);
    assert_eq!(mock.bulk_reads(), 0);
}

#[test]
fn wrong_script_kind_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let session = CaptureSession::new(fast_config(&dir));

    let err = session
        .run_with_session(
            DeviceSession::new(MockTransport::new()),
            Stage::Firmware,
            &script(ScriptKind::Bitstream, 3),
        )
        .unwrap_err();

    assert!(err.to_string().contains("firmware"));
}
