//! Cooperative stop signal shared by the streaming threads.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Cloneable stop flag whose waits wake up as soon as it is raised.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter.
    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|p| p.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep for `timeout` or until stopped. Returns `true` when stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = lock.lock().unwrap_or_else(|p| p.into_inner());
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = match cvar.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
        *stopped
    }

    /// Raise the signal after `delay` unless it is raised earlier.
    pub fn stop_after(&self, delay: Duration) -> thread::JoinHandle<()> {
        let signal = self.clone();
        thread::spawn(move || {
            if !signal.wait_timeout(delay) {
                tracing::info!(secs = delay.as_secs_f64(), "Capture duration elapsed");
                signal.stop();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times_out_when_not_stopped() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        assert!(!signal.is_stopped());
    }

    #[test]
    fn test_stop_wakes_waiter() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));

        thread::sleep(Duration::from_millis(10));
        signal.stop();

        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_stop_after() {
        let signal = StopSignal::new();
        signal.stop_after(Duration::from_millis(5)).join().unwrap();
        assert!(signal.is_stopped());
    }
}
