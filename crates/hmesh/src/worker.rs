// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic worker thread: fires a callback once per period or on demand.
//!
//! Building block for the four timed activities in the mesh core
//! (auto-connect, heartbeat/hello, socket send, socket receive). Each
//! worker owns one OS thread that waits on a {terminate, wake} signal pair
//! with a deadline-based timeout:
//!
//! - period `0` runs the callback back-to-back,
//! - [`PERIOD_WAKE_ONLY`] blocks until [`PeriodicWorker::wakeup`],
//! - any other period fires on a monotonic deadline; a missed deadline
//!   fires once and re-anchors instead of bursting to catch up.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Period sentinel: never fire on a timer, only on explicit wake-up.
pub const PERIOD_WAKE_ONLY: u32 = u32::MAX;

/// Thread priority hint. Recorded and logged at spawn; scheduling is left
/// to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPriority {
    Normal,
    High,
}

/// Construction options for a [`PeriodicWorker`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Milliseconds between fires; `0` = as fast as possible,
    /// [`PERIOD_WAKE_ONLY`] = wake-driven only.
    pub period_ms: u32,
    /// CPU-affinity hint (bit per core). `!0` = no preference.
    pub affinity_mask: u32,
    /// Priority hint.
    pub priority: WorkerPriority,
}

impl WorkerOptions {
    /// Options with the given period and no placement preference.
    #[must_use]
    pub fn with_period(period_ms: u32) -> Self {
        Self {
            period_ms,
            affinity_mask: !0,
            priority: WorkerPriority::Normal,
        }
    }
}

#[derive(Debug)]
struct Signals {
    terminate: bool,
    wake: bool,
    period_ms: u32,
}

#[derive(Debug)]
struct Shared {
    signals: Mutex<Signals>,
    cond: Condvar,
}

/// Cloneable handle that can wake a worker without owning it.
#[derive(Clone)]
pub struct WakeHandle {
    shared: Arc<Shared>,
}

impl WakeHandle {
    /// Signal the worker to fire immediately.
    pub fn wake(&self) {
        let mut signals = self.shared.signals.lock();
        signals.wake = true;
        self.shared.cond.notify_all();
    }
}

/// A worker thread firing a callback per period or per wake-up.
pub struct PeriodicWorker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl PeriodicWorker {
    /// Spawn a named worker thread running `work` per the options.
    pub fn spawn<F>(name: &str, options: WorkerOptions, work: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            signals: Mutex::new(Signals {
                terminate: false,
                wake: false,
                period_ms: options.period_ms,
            }),
            cond: Condvar::new(),
        });

        log::debug!(
            "[worker] {} starting period={} affinity=0x{:x} priority={:?}",
            name,
            options.period_ms,
            options.affinity_mask,
            options.priority
        );

        let loop_shared = Arc::clone(&shared);
        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let thread = thread::Builder::new()
            .name(format!("hmesh-{name}"))
            .spawn(move || worker_loop(&loop_shared, work))
            .expect("failed to spawn worker thread");

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
            name: name.to_owned(),
        }
    }

    /// Current period in milliseconds.
    #[must_use]
    pub fn period_ms(&self) -> u32 {
        self.shared.signals.lock().period_ms
    }

    /// Change the period. Takes effect for the next cycle; the waiter is
    /// signalled so a shorter period applies promptly.
    pub fn set_period_ms(&self, period_ms: u32) {
        let mut signals = self.shared.signals.lock();
        signals.period_ms = period_ms;
        self.shared.cond.notify_all();
    }

    /// Fire the callback immediately, without waiting for the next period.
    pub fn wakeup(&self) {
        let mut signals = self.shared.signals.lock();
        signals.wake = true;
        self.shared.cond.notify_all();
    }

    /// Handle that can wake this worker from another owner.
    #[must_use]
    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Signal termination and block until the thread has exited.
    /// Idempotent: later calls return immediately.
    pub fn shutdown(&self) {
        {
            let mut signals = self.shared.signals.lock();
            signals.terminate = true;
        }
        self.shared.cond.notify_all();

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // Shutdown issued from inside the work callback; the
                // terminate flag ends the loop right after it returns.
                log::debug!("[worker] {} stopping from its own thread", self.name);
                return;
            }
            let _ = handle.join();
            log::debug!("[worker] {} stopped", self.name);
        }
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<F>(shared: &Shared, mut work: F)
where
    F: FnMut(),
{
    let mut last_fire = Instant::now();
    loop {
        {
            let mut signals = shared.signals.lock();
            loop {
                if signals.terminate {
                    return;
                }
                if signals.wake {
                    signals.wake = false;
                    break;
                }
                match signals.period_ms {
                    0 => break,
                    PERIOD_WAKE_ONLY => {
                        shared.cond.wait(&mut signals);
                    }
                    period_ms => {
                        let deadline = last_fire + Duration::from_millis(u64::from(period_ms));
                        if Instant::now() >= deadline {
                            break;
                        }
                        let _ = shared.cond.wait_until(&mut signals, deadline);
                    }
                }
            }
        }

        work();
        // Re-anchor: a late tick fires once instead of bursting.
        last_fire = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_periodic_fire() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let worker = PeriodicWorker::spawn("test-periodic", WorkerOptions::with_period(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        worker.shutdown();

        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected several periodic fires, got {fired}");
    }

    #[test]
    fn test_wake_only_worker_fires_on_wakeup() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let worker = PeriodicWorker::spawn(
            "test-wake",
            WorkerOptions::with_period(PERIOD_WAKE_ONLY),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0, "must not fire without wake");

        worker.wakeup();
        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1, "one wake, one fire");

        worker.shutdown();
    }

    #[test]
    fn test_wakeup_races_periodic_fire() {
        // A worker being woken aggressively while its own timer runs must
        // keep firing and never deadlock.
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let worker = PeriodicWorker::spawn("test-race", WorkerOptions::with_period(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let handle = worker.wake_handle();
        let waker = thread::spawn(move || {
            for _ in 0..200 {
                handle.wake();
                thread::sleep(Duration::from_micros(200));
            }
        });
        waker.join().expect("waker thread should complete");

        thread::sleep(Duration::from_millis(20));
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 5, "worker stalled under wake pressure: {fired}");
        worker.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let worker =
            PeriodicWorker::spawn("test-shutdown", WorkerOptions::with_period(10), move || {});
        worker.shutdown();
        worker.shutdown();
        worker.shutdown();
    }

    #[test]
    fn test_shutdown_unblocks_wake_only_worker() {
        let worker = PeriodicWorker::spawn(
            "test-shutdown-wake",
            WorkerOptions::with_period(PERIOD_WAKE_ONLY),
            move || {},
        );
        let start = Instant::now();
        worker.shutdown();
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "shutdown must not wait for a wake that never comes"
        );
    }

    #[test]
    fn test_set_period_applies() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let worker = PeriodicWorker::spawn(
            "test-set-period",
            WorkerOptions::with_period(60_000),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(worker.period_ms(), 60_000);

        worker.set_period_ms(5);
        assert_eq!(worker.period_ms(), 5);

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(
            count.load(Ordering::SeqCst) >= 2,
            "shorter period should fire promptly"
        );
        worker.shutdown();
    }
}
