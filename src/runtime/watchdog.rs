//! Stall reporting for blocking channel operations
//!
//! Every port operation that can block records its start time in an atomic
//! slot before entering the call; a background sweeper thread scans the
//! slots once a second and logs any port stuck past the threshold, and
//! again when it unblocks. The hot path is two relaxed atomic stores, no
//! locks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long an operation may block before it is reported
const STALL_AFTER: Duration = Duration::from_secs(5);

/// Sweep interval of the monitoring thread
const SWEEP_EVERY: Duration = Duration::from_secs(1);

/// Sentinel for "no operation in flight"
const IDLE: u64 = u64::MAX;

/// One monitored port. `busy_since_ms` is milliseconds since the
/// watchdog's epoch, or [`IDLE`].
struct Probe {
    busy_since_ms: AtomicU64,
    reported: AtomicBool,
    node: String,
    port: String,
    operation: String,
}

/// Handle held by a port; marks operation start and end on its probe.
#[derive(Clone)]
pub struct WatchdogHandle {
    probe: Arc<Probe>,
    epoch: Instant,
}

impl WatchdogHandle {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// A blocking operation is about to start
    #[inline]
    pub fn start_operation(&self) {
        self.probe.reported.store(false, Ordering::Relaxed);
        self.probe
            .busy_since_ms
            .store(self.now_ms(), Ordering::Relaxed);
    }

    /// The operation returned
    #[inline]
    pub fn finish_operation(&self) {
        if self.probe.reported.swap(false, Ordering::Relaxed) {
            info!(
                "[{}] {} on port '{}' unblocked",
                self.probe.node, self.probe.operation, self.probe.port
            );
        }
        self.probe.busy_since_ms.store(IDLE, Ordering::Relaxed);
    }
}

/// Registry of probes plus the sweeper control flag.
///
/// Cloning shares the underlying registry; the scheduler clones one into
/// every port it wires up.
#[derive(Clone)]
pub struct Watchdog {
    probes: Arc<Mutex<Vec<Weak<Probe>>>>,
    epoch: Instant,
    running: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            probes: Arc::new(Mutex::new(Vec::new())),
            epoch: Instant::now(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Register one port for monitoring. `operation` is the blocking call
    /// being guarded, "recv" or "send".
    pub fn register_port(&self, node: &str, operation: &str, port: &str) -> WatchdogHandle {
        let probe = Arc::new(Probe {
            busy_since_ms: AtomicU64::new(IDLE),
            reported: AtomicBool::new(false),
            node: node.to_string(),
            port: port.to_string(),
            operation: operation.to_string(),
        });
        self.probes.lock().unwrap().push(Arc::downgrade(&probe));
        WatchdogHandle {
            probe,
            epoch: self.epoch,
        }
    }

    /// One sweep: log every probe that has been blocking past the
    /// threshold, dropping probes whose ports are gone.
    pub fn check_for_blocked(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let threshold_ms = STALL_AFTER.as_millis() as u64;

        self.probes.lock().unwrap().retain(|weak| {
            let Some(probe) = weak.upgrade() else {
                return false;
            };
            let since = probe.busy_since_ms.load(Ordering::Relaxed);
            if since != IDLE && now_ms.saturating_sub(since) > threshold_ms {
                // one report per stall
                if !probe.reported.swap(true, Ordering::Relaxed) {
                    warn!(
                        "[{}] {} on port '{}' blocked for {:.1}s",
                        probe.node,
                        probe.operation,
                        probe.port,
                        now_ms.saturating_sub(since) as f64 / 1000.0
                    );
                }
            }
            true
        });
    }

    /// Spawn the sweeper thread. It runs until [`stop`](Self::stop).
    pub fn start_monitoring_thread(&self) -> std::thread::JoinHandle<()> {
        let watchdog = self.clone();
        std::thread::spawn(move || {
            while watchdog.running.load(Ordering::Relaxed) {
                std::thread::sleep(SWEEP_EVERY);
                watchdog.check_for_blocked();
            }
        })
    }

    /// Ask the sweeper thread to exit after its current sleep
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard wrapping one blocking operation
pub struct OperationGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> OperationGuard<'a> {
    #[inline]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_operation();
        Self { handle }
    }
}

impl Drop for OperationGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.handle.finish_operation();
    }
}
