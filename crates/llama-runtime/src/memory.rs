//! Memory watchdog.
//!
//! A [`MemoryGuard`] samples the process's resident memory on a background thread
//! while a limit is set, tracks the peak, and calls a user callback whenever usage
//! crosses the pressure threshold. It never frees anything itself: at the cleanup
//! ratio it raises a hint ([`MemoryGuard::take_cleanup_request`]) for the owner of the
//! engine memory to act on.
//!
//! The monitor thread sleeps on a channel receive with a timeout, so stopping it is
//! a matter of dropping the sender and joining.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::sampler::{DeviceClass, MemorySampler, SystemSampler};

const MIB: usize = 1024 * 1024;
const GIB: usize = 1024 * MIB;

pub const MIN_CHECK_INTERVAL_MS: u64 = 100;
pub const MAX_CHECK_INTERVAL_MS: u64 = 60_000;

/// Usage ratio at which the cleanup hint is raised (when auto-cleanup is on).
pub const CLEANUP_RATIO: f64 = 0.95;

/// One over-threshold sample, as delivered to the pressure callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureEvent {
    pub current_bytes: usize,
    pub limit_bytes: usize,
    /// `current_bytes / limit_bytes`.
    pub ratio: f64,
    /// Whether this sample also raised the cleanup hint.
    pub cleanup_hint: bool,
}

pub type PressureCallback = Arc<dyn Fn(PressureEvent) + Send + Sync>;

/// Tunables for a [`MemoryGuard`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemoryGuardConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Fraction of the limit that counts as pressure.
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: f32,

    #[serde(default = "default_auto_cleanup")]
    pub auto_cleanup: bool,
}

fn default_check_interval_ms() -> u64 {
    1000
}
fn default_pressure_threshold() -> f32 {
    0.9
}
fn default_auto_cleanup() -> bool {
    true
}

impl Default for MemoryGuardConfig {
    fn default() -> Self {
        MemoryGuardConfig {
            check_interval_ms: default_check_interval_ms(),
            pressure_threshold: default_pressure_threshold(),
            auto_cleanup: default_auto_cleanup(),
        }
    }
}

/// Recommended memory ceiling for a device tier with `total_bytes` of RAM.
///
/// Returns 0 when the total is unknown.
pub fn recommended_limit_for(class: DeviceClass, total_bytes: usize) -> usize {
    if total_bytes == 0 {
        return 0;
    }
    match class {
        DeviceClass::Android if total_bytes >= 12 * GIB => 1200 * MIB,
        DeviceClass::Android if total_bytes >= 8 * GIB => 1000 * MIB,
        DeviceClass::Android => 800 * MIB,
        DeviceClass::AppleMobile => 1200 * MIB,
        DeviceClass::Desktop => total_bytes / 10 * 6,
    }
}

/// State shared between the guard and its monitor thread.
struct Shared {
    sampler: Box<dyn MemorySampler>,
    limit: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
    threshold_bits: AtomicU32,
    interval_ms: AtomicU64,
    monitoring: AtomicBool,
    auto_cleanup: AtomicBool,
    cleanup_requested: AtomicBool,
    pressure_events: AtomicU64,
    callback: Mutex<Option<PressureCallback>>,
}

impl Shared {
    fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    /// Sample once, store the reading and raise the peak.
    fn refresh(&self) -> usize {
        let current = self.sampler.resident_bytes();
        self.current.store(current, Ordering::Release);
        self.peak.fetch_max(current, Ordering::AcqRel);
        current
    }

    fn check_pressure(&self, current: usize) {
        let limit = self.limit.load(Ordering::Acquire);
        if limit == 0 || current == 0 {
            return;
        }

        let ratio = current as f64 / limit as f64;
        if ratio < self.threshold() as f64 {
            return;
        }

        self.pressure_events.fetch_add(1, Ordering::AcqRel);
        let cleanup_hint = self.auto_cleanup.load(Ordering::Acquire) && ratio >= CLEANUP_RATIO;
        if cleanup_hint {
            self.cleanup_requested.store(true, Ordering::Release);
        }
        debug!(current, limit, ratio, cleanup_hint, "memory pressure");

        let event = PressureEvent {
            current_bytes: current,
            limit_bytes: limit,
            ratio,
            cleanup_hint,
        };
        let callback = self.callback.lock();
        if let Some(cb) = callback.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| cb(event))).is_err() {
                warn!("memory pressure callback panicked");
            }
        }
    }
}

struct Monitor {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Background memory watchdog. Share it with `Arc`.
pub struct MemoryGuard {
    shared: Arc<Shared>,
    monitor: Mutex<Option<Monitor>>,
}

impl MemoryGuard {
    pub fn new<P: MemorySampler + 'static>(sampler: P) -> Self {
        Self::with_config(sampler, MemoryGuardConfig::default())
    }

    pub fn with_config<P: MemorySampler + 'static>(sampler: P, config: MemoryGuardConfig) -> Self {
        let guard = Self {
            shared: Arc::new(Shared {
                sampler: Box::new(sampler),
                limit: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                threshold_bits: AtomicU32::new(default_pressure_threshold().to_bits()),
                interval_ms: AtomicU64::new(default_check_interval_ms()),
                monitoring: AtomicBool::new(false),
                auto_cleanup: AtomicBool::new(config.auto_cleanup),
                cleanup_requested: AtomicBool::new(false),
                pressure_events: AtomicU64::new(0),
                callback: Mutex::new(None),
            }),
            monitor: Mutex::new(None),
        };
        guard.set_threshold(config.pressure_threshold);
        guard.set_check_interval(config.check_interval_ms);
        guard
    }

    /// A guard over the host OS sampler.
    pub fn system() -> Self {
        Self::new(SystemSampler)
    }

    /// Seed current and peak usage with a fresh reading.
    pub fn init(&self) {
        let current = self.shared.sampler.resident_bytes();
        self.shared.current.store(current, Ordering::Release);
        self.shared.peak.store(current, Ordering::Release);
        debug!(current, "memory guard initialised");
    }

    /// Set the limit in bytes. A non-zero limit starts the monitor, zero stops it.
    pub fn set_limit(&self, bytes: usize) {
        let mut slot = self.monitor.lock();
        self.shared.limit.store(bytes, Ordering::Release);
        let stopped = if bytes > 0 {
            info!(limit = bytes, "memory limit set");
            self.start_monitor(&mut slot);
            None
        } else {
            self.take_monitor(&mut slot)
        };
        drop(slot);
        if let Some(handle) = stopped {
            join_monitor(handle);
        }
    }

    /// Clear the limit only if it still equals `expected`, so an owner never
    /// releases a limit someone else has set since. Returns whether it cleared.
    pub fn release_limit(&self, expected: usize) -> bool {
        let mut slot = self.monitor.lock();
        if expected == 0 || self.shared.limit.load(Ordering::Acquire) != expected {
            return false;
        }
        self.shared.limit.store(0, Ordering::Release);
        let stopped = self.take_monitor(&mut slot);
        drop(slot);
        if let Some(handle) = stopped {
            join_monitor(handle);
        }
        true
    }

    pub fn limit(&self) -> usize {
        self.shared.limit.load(Ordering::Acquire)
    }

    /// Resident bytes: the monitor's last sample while monitoring, otherwise a fresh reading.
    pub fn current_usage(&self) -> usize {
        if self.is_monitoring() {
            self.shared.current.load(Ordering::Acquire)
        } else {
            self.shared.refresh()
        }
    }

    pub fn peak_usage(&self) -> usize {
        if !self.is_monitoring() {
            self.shared.refresh();
        }
        self.shared.peak.load(Ordering::Acquire)
    }

    pub fn total_memory(&self) -> usize {
        self.shared.sampler.total_physical_bytes()
    }

    /// Replace the pressure callback; `None` clears it.
    ///
    /// Callbacks run on the monitor thread with the callback slot locked, so a
    /// callback must not call `set_callback` or `shutdown` on the same guard.
    pub fn set_callback(&self, callback: Option<PressureCallback>) {
        *self.shared.callback.lock() = callback;
    }

    pub fn is_under_pressure(&self) -> bool {
        let limit = self.limit();
        limit > 0 && self.current_usage() as f64 / limit as f64 >= self.pressure_threshold() as f64
    }

    /// Usage as a percentage of the limit, or -1.0 when no limit is set.
    pub fn usage_percentage(&self) -> f64 {
        let limit = self.limit();
        if limit == 0 {
            return -1.0;
        }
        self.current_usage() as f64 / limit as f64 * 100.0
    }

    pub fn recommended_limit(&self) -> usize {
        recommended_limit_for(
            self.shared.sampler.device_class(),
            self.shared.sampler.total_physical_bytes(),
        )
    }

    /// Clamped to [0, 1]; NaN is ignored.
    pub fn set_threshold(&self, threshold: f32) {
        if threshold.is_nan() {
            return;
        }
        let clamped = threshold.clamp(0.0, 1.0);
        self.shared
            .threshold_bits
            .store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn pressure_threshold(&self) -> f32 {
        self.shared.threshold()
    }

    /// Clamped to [100, 60000] ms. Takes effect after the monitor's current sleep.
    pub fn set_check_interval(&self, ms: u64) {
        let clamped = ms.clamp(MIN_CHECK_INTERVAL_MS, MAX_CHECK_INTERVAL_MS);
        self.shared.interval_ms.store(clamped, Ordering::Relaxed);
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_auto_cleanup(&self, enabled: bool) {
        self.shared.auto_cleanup.store(enabled, Ordering::Release);
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared.monitoring.load(Ordering::Acquire)
    }

    /// Consume the cleanup hint raised by the monitor.
    pub fn take_cleanup_request(&self) -> bool {
        self.shared.cleanup_requested.swap(false, Ordering::AcqRel)
    }

    /// Number of samples that met the pressure threshold.
    pub fn pressure_events(&self) -> u64 {
        self.shared.pressure_events.load(Ordering::Acquire)
    }

    /// Take a fresh reading after the owner has released memory. Clears the cleanup hint.
    pub fn cleanup(&self) -> usize {
        self.shared.cleanup_requested.store(false, Ordering::Release);
        let current = self.shared.refresh();
        debug!(current, "memory cleanup reading");
        current
    }

    pub fn reset_stats(&self) {
        self.shared.peak.store(0, Ordering::Release);
        self.shared.current.store(0, Ordering::Release);
    }

    /// Stop monitoring and return to the unconfigured state.
    pub fn shutdown(&self) {
        self.set_limit(0);
        self.reset_stats();
        self.set_callback(None);
    }

    /// Spawn the monitor unless one is running. Called with the monitor slot locked.
    fn start_monitor(&self, slot: &mut Option<Monitor>) {
        if slot.is_some() {
            return;
        }

        // Seed the cache so readers never see a stale value before the first sample.
        self.shared.refresh();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("memory-guard".to_string())
            .spawn(move || monitor_loop(shared, stop_rx));

        match spawned {
            Ok(handle) => {
                *slot = Some(Monitor { stop_tx, handle });
                self.shared.monitoring.store(true, Ordering::Release);
            }
            Err(e) => warn!(error = %e, "failed to spawn memory monitor"),
        }
    }

    /// Detach the running monitor and signal it to exit. Called with the monitor slot
    /// locked; the caller joins the returned handle after unlocking.
    fn take_monitor(&self, slot: &mut Option<Monitor>) -> Option<JoinHandle<()>> {
        let Monitor { stop_tx, handle } = slot.take()?;
        self.shared.monitoring.store(false, Ordering::Release);
        drop(stop_tx);
        Some(handle)
    }
}

/// Wait for a stopped monitor to exit.
fn join_monitor(handle: JoinHandle<()>) {
    // A callback that clears the limit runs on the monitor thread itself.
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!("memory monitor thread panicked");
    }
    debug!("memory monitor stopped");
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        let mut slot = self.monitor.lock();
        let stopped = self.take_monitor(&mut slot);
        drop(slot);
        if let Some(handle) = stopped {
            join_monitor(handle);
        }
    }
}

impl std::fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("limit", &self.limit())
            .field("current", &self.shared.current.load(Ordering::Relaxed))
            .field("peak", &self.shared.peak.load(Ordering::Relaxed))
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

/// Runs until its stop sender is dropped. Each monitor owns its channel, so stopping
/// an old monitor can never end a newer one.
fn monitor_loop(shared: Arc<Shared>, stop_rx: Receiver<()>) {
    debug!("memory monitor started");
    loop {
        let current = shared.refresh();
        shared.check_pressure(current);

        let interval = Duration::from_millis(shared.interval_ms.load(Ordering::Relaxed));
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
