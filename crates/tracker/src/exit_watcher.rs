#![forbid(unsafe_code)]

use crate::snapshot::{ExitWait, SnapshotProvider, UNKNOWN_EXIT_CODE, WaitOutcome};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

type ExitCallback = Box<dyn FnOnce(i32) + Send>;

/// Step between liveness checks when no wait primitive could be opened.
const DEGRADED_POLL: Duration = Duration::from_millis(50);

/// Delivers the exit code at most once, whichever path observes it first.
struct ExitLatch {
    code: OnceLock<i32>,
    callback: Mutex<Option<ExitCallback>>,
}

impl ExitLatch {
    fn new(callback: ExitCallback) -> Self {
        Self {
            code: OnceLock::new(),
            callback: Mutex::new(Some(callback)),
        }
    }

    fn fire(&self, code: i32) {
        if self.code.set(code).is_err() {
            return;
        }
        // Take the callback before running it so no lock is held meanwhile.
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(code);
        }
    }

    fn fired(&self) -> Option<i32> {
        self.code.get().copied()
    }

    fn disarm(&self) {
        self.callback.lock().take();
    }
}

/// Caps how many background wait threads a group of watchers may hold.
#[derive(Debug)]
pub struct WaitBudget {
    available: AtomicUsize,
}

impl WaitBudget {
    pub fn new(threads: usize) -> Self {
        Self {
            available: AtomicUsize::new(threads),
        }
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }

    fn try_acquire(self: &Arc<Self>) -> Option<WaitPermit> {
        self.available
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| WaitPermit(Arc::clone(self)))
    }
}

/// Returned to its budget when the wait thread ends.
struct WaitPermit(Arc<WaitBudget>);

impl Drop for WaitPermit {
    fn drop(&mut self) {
        self.0.available.fetch_add(1, Ordering::SeqCst);
    }
}

/// Turns one OS process handle into a single exit notification.
///
/// A background thread blocks on the provider's [`ExitWait`]; nothing polls
/// the process table. When no wait could be opened, or the [`WaitBudget`]
/// has no thread left, the watcher does a one-off liveness check at start
/// and leaves the rest to the caller (see [`ExitWatcher::signal_stopped`]).
/// Without a thread the handle is still used to read the exit code.
pub struct ExitWatcher {
    pid: u32,
    provider: Arc<dyn SnapshotProvider>,
    handle: Option<Arc<dyn ExitWait>>,
    latch: Arc<ExitLatch>,
}

impl ExitWatcher {
    /// Start watching `pid`. `on_exit` runs at most once, on the watcher
    /// thread or synchronously inside this call if the process is already
    /// gone.
    pub fn start(
        pid: u32,
        provider: Arc<dyn SnapshotProvider>,
        budget: &Arc<WaitBudget>,
        on_exit: impl FnOnce(i32) + Send + 'static,
    ) -> Self {
        let latch = Arc::new(ExitLatch::new(Box::new(on_exit)));
        let handle = match provider.open_exit_wait(pid) {
            Ok(handle) => Some(Arc::<dyn ExitWait>::from(handle)),
            Err(err) => {
                debug!(pid, %err, "no exit wait available, falling back to liveness checks");
                None
            }
        };

        let mut watcher = Self {
            pid,
            provider,
            handle,
            latch,
        };

        let Some(handle) = watcher.handle.clone() else {
            watcher.check_once();
            return watcher;
        };
        let Some(permit) = budget.try_acquire() else {
            trace!(pid, "no wait thread left, exit comes from the snapshot diff");
            watcher.check_once();
            return watcher;
        };
        let latch = Arc::clone(&watcher.latch);
        let spawned = std::thread::Builder::new()
            .name(format!("exit-watch-{pid}"))
            .spawn(move || {
                let _permit = permit;
                Self::wait_loop(pid, handle, latch);
            });
        if let Err(err) = spawned {
            warn!(pid, %err, "failed to spawn exit watcher thread");
            watcher.handle = None;
            watcher.check_once();
        }
        watcher
    }

    fn wait_loop(pid: u32, handle: Arc<dyn ExitWait>, latch: Arc<ExitLatch>) {
        loop {
            match handle.wait(None) {
                Ok(WaitOutcome::Exited(code)) => {
                    trace!(pid, ?code, "exit wait satisfied");
                    latch.fire(code.unwrap_or(UNKNOWN_EXIT_CODE));
                    break;
                }
                Ok(WaitOutcome::Cancelled) => break,
                Ok(WaitOutcome::TimedOut) => continue,
                Err(err) => {
                    // The snapshot diff still reports the exit.
                    warn!(pid, %err, "exit wait failed");
                    break;
                }
            }
        }
        trace!(pid, "exit watcher thread finished");
    }

    fn check_once(&self) {
        if !self.provider.is_running(self.pid) {
            self.latch.fire(UNKNOWN_EXIT_CODE);
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code, once the exit has been delivered.
    pub fn exit_code(&self) -> Option<i32> {
        self.latch.fired()
    }

    /// Block for at most `timeout`. Returns whether the process has exited;
    /// the exit is delivered through the same once-only path as the
    /// background wait.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        if self.latch.fired().is_some() {
            return true;
        }
        match &self.handle {
            Some(handle) => match handle.wait(Some(timeout)) {
                Ok(WaitOutcome::Exited(code)) => {
                    self.latch.fire(code.unwrap_or(UNKNOWN_EXIT_CODE));
                    true
                }
                Ok(WaitOutcome::TimedOut | WaitOutcome::Cancelled) => self.latch.fired().is_some(),
                Err(err) => {
                    warn!(pid = self.pid, %err, "blocking exit wait failed");
                    self.check_once();
                    self.latch.fired().is_some()
                }
            },
            None => {
                let deadline = Instant::now().checked_add(timeout);
                loop {
                    self.check_once();
                    if self.latch.fired().is_some() {
                        return true;
                    }
                    let step = match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return false;
                            }
                            DEGRADED_POLL.min(remaining)
                        }
                        None => DEGRADED_POLL,
                    };
                    std::thread::sleep(step);
                }
            }
        }
    }

    /// The process vanished from the process table. Read the exit code if the
    /// wait primitive still has it and deliver the exit.
    pub fn signal_stopped(&self) {
        let code = match &self.handle {
            Some(handle) => match handle.wait(Some(Duration::ZERO)) {
                Ok(WaitOutcome::Exited(Some(code))) => code,
                _ => UNKNOWN_EXIT_CODE,
            },
            None => UNKNOWN_EXIT_CODE,
        };
        self.latch.fire(code);
    }

    /// Drop the pending callback and release the wait. Idempotent.
    pub fn dispose(&self) {
        self.latch.disarm();
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }
}

impl Drop for ExitWatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ExitWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitWatcher")
            .field("pid", &self.pid)
            .field("degraded", &self.handle.is_none())
            .field("exit_code", &self.latch.fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{InMemoryProvider, ProcessInfo};

    fn counter() -> (Arc<AtomicUsize>, Arc<Mutex<Option<i32>>>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(Mutex::new(None)))
    }

    fn watch(
        provider: &InMemoryProvider,
        pid: u32,
        hits: &Arc<AtomicUsize>,
        code: &Arc<Mutex<Option<i32>>>,
    ) -> ExitWatcher {
        watch_with(provider, pid, &Arc::new(WaitBudget::new(4)), hits, code)
    }

    fn watch_with(
        provider: &InMemoryProvider,
        pid: u32,
        budget: &Arc<WaitBudget>,
        hits: &Arc<AtomicUsize>,
        code: &Arc<Mutex<Option<i32>>>,
    ) -> ExitWatcher {
        let hits = Arc::clone(hits);
        let code = Arc::clone(code);
        ExitWatcher::start(pid, Arc::new(provider.clone()), budget, move |c| {
            hits.fetch_add(1, Ordering::SeqCst);
            *code.lock() = Some(c);
        })
    }

    #[test]
    fn fires_once_with_exit_code() {
        let provider = InMemoryProvider::new();
        provider.insert(ProcessInfo::new(10, 1, "/bin/a"));
        let (hits, code) = counter();
        let watcher = watch(&provider, 10, &hits, &code);

        assert!(!watcher.wait_for_exit(Duration::from_millis(5)));
        provider.exit(10, 4);
        assert!(watcher.wait_for_exit(Duration::from_secs(5)));
        watcher.signal_stopped();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(*code.lock(), Some(4));
        assert_eq!(watcher.exit_code(), Some(4));
    }

    #[test]
    fn missing_handle_degrades_to_immediate_check() {
        let provider = InMemoryProvider::new();
        provider.deny_exit_wait(true);
        let (hits, code) = counter();
        let watcher = watch(&provider, 99, &hits, &code);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(*code.lock(), Some(UNKNOWN_EXIT_CODE));
        assert!(watcher.wait_for_exit(Duration::ZERO));
    }

    #[test]
    fn degraded_wait_notices_exit() {
        let provider = InMemoryProvider::new();
        provider.insert(ProcessInfo::new(10, 1, "/bin/a"));
        provider.deny_exit_wait(true);
        let (hits, code) = counter();
        let watcher = watch(&provider, 10, &hits, &code);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let exiter = {
            let provider = provider.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                provider.exit(10, 0);
            })
        };
        assert!(watcher.wait_for_exit(Duration::from_secs(5)));
        exiter.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn degraded_wait_accepts_unbounded_timeout() {
        let provider = InMemoryProvider::new();
        provider.insert(ProcessInfo::new(10, 1, "/bin/a"));
        provider.deny_exit_wait(true);
        let (hits, code) = counter();
        let watcher = watch(&provider, 10, &hits, &code);

        let exiter = {
            let provider = provider.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                provider.exit(10, 0);
            })
        };
        assert!(watcher.wait_for_exit(Duration::MAX));
        exiter.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_budget_leaves_delivery_to_the_caller() {
        let provider = InMemoryProvider::new();
        provider.insert(ProcessInfo::new(10, 1, "/bin/a"));
        provider.insert(ProcessInfo::new(11, 1, "/bin/b"));
        let budget = Arc::new(WaitBudget::new(1));
        let (hits, code) = counter();
        let threaded = watch_with(&provider, 10, &budget, &hits, &code);
        assert_eq!(budget.available(), 0);

        let (late_hits, late_code) = counter();
        let threadless = watch_with(&provider, 11, &budget, &late_hits, &late_code);
        provider.exit(11, 6);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        threadless.signal_stopped();
        assert_eq!(*late_code.lock(), Some(6));

        provider.exit(10, 0);
        assert!(threaded.wait_for_exit(Duration::from_secs(5)));
        let deadline = Instant::now() + Duration::from_secs(5);
        while budget.available() == 0 {
            assert!(Instant::now() < deadline, "permit was not returned");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispose_suppresses_later_exit() {
        let provider = InMemoryProvider::new();
        provider.insert(ProcessInfo::new(10, 1, "/bin/a"));
        let (hits, code) = counter();
        let watcher = watch(&provider, 10, &hits, &code);

        watcher.dispose();
        watcher.dispose();
        provider.exit(10, 1);
        std::thread::sleep(Duration::from_millis(20));
        watcher.signal_stopped();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
