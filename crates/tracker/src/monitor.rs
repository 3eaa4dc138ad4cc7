#![forbid(unsafe_code)]

use crate::correlator::{Attribution, Correlator};
use crate::error::Error;
use crate::event::{Event, panic_message};
use crate::snapshot::{ProcessInfo, Snapshot, SnapshotDiff, SnapshotProvider};
use crate::tree::{NodeState, ProcessTreeNode};
use config::Config;
use parking_lot::{Condvar, Mutex, RwLock};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

new_key_type! { pub struct TrackingKey; }

/// Exit code handed to the provider when tracked trees are killed on stop.
pub const STOP_EXIT_CODE: i32 = 1;

/// What a single tick observed and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub started: usize,
    pub stopped: usize,
    /// Pids that completed a pending launch.
    pub matched: Vec<u32>,
    /// `(pid, parent pid)` of every child appended to a tree.
    pub attached: Vec<(u32, u32)>,
    /// Pids of tracked children skipped because of a filter or the blacklist.
    pub dropped: Vec<u32>,
    pub orphans_started: usize,
    pub orphans_stopped: usize,
    /// Tracked processes that vanished from the process table.
    pub exited: Vec<u32>,
    /// Roots removed from the registry.
    pub finalized: Vec<TrackingKey>,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.started == 0 && self.stopped == 0 && self.finalized.is_empty()
    }
}

struct Shared {
    provider: Arc<dyn SnapshotProvider>,
    registry: RwLock<SlotMap<TrackingKey, Arc<ProcessTreeNode>>>,
    on_process_started: Event<ProcessInfo>,
    on_process_stopped: Event<ProcessInfo>,
}

impl Shared {
    fn new(provider: Arc<dyn SnapshotProvider>) -> Self {
        Self {
            provider,
            registry: RwLock::new(SlotMap::with_key()),
            on_process_started: Event::new(),
            on_process_stopped: Event::new(),
        }
    }

    fn roots(&self) -> Vec<(TrackingKey, Arc<ProcessTreeNode>)> {
        self.registry
            .read()
            .iter()
            .map(|(key, node)| (key, Arc::clone(node)))
            .collect()
    }
}

/// Cooperative stop flag with an interruptible sleep.
#[derive(Debug, Default)]
struct StopSignal {
    raised: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn raise(&self) {
        *self.raised.lock() = true;
        self.wake.notify_all();
    }

    fn is_raised(&self) -> bool {
        *self.raised.lock()
    }

    /// Sleep for `timeout` or until raised. Returns whether it was raised.
    fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut raised = self.raised.lock();
        while !*raised {
            match deadline {
                Some(deadline) => {
                    if self.wake.wait_until(&mut raised, deadline).timed_out() {
                        break;
                    }
                }
                None => self.wake.wait(&mut raised),
            }
        }
        *raised
    }
}

/// One diff-correlate-reconcile pass over the process table.
struct Reconciler {
    shared: Arc<Shared>,
    correlator: Correlator,
    baseline: Snapshot,
    ticks: u64,
}

impl Reconciler {
    fn new(shared: Arc<Shared>, correlator: Correlator, baseline: Snapshot) -> Self {
        Self {
            shared,
            correlator,
            baseline,
            ticks: 0,
        }
    }

    #[tracing::instrument(skip_all, fields(tick = self.ticks + 1))]
    fn tick(&mut self) -> Result<TickReport, Error> {
        self.ticks += 1;
        let current = self.shared.provider.enumerate()?;
        let diff = SnapshotDiff::between(&self.baseline, &current);
        let roots = self.shared.roots();
        let nodes: Vec<Arc<ProcessTreeNode>> =
            roots.iter().map(|(_, node)| Arc::clone(node)).collect();

        let mut report = TickReport {
            tick: self.ticks,
            started: diff.started.len(),
            stopped: diff.stopped.len(),
            ..TickReport::default()
        };

        // Every start is settled before any stop is looked at.
        for info in &diff.started {
            let attribution =
                catch_unwind(AssertUnwindSafe(|| self.correlator.correlate(&nodes, info)));
            let attribution = match attribution {
                Ok(attribution) => attribution,
                Err(payload) => {
                    error!(pid = info.id(), panic = panic_message(&*payload), "correlation failed");
                    continue;
                }
            };
            match attribution {
                Attribution::AlreadyTracked => {}
                Attribution::Matched { .. } => report.matched.push(info.id()),
                Attribution::Attached { parent_id, .. } => {
                    report.attached.push((info.id(), parent_id));
                }
                Attribution::Dropped { .. } => report.dropped.push(info.id()),
                Attribution::Orphan => {
                    if self.shared.on_process_started.has_subscribers() {
                        report.orphans_started += 1;
                        self.shared.on_process_started.emit(info);
                    }
                }
            }
        }

        let live: HashSet<(u32, u64)> = current.iter().map(ProcessInfo::identity).collect();
        for info in &diff.stopped {
            if live.contains(&info.identity()) {
                trace!(pid = info.id(), "process changed image");
                continue;
            }
            let node = nodes.iter().find_map(|root| {
                root.find(&|node| node.info().is_some_and(|known| known.same_process(info)))
            });
            match node {
                Some(node) => {
                    node.mark_exited();
                    report.exited.push(info.id());
                }
                None => {
                    if self.shared.on_process_stopped.has_subscribers() {
                        report.orphans_stopped += 1;
                        self.shared.on_process_stopped.emit(info);
                    }
                }
            }
        }

        for (key, root) in &roots {
            if root.state() == NodeState::Disposed || root.is_tree_exited() {
                if self.shared.registry.write().remove(*key).is_some() {
                    debug!(?key, pid = root.id(), "tracked tree finalized");
                    report.finalized.push(*key);
                }
            }
        }

        self.baseline = current;
        Ok(report)
    }
}

struct Worker {
    handle: JoinHandle<()>,
    signal: Arc<StopSignal>,
    settings: config::Monitor,
}

/// Polls the process table in the background and keeps every tracked tree
/// in sync with it.
///
/// The monitor is an ordinary value: independent instances share nothing.
pub struct ProcessMonitor {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    ever_started: AtomicBool,
}

impl ProcessMonitor {
    pub fn new(provider: Arc<dyn SnapshotProvider>) -> Self {
        Self {
            shared: Arc::new(Shared::new(provider)),
            worker: Mutex::new(None),
            ever_started: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> &Arc<dyn SnapshotProvider> {
        &self.shared.provider
    }

    /// Orphan processes that appeared. Only computed while subscribed.
    pub fn on_process_started(&self) -> &Event<ProcessInfo> {
        &self.shared.on_process_started
    }

    /// Orphan processes that vanished. Only computed while subscribed.
    pub fn on_process_stopped(&self) -> &Event<ProcessInfo> {
        &self.shared.on_process_stopped
    }

    /// Take the baseline snapshot, then start polling on a background thread.
    ///
    /// A monitor whose loop died on an error can be started again.
    pub fn start(&self, config: &Config) -> Result<(), Error> {
        let mut slot = self.worker.lock();
        if slot.as_ref().is_some_and(|worker| !worker.handle.is_finished()) {
            return Err(Error::AlreadyRunning);
        }
        if let Some(stale) = slot.take() {
            let _ = stale.handle.join();
        }

        let baseline = self.shared.provider.enumerate()?;
        let processes = baseline.len();
        let reconciler = Reconciler::new(
            Arc::clone(&self.shared),
            Correlator::new(&config.filter),
            baseline,
        );
        let signal = Arc::new(StopSignal::default());
        let interval = config.monitor.poll_interval;
        let handle = std::thread::Builder::new()
            .name("process-monitor".into())
            .spawn({
                let signal = Arc::clone(&signal);
                move || run(reconciler, &signal, interval)
            })
            .map_err(Error::Spawn)?;

        *slot = Some(Worker {
            handle,
            signal,
            settings: config.monitor.clone(),
        });
        self.ever_started.store(true, Ordering::SeqCst);
        info!(processes, ?interval, "process monitor started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Stop polling and release every tracked tree.
    ///
    /// Waits for the loop thread to finish its current tick. When configured,
    /// kills the trees that are still alive first. Stopping a monitor that
    /// was never started is an error; stopping it again is not.
    pub fn stop(&self) -> Result<(), Error> {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return if self.ever_started.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::NotRunning)
            };
        };

        worker.signal.raise();
        if worker.handle.thread().id() == std::thread::current().id() {
            debug!("stop requested from the monitor thread, not joining");
        } else if worker.handle.join().is_err() {
            error!("process monitor thread panicked");
        }

        let roots: Vec<Arc<ProcessTreeNode>> = self
            .shared
            .registry
            .write()
            .drain()
            .map(|(_, node)| node)
            .collect();

        if worker.settings.kill_tracked_on_stop {
            for root in roots.iter().filter(|root| !root.is_tree_exited()) {
                if let Err(err) = root.terminate(worker.settings.recursive_kill, STOP_EXIT_CODE) {
                    warn!(pid = root.id(), %err, "failed to terminate tracked tree");
                }
            }
        }
        for root in &roots {
            root.dispose();
        }
        self.shared.on_process_started.clear();
        self.shared.on_process_stopped.clear();
        info!(released = roots.len(), "process monitor stopped");
        Ok(())
    }

    /// Register `node` as a tracked root and start watching it.
    pub fn track(&self, node: Arc<ProcessTreeNode>) -> Result<TrackingKey, Error> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        if node.state() == NodeState::Disposed {
            return Err(Error::NodeDisposed);
        }
        node.watch();
        let key = self.shared.registry.write().insert(Arc::clone(&node));
        debug!(?key, pid = node.id(), pending = node.is_pending(), "tracking tree");
        Ok(key)
    }

    /// Forget a tracked root without disposing it.
    pub fn untrack(&self, key: TrackingKey) -> Option<Arc<ProcessTreeNode>> {
        self.shared.registry.write().remove(key)
    }

    pub fn tracked(&self) -> Vec<(TrackingKey, Arc<ProcessTreeNode>)> {
        self.shared.roots()
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        let running = self.worker.lock().is_some();
        if running {
            if let Err(err) = self.stop() {
                debug!(%err, "failed to stop process monitor on drop");
            }
        }
    }
}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("running", &self.is_running())
            .field("tracked", &self.shared.registry.read().len())
            .finish_non_exhaustive()
    }
}

fn run(mut reconciler: Reconciler, signal: &StopSignal, interval: Duration) {
    loop {
        if signal.sleep(interval) || signal.is_raised() {
            break;
        }
        match reconciler.tick() {
            Ok(report) if report.is_quiet() => {}
            Ok(report) => debug!(?report, "tick"),
            Err(err) => {
                error!(%err, "process table scan failed, monitor stopping");
                break;
            }
        }
    }
    trace!("process monitor thread finished");
}
