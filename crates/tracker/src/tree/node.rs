#![forbid(unsafe_code)]

use super::PendingLaunch;
use crate::error::Error;
use crate::event::{Event, SubscriptionId};
use crate::exit_watcher::{ExitWatcher, WaitBudget};
use crate::snapshot::{ProcessInfo, SnapshotProvider, UNKNOWN_EXIT_CODE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Background exit-wait threads one tree may hold by default.
pub const DEFAULT_WAIT_THREADS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Waiting for a matching process to appear.
    Pending,
    Associated,
    Exited,
    Disposed,
}

/// Raised on every ancestor when a descendant exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExited {
    pub id: u32,
    pub exit_code: i32,
}

/// Raised on every ancestor when a process is attached below it.
#[derive(Debug, Clone)]
pub struct ChildAdded {
    pub node: Arc<ProcessTreeNode>,
    pub id: u32,
    pub parent_id: u32,
}

/// An owned child plus the subscriptions its parent holds on it.
struct ChildLink {
    node: Arc<ProcessTreeNode>,
    exit: SubscriptionId,
    child_exit: SubscriptionId,
    child_added: SubscriptionId,
}

/// One process of a tracked family tree.
///
/// A node owns its children. It never owns its parent: events travel upward
/// through subscriptions holding weak references, and parents are found by
/// searching down from a root.
pub struct ProcessTreeNode {
    weak_self: Weak<ProcessTreeNode>,
    provider: Arc<dyn SnapshotProvider>,
    launch: Option<PendingLaunch>,
    info: OnceLock<ProcessInfo>,
    state: Mutex<NodeState>,
    is_self_process: bool,
    filtered_image_names: Arc<HashSet<String>>,
    wait_budget: Arc<WaitBudget>,
    children: RwLock<Vec<ChildLink>>,
    watcher: Mutex<Option<Arc<ExitWatcher>>>,
    watch_started: AtomicBool,
    exited: AtomicBool,
    tree_exited: AtomicBool,
    exit_code: OnceLock<i32>,
    on_found: Event<ProcessInfo>,
    on_exit: Event<i32>,
    on_child_exit: Event<ChildExited>,
    on_child_added: Event<ChildAdded>,
}

/// Builder for tracked roots. See [`ProcessTreeNode::builder`].
pub struct NodeBuilder {
    provider: Arc<dyn SnapshotProvider>,
    filtered_image_names: HashSet<String>,
    is_self_process: bool,
    wait_threads: usize,
}

impl NodeBuilder {
    /// Image names never attached anywhere below this root. Compared
    /// case-insensitively with both the file name and the base name.
    pub fn filter_image_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.filtered_image_names
            .extend(names.into_iter().map(|name| name.as_ref().to_lowercase()));
        self
    }

    /// Mark the node as the host's own process. Such a node never reports
    /// its own exit and refuses `terminate` and `wait_for_exit`.
    pub fn host_process(mut self, is_self_process: bool) -> Self {
        self.is_self_process = is_self_process;
        self
    }

    /// Cap on the exit-wait threads of the whole tree. Nodes past the cap
    /// learn of their exit from the monitor's scan instead.
    pub fn wait_threads(mut self, threads: usize) -> Self {
        self.wait_threads = threads;
        self
    }

    /// A node for a process that already exists.
    pub fn associated(self, info: ProcessInfo) -> Arc<ProcessTreeNode> {
        let node = self.build(None, NodeState::Associated);
        let _ = node.info.set(info);
        node
    }

    /// A node waiting for `launch` to show up in the process table.
    pub fn pending(self, launch: PendingLaunch) -> Arc<ProcessTreeNode> {
        self.build(Some(launch), NodeState::Pending)
    }

    /// A node for the host process itself.
    pub fn current_process(self) -> Result<Arc<ProcessTreeNode>, Error> {
        let pid = std::process::id();
        let info = self
            .provider
            .describe(pid)?
            .ok_or(Error::ProcessNotFound(pid))?;
        Ok(self.host_process(true).associated(info))
    }

    fn build(self, launch: Option<PendingLaunch>, state: NodeState) -> Arc<ProcessTreeNode> {
        ProcessTreeNode::new_cyclic(
            self.provider,
            launch,
            state,
            self.is_self_process,
            Arc::new(self.filtered_image_names),
            Arc::new(WaitBudget::new(self.wait_threads)),
        )
    }
}

impl ProcessTreeNode {
    pub fn builder(provider: Arc<dyn SnapshotProvider>) -> NodeBuilder {
        NodeBuilder {
            provider,
            filtered_image_names: HashSet::new(),
            is_self_process: false,
            wait_threads: DEFAULT_WAIT_THREADS,
        }
    }

    fn new_cyclic(
        provider: Arc<dyn SnapshotProvider>,
        launch: Option<PendingLaunch>,
        state: NodeState,
        is_self_process: bool,
        filtered_image_names: Arc<HashSet<String>>,
        wait_budget: Arc<WaitBudget>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            provider,
            launch,
            info: OnceLock::new(),
            state: Mutex::new(state),
            is_self_process,
            filtered_image_names,
            wait_budget,
            children: RwLock::new(Vec::new()),
            watcher: Mutex::new(None),
            watch_started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            tree_exited: AtomicBool::new(false),
            exit_code: OnceLock::new(),
            on_found: Event::new(),
            on_exit: Event::new(),
            on_child_exit: Event::new(),
            on_child_added: Event::new(),
        })
    }

    /// A descendant discovered below `self`. It shares the tree's filters and
    /// wait budget and is not watched until it has been added.
    pub(crate) fn new_child(&self, info: ProcessInfo) -> Arc<Self> {
        let node = Self::new_cyclic(
            Arc::clone(&self.provider),
            None,
            NodeState::Associated,
            false,
            Arc::clone(&self.filtered_image_names),
            Arc::clone(&self.wait_budget),
        );
        let _ = node.info.set(info);
        node
    }

    pub fn id(&self) -> Option<u32> {
        self.info.get().map(ProcessInfo::id)
    }

    pub fn info(&self) -> Option<&ProcessInfo> {
        self.info.get()
    }

    pub fn launch(&self) -> Option<&PendingLaunch> {
        self.launch.as_ref()
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == NodeState::Pending
    }

    pub fn is_self_process(&self) -> bool {
        self.is_self_process
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn filtered_image_names(&self) -> &HashSet<String> {
        &self.filtered_image_names
    }

    /// Whether the tree's launcher asked for processes like `info` to be
    /// ignored.
    pub fn filters(&self, info: &ProcessInfo) -> bool {
        self.filtered_image_names
            .iter()
            .any(|name| info.is_named(name))
    }

    pub fn on_found(&self) -> &Event<ProcessInfo> {
        &self.on_found
    }

    pub fn on_exit(&self) -> &Event<i32> {
        &self.on_exit
    }

    pub fn on_child_exit(&self) -> &Event<ChildExited> {
        &self.on_child_exit
    }

    pub fn on_child_added(&self) -> &Event<ChildAdded> {
        &self.on_child_added
    }

    /// Snapshot of the direct children. Children appended after the call are
    /// not included.
    pub fn children(&self) -> Vec<Arc<ProcessTreeNode>> {
        self.children
            .read()
            .iter()
            .map(|link| Arc::clone(&link.node))
            .collect()
    }

    /// Every node below this one, depth first.
    pub fn descendants(&self) -> Vec<Arc<ProcessTreeNode>> {
        let mut out = Vec::new();
        for child in self.children() {
            out.push(Arc::clone(&child));
            out.extend(child.descendants());
        }
        out
    }

    /// Attach `child`. Its exits and additions are re-raised on this node
    /// (and from there on every ancestor), then its exit watch starts.
    pub fn add_child(&self, child: Arc<ProcessTreeNode>) -> Result<(), Error> {
        let child_id = child.id().ok_or(Error::NotAssociated)?;
        let parent_id = self.id().ok_or(Error::NotAssociated)?;
        if child.state() == NodeState::Disposed {
            return Err(Error::NodeDisposed);
        }

        let exit = {
            let parent = self.weak_self.clone();
            child.on_exit.subscribe(move |code| {
                if let Some(parent) = parent.upgrade() {
                    parent.raise_child_exit(&ChildExited {
                        id: child_id,
                        exit_code: *code,
                    });
                }
            })
        };
        let child_exit = {
            let parent = self.weak_self.clone();
            child.on_child_exit.subscribe(move |event| {
                if let Some(parent) = parent.upgrade() {
                    parent.raise_child_exit(event);
                }
            })
        };
        let child_added = {
            let parent = self.weak_self.clone();
            child.on_child_added.subscribe(move |event| {
                if let Some(parent) = parent.upgrade() {
                    parent.raise_child_added(event);
                }
            })
        };
        let link = ChildLink {
            node: Arc::clone(&child),
            exit,
            child_exit,
            child_added,
        };

        {
            let state = self.state.lock();
            if *state == NodeState::Disposed {
                drop(state);
                link.release();
                return Err(Error::NodeDisposed);
            }
            self.children.write().push(link);
        }

        trace!(pid = child_id, parent = parent_id, "child attached");
        self.raise_child_added(&ChildAdded {
            node: Arc::clone(&child),
            id: child_id,
            parent_id,
        });
        child.watch();
        Ok(())
    }

    /// First node, this one included, whose process id is `id`. If an id was
    /// ever present twice in the tree there is no rule for which one wins.
    pub fn find_descendant(&self, id: u32) -> Option<Arc<ProcessTreeNode>> {
        self.find(&|node| node.id() == Some(id))
    }

    /// Depth-first search, this node included.
    pub fn find(
        &self,
        predicate: &dyn Fn(&ProcessTreeNode) -> bool,
    ) -> Option<Arc<ProcessTreeNode>> {
        if predicate(self) {
            return self.weak_self.upgrade();
        }
        self.children()
            .into_iter()
            .find_map(|child| child.find(predicate))
    }

    /// Associate a pending node with the process that was launched for it.
    pub fn initialize(&self, info: ProcessInfo) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            match *state {
                NodeState::Pending => {}
                NodeState::Disposed => return Err(Error::NodeDisposed),
                _ => return Err(Error::AlreadyAssociated(self.id().unwrap_or(info.id()))),
            }
            if self.info.set(info.clone()).is_err() {
                return Err(Error::AlreadyAssociated(info.id()));
            }
            *state = NodeState::Associated;
        }

        debug!(pid = info.id(), image = info.image_name(), "pending launch found");
        self.on_found.emit(&info);
        self.watch();
        Ok(())
    }

    /// Start the exit watch if the node is associated and not yet watched.
    pub(crate) fn watch(&self) {
        if self.is_self_process || self.state() != NodeState::Associated {
            return;
        }
        let Some(pid) = self.id() else {
            return;
        };
        if self.watch_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let node = self.weak_self.clone();
        let watcher = Arc::new(ExitWatcher::start(
            pid,
            Arc::clone(&self.provider),
            &self.wait_budget,
            move |code| {
                if let Some(node) = node.upgrade() {
                    node.handle_exit(code);
                }
            },
        ));

        *self.watcher.lock() = Some(Arc::clone(&watcher));
        if self.state() == NodeState::Disposed {
            watcher.dispose();
        }
    }

    fn handle_exit(&self, code: i32) {
        {
            let mut state = self.state.lock();
            if *state != NodeState::Associated {
                return;
            }
            *state = NodeState::Exited;
            let _ = self.exit_code.set(code);
            self.exited.store(true, Ordering::SeqCst);
        }
        debug!(pid = self.id(), code, "process exited");
        self.on_exit.emit(&code);
    }

    /// The process vanished from the process table. The node is `Exited`
    /// when this returns, whichever path delivered the exit.
    pub(crate) fn mark_exited(&self) {
        let watcher = self.watcher.lock().clone();
        let code = watcher
            .and_then(|watcher| {
                watcher.signal_stopped();
                watcher.exit_code()
            })
            .unwrap_or(UNKNOWN_EXIT_CODE);
        self.handle_exit(code);
    }

    fn raise_child_exit(&self, event: &ChildExited) {
        if self.state() != NodeState::Disposed {
            self.on_child_exit.emit(event);
        }
    }

    fn raise_child_added(&self, event: &ChildAdded) {
        if self.state() != NodeState::Disposed {
            self.on_child_added.emit(event);
        }
    }

    /// Whether the process itself has exited. Always `false` for the host
    /// process: it is running for as long as anyone can ask.
    pub fn is_exited(&self) -> bool {
        !self.is_self_process && self.exited.load(Ordering::SeqCst)
    }

    /// `true` once this node and every node below it have exited. Stays
    /// `true` from then on, even if a late child is attached.
    pub fn is_tree_exited(&self) -> bool {
        if self.tree_exited.load(Ordering::SeqCst) {
            return true;
        }
        let exited = self.is_exited() && self.children().iter().all(|child| child.is_tree_exited());
        if exited {
            self.tree_exited.store(true, Ordering::SeqCst);
        }
        exited
    }

    fn check_operable(&self) -> Result<u32, Error> {
        match self.state() {
            NodeState::Disposed => return Err(Error::NodeDisposed),
            NodeState::Pending => return Err(Error::NotAssociated),
            NodeState::Associated | NodeState::Exited => {}
        }
        let pid = self.id().ok_or(Error::NotAssociated)?;
        if self.is_self_process {
            return Err(Error::SelfProcess(pid));
        }
        Ok(pid)
    }

    /// Best-effort termination of the process and, with `whole_tree`, of
    /// every descendant still alive. Descendants that are already gone are
    /// skipped.
    pub fn terminate(&self, whole_tree: bool, exit_code: i32) -> Result<(), Error> {
        let pid = self.check_operable()?;
        let result = if self.is_exited() {
            Ok(())
        } else {
            debug!(pid, exit_code, "terminating process");
            self.provider.terminate(pid, exit_code)
        };

        if whole_tree {
            for child in self.children() {
                if child.is_tree_exited() {
                    continue;
                }
                if let Err(err) = child.terminate(true, exit_code) {
                    debug!(pid = child.id(), %err, "skipping child during tree termination");
                }
            }
        }
        result
    }

    /// Block for at most `timeout`; returns whether the process has exited.
    pub fn wait_for_exit(&self, timeout: Duration) -> Result<bool, Error> {
        self.check_operable()?;
        if self.is_exited() {
            return Ok(true);
        }
        self.watch();
        let watcher = self.watcher.lock().clone();
        Ok(match watcher {
            Some(watcher) => watcher.wait_for_exit(timeout) || self.is_exited(),
            None => self.is_exited(),
        })
    }

    /// Release the exit watch, every subscription this node holds and every
    /// handler registered on it, then dispose the children. Idempotent.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if *state == NodeState::Disposed {
                return;
            }
            *state = NodeState::Disposed;
        }

        self.on_found.clear();
        self.on_exit.clear();
        self.on_child_exit.clear();
        self.on_child_added.clear();

        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.dispose();
        }

        let children = self.children.read();
        for link in children.iter() {
            link.release();
            link.node.dispose();
        }
        trace!(pid = self.id(), "node disposed");
    }
}

impl ChildLink {
    fn release(&self) {
        self.node.on_exit.unsubscribe(self.exit);
        self.node.on_child_exit.unsubscribe(self.child_exit);
        self.node.on_child_added.unsubscribe(self.child_added);
    }
}

impl fmt::Debug for ProcessTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTreeNode")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("launch", &self.launch)
            .field("is_self_process", &self.is_self_process)
            .field("children", &self.children.read().len())
            .finish_non_exhaustive()
    }
}
