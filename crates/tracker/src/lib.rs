#![deny(unsafe_code)]

//! Lifecycle tracking for process family trees.
//!
//! A [`ProcessMonitor`] diffs successive snapshots of the process table and
//! attributes every new process to a pending launch, to a tracked tree, or to
//! nobody. Each tracked process is a [`ProcessTreeNode`] with its own exit
//! watch, events and owned children.

mod correlator;
mod error;
mod event;
mod exit_watcher;
mod monitor;
pub mod snapshot;
pub mod tree;

pub use correlator::{Attribution, Correlator};
pub use error::Error;
pub use event::{Event, SubscriptionId};
pub use exit_watcher::{ExitWatcher, WaitBudget};
pub use monitor::{ProcessMonitor, STOP_EXIT_CODE, TickReport, TrackingKey};
pub use snapshot::{
    ExitWait, InMemoryProvider, ProcessInfo, Snapshot, SnapshotDiff, SnapshotProvider,
    UNKNOWN_EXIT_CODE, WaitOutcome,
};
#[cfg(target_os = "linux")]
pub use snapshot::ProcfsProvider;
pub use tree::{
    ChildAdded, ChildExited, DEFAULT_WAIT_THREADS, NodeBuilder, NodeState, PendingLaunch,
    ProcessTreeNode, fuzzy_image_match, longest_common_substring,
};
