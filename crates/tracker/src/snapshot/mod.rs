#![deny(unsafe_code)]

mod diff;
mod memory;
mod process_info;
#[cfg(target_os = "linux")]
mod procfs_provider;

pub use diff::SnapshotDiff;
pub use memory::InMemoryProvider;
pub use process_info::ProcessInfo;
#[cfg(target_os = "linux")]
pub use procfs_provider::ProcfsProvider;

use crate::error::Error;
use std::collections::HashSet;
use std::time::Duration;

pub type Snapshot = HashSet<ProcessInfo>;

/// Exit code reported when a process is known to be gone but its exit status
/// could not be read.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Access to the OS process table.
pub trait SnapshotProvider: Send + Sync {
    /// Every process currently visible. Processes the caller is not allowed to
    /// inspect are left out rather than reported as errors.
    fn enumerate(&self) -> Result<Snapshot, Error>;

    /// Best-effort termination. Succeeds when the process is already gone.
    fn terminate(&self, pid: u32, exit_code: i32) -> Result<(), Error>;

    fn is_running(&self, pid: u32) -> bool;

    /// Open a blocking exit wait on `pid`.
    fn open_exit_wait(&self, pid: u32) -> Result<Box<dyn ExitWait>, Error>;

    /// Look a single process up.
    fn describe(&self, pid: u32) -> Result<Option<ProcessInfo>, Error> {
        Ok(self.enumerate()?.into_iter().find(|info| info.id() == pid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The process is gone. The code is `None` when the OS would not tell.
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

/// An OS wait primitive bound to one process.
///
/// Any number of threads may wait concurrently. [`cancel`](Self::cancel)
/// wakes all of them with [`WaitOutcome::Cancelled`] and is permanent.
pub trait ExitWait: Send + Sync {
    /// Block until the process exits, `timeout` elapses (`None` waits
    /// forever), or the wait is cancelled.
    fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, Error>;

    fn cancel(&self);
}
