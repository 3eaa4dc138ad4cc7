#![forbid(unsafe_code)]

//! A scripted process table.
//!
//! Hosts use it to drive a [`ProcessMonitor`](crate::ProcessMonitor)
//! deterministically: processes are inserted and exited by hand and exit
//! waits wake up exactly when [`InMemoryProvider::exit`] is called.

use super::{ExitWait, ProcessInfo, Snapshot, SnapshotProvider, WaitOutcome};
use crate::error::Error;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Table {
    running: HashMap<u32, ProcessInfo>,
    /// Exit codes keyed by process identity so a recycled pid does not
    /// satisfy a wait opened on its predecessor.
    exited: HashMap<(u32, u64), i32>,
    terminations: Vec<(u32, i32)>,
    deny_exit_wait: bool,
    fail_enumerate: bool,
}

#[derive(Debug, Default)]
struct Shared {
    table: Mutex<Table>,
    changed: Condvar,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryProvider {
    shared: Arc<Shared>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a process visible. Replaces any running entry with the same id.
    pub fn insert(&self, info: ProcessInfo) {
        let mut table = self.shared.table.lock();
        table.exited.remove(&info.identity());
        table.running.insert(info.id(), info);
    }

    /// Remove a running process and record its exit code.
    pub fn exit(&self, pid: u32, code: i32) -> Option<ProcessInfo> {
        let mut table = self.shared.table.lock();
        let info = table.running.remove(&pid)?;
        table.exited.insert(info.identity(), code);
        self.shared.changed.notify_all();
        Some(info)
    }

    /// Make [`SnapshotProvider::open_exit_wait`] fail for every process.
    pub fn deny_exit_wait(&self, deny: bool) {
        self.shared.table.lock().deny_exit_wait = deny;
    }

    /// Make [`SnapshotProvider::enumerate`] fail.
    pub fn fail_enumerate(&self, fail: bool) {
        self.shared.table.lock().fail_enumerate = fail;
    }

    /// Every `(pid, exit_code)` passed to a successful [`terminate`] call.
    ///
    /// [`terminate`]: SnapshotProvider::terminate
    pub fn terminations(&self) -> Vec<(u32, i32)> {
        self.shared.table.lock().terminations.clone()
    }
}

impl SnapshotProvider for InMemoryProvider {
    fn enumerate(&self) -> Result<Snapshot, Error> {
        let table = self.shared.table.lock();
        if table.fail_enumerate {
            return Err(Error::Io(io::Error::other("process table unavailable")));
        }
        Ok(table.running.values().cloned().collect())
    }

    fn terminate(&self, pid: u32, exit_code: i32) -> Result<(), Error> {
        let running = self.shared.table.lock().running.contains_key(&pid);
        if running {
            self.shared.table.lock().terminations.push((pid, exit_code));
            self.exit(pid, exit_code);
        }
        Ok(())
    }

    fn is_running(&self, pid: u32) -> bool {
        self.shared.table.lock().running.contains_key(&pid)
    }

    fn open_exit_wait(&self, pid: u32) -> Result<Box<dyn ExitWait>, Error> {
        let table = self.shared.table.lock();
        if table.deny_exit_wait {
            return Err(Error::Io(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        let info = table.running.get(&pid).ok_or(Error::ProcessNotFound(pid))?;
        Ok(Box::new(MemoryExitWait {
            identity: info.identity(),
            shared: Arc::clone(&self.shared),
            cancelled: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct MemoryExitWait {
    identity: (u32, u64),
    shared: Arc<Shared>,
    cancelled: AtomicBool,
}

impl ExitWait for MemoryExitWait {
    fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, Error> {
        // A deadline past the clock's range waits forever.
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut table = self.shared.table.lock();
        loop {
            if let Some(code) = table.exited.get(&self.identity) {
                return Ok(WaitOutcome::Exited(Some(*code)));
            }
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(WaitOutcome::Cancelled);
            }
            match deadline {
                None => self.shared.changed.wait(&mut table),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    let _ = self.shared.changed.wait_until(&mut table, deadline);
                }
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _table = self.shared.table.lock();
        self.shared.changed.notify_all();
    }
}
