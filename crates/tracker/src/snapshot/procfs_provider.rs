#![deny(unsafe_code)]

use super::{ExitWait, ProcessInfo, Snapshot, SnapshotProvider, WaitOutcome};
use crate::error::Error;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::{Pid, pipe};
use parking_lot::Mutex;
use procfs::process::Process;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// `(pid, start time, image)`: one incarnation of one image.
type CacheKey = (u32, u64, PathBuf);

/// Process table backed by `/proc`.
///
/// `creation_time` is the start time in clock ticks since boot. Command line
/// and working directory are read once per incarnation of an image and
/// reused afterwards, so a process that changes directory keeps an equal
/// [`ProcessInfo`] across ticks. A process that `exec`s a new image gets a new
/// entry.
#[derive(Debug, Default)]
pub struct ProcfsProvider {
    cache: Mutex<HashMap<CacheKey, ProcessInfo>>,
}

impl ProcfsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn sanitize_path(path: PathBuf) -> Option<PathBuf> {
        if !path.has_root() {
            return None;
        }
        let path_str = path.to_str()?;
        match path_str.strip_suffix(" (deleted)") {
            Some(trimmed) => Some(PathBuf::from(trimmed)),
            None => Some(path),
        }
    }

    /// Read one process. `None` when it vanished or cannot be inspected,
    /// which includes kernel threads and zombies (no readable image).
    fn observe(
        process: &Process,
        cache: &HashMap<CacheKey, ProcessInfo>,
    ) -> Option<(CacheKey, ProcessInfo)> {
        let stat = process.stat().ok()?;
        let image_path = Self::sanitize_path(process.exe().ok()?)?;
        let pid = u32::try_from(stat.pid).ok()?;
        let key = (pid, stat.starttime, image_path);
        if let Some(info) = cache.get(&key) {
            return Some((key, info.clone()));
        }

        let command_line = process
            .cmdline()
            .map(|args| args.join(" "))
            .unwrap_or_default();
        let mut info = ProcessInfo::new(pid, u32::try_from(stat.ppid).unwrap_or(0), &key.2)
            .with_command_line(command_line)
            .with_creation_time(stat.starttime)
            .with_session_id(u32::try_from(stat.session).unwrap_or(0));
        if let Ok(cwd) = process.cwd() {
            info = info.with_working_directory(cwd);
        }
        trace!(pid, image = ?key.2, "new process incarnation");
        Some((key, info))
    }

    fn raw_pid(pid: u32) -> Result<i32, Error> {
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => Ok(raw),
            _ => Err(Error::ProcessNotFound(pid)),
        }
    }
}

impl SnapshotProvider for ProcfsProvider {
    fn enumerate(&self) -> Result<Snapshot, Error> {
        let previous = std::mem::take(&mut *self.cache.lock());
        let mut cache = HashMap::with_capacity(previous.len());
        let mut snapshot = Snapshot::with_capacity(previous.len());

        for process in procfs::process::all_processes()? {
            let Ok(process) = process else {
                continue;
            };
            let Some((key, info)) = Self::observe(&process, &previous) else {
                continue;
            };
            cache.insert(key, info.clone());
            snapshot.insert(info);
        }

        *self.cache.lock() = cache;
        trace!(processes = snapshot.len(), "process table enumerated");
        Ok(snapshot)
    }

    /// Sends `SIGKILL`. POSIX offers no way to impose an exit code on another
    /// process, so `exit_code` is only logged.
    fn terminate(&self, pid: u32, exit_code: i32) -> Result<(), Error> {
        let raw = Self::raw_pid(pid)?;
        debug!(pid, exit_code, "sending SIGKILL");
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn is_running(&self, pid: u32) -> bool {
        let Ok(raw) = Self::raw_pid(pid) else {
            return false;
        };
        Process::new(raw)
            .and_then(|process| process.stat())
            .map(|stat| stat.state != 'Z' && stat.state != 'X')
            .unwrap_or(false)
    }

    fn open_exit_wait(&self, pid: u32) -> Result<Box<dyn ExitWait>, Error> {
        Ok(Box::new(PidfdWait::open(pid)?))
    }

    fn describe(&self, pid: u32) -> Result<Option<ProcessInfo>, Error> {
        let raw = Self::raw_pid(pid)?;
        let Ok(process) = Process::new(raw) else {
            return Ok(None);
        };
        let cache = self.cache.lock();
        Ok(Self::observe(&process, &cache).map(|(_, info)| info))
    }
}

/// Exit wait on a pidfd. Readability of the pidfd means the process is gone;
/// closing the write end of `cancel` wakes every waiter with `POLLHUP`.
#[derive(Debug)]
struct PidfdWait {
    pid: Pid,
    pidfd: OwnedFd,
    cancel_rx: OwnedFd,
    cancel_tx: Mutex<Option<OwnedFd>>,
}

impl PidfdWait {
    fn open(pid: u32) -> Result<Self, Error> {
        let raw = ProcfsProvider::raw_pid(pid)?;

        // SAFETY: pidfd_open(2) takes a pid and a flags word and returns either
        // a new descriptor or -1; no memory is shared with the kernel.
        #[allow(unsafe_code)]
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, raw, 0) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let fd = RawFd::try_from(fd)
            .map_err(|_| Error::Io(io::Error::from(io::ErrorKind::InvalidData)))?;

        // SAFETY: the descriptor was just returned by the kernel and nothing
        // else owns it.
        #[allow(unsafe_code)]
        let pidfd = unsafe { OwnedFd::from_raw_fd(fd) };

        let (cancel_rx, cancel_tx) = pipe()?;
        Ok(Self {
            pid: Pid::from_raw(raw),
            pidfd,
            cancel_rx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
        })
    }

    /// Peek at the exit status without reaping it. Only works for our own
    /// children; anything else reports `None`.
    fn exit_code(&self) -> Option<i32> {
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        match waitid(Id::Pid(self.pid), flags) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => Some(128 + signal as i32),
            _ => None,
        }
    }

    fn poll_timeout(deadline: Option<Instant>) -> PollTimeout {
        let Some(deadline) = deadline else {
            return PollTimeout::NONE;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX);
        PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
    }
}

impl ExitWait for PidfdWait {
    fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, Error> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            let mut fds = [
                PollFd::new(self.pidfd.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.cancel_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, Self::poll_timeout(deadline)) {
                Ok(0) => return Ok(WaitOutcome::TimedOut),
                Ok(_) => {
                    let ready =
                        |fd: &PollFd<'_>| fd.revents().is_some_and(|events| !events.is_empty());
                    if ready(&fds[0]) {
                        return Ok(WaitOutcome::Exited(self.exit_code()));
                    }
                    if ready(&fds[1]) {
                        return Ok(WaitOutcome::Cancelled);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn cancel(&self) {
        self.cancel_tx.lock().take();
    }
}
