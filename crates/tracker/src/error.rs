#![forbid(unsafe_code)]

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Process monitor is not running")]
    NotRunning,

    #[error("Process monitor is already running")]
    AlreadyRunning,

    #[error("Process tree node has been disposed")]
    NodeDisposed,

    #[error("Process tree node is not associated with an OS process")]
    NotAssociated,

    #[error("Process tree node is already associated with pid {0}")]
    AlreadyAssociated(u32),

    #[error("Operation is not permitted on the host process itself (pid {0})")]
    SelfProcess(u32),

    #[error("Process {0} is not visible")]
    ProcessNotFound(u32),

    #[error("Failed to read procfs info: {0}")]
    Procfs(#[from] procfs::ProcError),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to load config: {0}")]
    Config(#[from] config::Error),
}
