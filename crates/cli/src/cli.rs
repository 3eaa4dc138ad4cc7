use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::{Path, PathBuf};

/// proctree: follow a process and everything it spawns
///
/// proctree tracks a process family tree by polling the process table and
/// logs every child that joins or leaves the tree. It exits once the whole
/// tree is gone.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/proctree/config.toml` and `/etc/proctree/config.d/*.toml`,
    /// where the latter being a glob pattern. If they don't exist, the default
    /// configuration is used.
    #[arg(short, long, global = true, value_parser = validate_file)]
    pub config: Option<PathBuf>,

    /// Give up after this many seconds even if the tree is still alive.
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Launch a command and track it together with its descendants.
    Run {
        /// Image name never attached to the tree. May be repeated.
        #[arg(long = "filter", value_name = "NAME")]
        filters: Vec<String>,

        /// Command line to launch.
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },

    /// Wait for a process with a matching image name to appear, then track it.
    Expect {
        /// Expected image name or path. `Game` also matches `Game_x64`.
        name: String,

        /// Image name never attached to the tree. May be repeated.
        #[arg(long = "filter", value_name = "NAME")]
        filters: Vec<String>,
    },

    /// Track a process that is already running.
    Attach {
        #[arg(value_parser = validate_pid)]
        pid: u32,
    },
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

/// Validate a process id
#[inline(always)]
fn validate_pid(pid: &str) -> Result<u32, String> {
    let pid: u32 = pid
        .parse()
        .map_err(|_| format!("`{pid}` is not a valid process id"))?;
    if pid == 0 {
        Err("Process id must be positive".to_string())
    } else {
        Ok(pid)
    }
}
