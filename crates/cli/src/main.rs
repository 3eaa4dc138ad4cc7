use anyhow::{Context, bail};
use clap::Parser;
use config::Config;
use proctree::{
    cli::{Cli, Command},
    events::{TreeEvent, forward},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tracker::{PendingLaunch, ProcessMonitor, ProcessTreeNode, ProcfsProvider, SnapshotProvider};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. `PROCTREE_LOG=tracker=trace proctree -q attach 1` still
    // logs the tracker crate at the trace level and everything else at error.
    let env_filter = EnvFilter::builder()
        .with_env_var("PROCTREE_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    // load config
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        _ => {
            let mut candidates = glob::glob("/etc/proctree/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.insert(0, "/etc/proctree/config.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    debug!(?config, ?cli);

    let provider: Arc<dyn SnapshotProvider> = Arc::new(ProcfsProvider::new());
    let monitor = ProcessMonitor::new(Arc::clone(&provider));
    monitor.start(&config)?;

    let (events_tx, events_rx) = flume::unbounded();
    let builder = ProcessTreeNode::builder(Arc::clone(&provider));
    let mut launched = None;
    let root = match cli.command {
        Command::Run { filters, command } => {
            let (program, args) = command
                .split_first()
                .context("no command given")?;
            let child = std::process::Command::new(program)
                .args(args)
                .spawn()
                .with_context(|| format!("failed to launch {program}"))?;
            let pid = child.id();
            launched = Some(child);
            let info = provider
                .describe(pid)?
                .with_context(|| format!("launched process {pid} is not visible"))?;
            builder.filter_image_names(filters).associated(info)
        }
        Command::Expect { name, filters } => builder
            .filter_image_names(filters)
            .pending(PendingLaunch::new(name)),
        Command::Attach { pid } => {
            let Some(info) = provider.describe(pid)? else {
                bail!("process {pid} is not visible");
            };
            builder.associated(info)
        }
    };
    forward(&root, events_tx);
    let key = monitor.track(Arc::clone(&root))?;
    info!(?key, pid = root.id(), "tracking");

    let timeout = tokio::time::sleep(cli.timeout.map_or(Duration::MAX, Duration::from_secs));
    tokio::pin!(timeout);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                info!("interrupted");
                break;
            }

            _ = &mut timeout => {
                warn!("timed out with the tree still alive");
                break;
            }

            event_res = events_rx.recv_async() => {
                let event = event_res?;
                match event {
                    TreeEvent::Found { pid, image } => info!(pid, %image, "launch found"),
                    TreeEvent::ChildAdded { pid, parent, image } => {
                        info!(pid, parent, %image, "child joined");
                    }
                    TreeEvent::ChildExited { pid, code } => info!(pid, code, "child exited"),
                    TreeEvent::Exited { pid, code } => info!(pid, code, "root exited"),
                    TreeEvent::TreeExited => {
                        info!("tree exited");
                        break;
                    }
                }
            }
        }
    }

    monitor.stop()?;
    if let Some(mut child) = launched {
        // reap it if it is gone; otherwise leave it running
        if let Some(status) = child.try_wait()? {
            debug!(?status, "launched process reaped");
        }
    }
    Ok(())
}
