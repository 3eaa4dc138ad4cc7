use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Monitor {
    /// Delay between two snapshots of the process table. Every tick costs a
    /// full walk of the process table, so values far below the default are
    /// rarely useful. **Measured in milliseconds**.
    ///
    /// ## Note
    ///
    /// Exit notifications for tracked processes do not depend on this value;
    /// they are delivered by a blocking wait on each process.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,

    /// Terminate every tracked root that is still alive when the monitor is
    /// stopped.
    pub kill_tracked_on_stop: bool,

    /// When `kill_tracked_on_stop` is set, also terminate every descendant of
    /// the tracked roots instead of only the roots themselves.
    pub recursive_kill: bool,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            kill_tracked_on_stop: false,
            recursive_kill: false,
        }
    }
}
