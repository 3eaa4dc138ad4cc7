#![forbid(unsafe_code)]

mod node;
mod pending;

pub use node::{
    ChildAdded, ChildExited, DEFAULT_WAIT_THREADS, NodeBuilder, NodeState, ProcessTreeNode,
};
pub use pending::{PendingLaunch, fuzzy_image_match, longest_common_substring};
