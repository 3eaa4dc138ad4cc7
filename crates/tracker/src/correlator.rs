#![forbid(unsafe_code)]

use crate::snapshot::ProcessInfo;
use crate::tree::ProcessTreeNode;
use config::Filter;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Where a newly observed process ended up.
#[derive(Debug, Clone)]
pub enum Attribution {
    /// Some node already stands for this process.
    AlreadyTracked,
    /// A pending launch was associated with it.
    Matched { node: Arc<ProcessTreeNode> },
    /// Appended below a tracked node.
    Attached {
        node: Arc<ProcessTreeNode>,
        parent_id: u32,
    },
    /// Belongs to a tracked family but its image is filtered or blacklisted.
    Dropped { parent_id: u32 },
    Orphan,
}

/// Attributes new processes to pending launches or tracked families.
///
/// The blacklist is fixed at construction and read without locking.
#[derive(Debug, Clone, Default)]
pub struct Correlator {
    blacklist: Vec<String>,
}

impl Correlator {
    pub fn new(filter: &Filter) -> Self {
        let blacklist = if filter.disable_blacklist {
            Vec::new()
        } else {
            let mut filter = filter.clone();
            filter.normalize();
            filter.blacklist
        };
        Self { blacklist }
    }

    pub fn is_blacklisted(&self, info: &ProcessInfo) -> bool {
        self.blacklist.iter().any(|name| info.is_named(name))
    }

    /// Run pending matching, then the family search, for one process. Stops
    /// at the first step that claims it.
    pub fn correlate(&self, roots: &[Arc<ProcessTreeNode>], info: &ProcessInfo) -> Attribution {
        if Self::is_tracked(roots, info) {
            trace!(pid = info.id(), "process already tracked");
            return Attribution::AlreadyTracked;
        }
        if let Some(node) = Self::try_match(roots, info) {
            return Attribution::Matched { node };
        }
        self.try_find_family(roots, info)
            .unwrap_or(Attribution::Orphan)
    }

    fn is_tracked(roots: &[Arc<ProcessTreeNode>], info: &ProcessInfo) -> bool {
        roots.par_iter().any(|root| {
            root.find(&|node| node.info().is_some_and(|known| known.same_process(info)))
                .is_some()
        })
    }

    fn try_match(roots: &[Arc<ProcessTreeNode>], info: &ProcessInfo) -> Option<Arc<ProcessTreeNode>> {
        for root in roots {
            let Some(launch) = root.launch() else {
                continue;
            };
            if !root.is_pending() || !launch.matches(info) {
                continue;
            }
            match root.initialize(info.clone()) {
                Ok(()) => {
                    debug!(
                        pid = info.id(),
                        expected = launch.expected_base_name(),
                        "pending launch matched"
                    );
                    return Some(Arc::clone(root));
                }
                Err(err) => warn!(pid = info.id(), %err, "pending launch could not be associated"),
            }
        }
        None
    }

    fn try_find_family(
        &self,
        roots: &[Arc<ProcessTreeNode>],
        info: &ProcessInfo,
    ) -> Option<Attribution> {
        let parent_id = info.parent_id();
        // Registry order is kept: the first root holding a parent wins.
        let candidates: Vec<Arc<ProcessTreeNode>> = roots
            .par_iter()
            .filter_map(|root| {
                root.find(&|node| {
                    node.info().is_some_and(|parent| {
                        parent.id() == parent_id && parent.creation_time() < info.creation_time()
                    })
                })
            })
            .collect();

        for parent in candidates {
            if parent.filters(info) || self.is_blacklisted(info) {
                debug!(pid = info.id(), parent = parent_id, image = info.image_name(), "child filtered");
                return Some(Attribution::Dropped { parent_id });
            }
            let child = parent.new_child(info.clone());
            match parent.add_child(Arc::clone(&child)) {
                Ok(()) => {
                    debug!(pid = info.id(), parent = parent_id, "child attached");
                    return Some(Attribution::Attached {
                        node: child,
                        parent_id,
                    });
                }
                Err(err) => warn!(pid = info.id(), parent = parent_id, %err, "failed to attach child"),
            }
        }
        None
    }
}
