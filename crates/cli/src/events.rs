//! Funnel tree notifications from monitor threads into the async main loop.

use flume::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracker::ProcessTreeNode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Found { pid: u32, image: String },
    ChildAdded { pid: u32, parent: u32, image: String },
    ChildExited { pid: u32, code: i32 },
    Exited { pid: Option<u32>, code: i32 },
    /// The root and every descendant are gone. Sent once.
    TreeExited,
}

/// Subscribe to every event of `root` and forward them to `tx`. Send errors
/// are ignored: a closed receiver means nobody is listening anymore.
pub fn forward(root: &Arc<ProcessTreeNode>, tx: Sender<TreeEvent>) {
    let root_weak = Arc::downgrade(root);
    let finished = Arc::new(AtomicBool::new(false));

    root.on_found().subscribe({
        let tx = tx.clone();
        move |info| {
            let _ = tx.send(TreeEvent::Found {
                pid: info.id(),
                image: info.image_name().to_owned(),
            });
        }
    });

    root.on_child_added().subscribe({
        let tx = tx.clone();
        move |event| {
            let image = event
                .node
                .info()
                .map(|info| info.image_name().to_owned())
                .unwrap_or_default();
            let _ = tx.send(TreeEvent::ChildAdded {
                pid: event.id,
                parent: event.parent_id,
                image,
            });
        }
    });

    root.on_child_exit().subscribe({
        let tx = tx.clone();
        let root = root_weak.clone();
        let finished = Arc::clone(&finished);
        move |event| {
            let _ = tx.send(TreeEvent::ChildExited {
                pid: event.id,
                code: event.exit_code,
            });
            report_tree_exit(&root, &finished, &tx);
        }
    });

    root.on_exit().subscribe(move |code| {
        let _ = tx.send(TreeEvent::Exited {
            pid: root_weak.upgrade().and_then(|root| root.id()),
            code: *code,
        });
        report_tree_exit(&root_weak, &finished, &tx);
    });
}

fn report_tree_exit(root: &Weak<ProcessTreeNode>, finished: &AtomicBool, tx: &Sender<TreeEvent>) {
    let exited = root.upgrade().is_some_and(|root| root.is_tree_exited());
    if exited && !finished.swap(true, Ordering::SeqCst) {
        let _ = tx.send(TreeEvent::TreeExited);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tracker::{InMemoryProvider, ProcessInfo, SnapshotProvider};

    #[test]
    fn tree_exit_is_reported_after_the_last_member() {
        let memory = InMemoryProvider::new();
        let provider: Arc<dyn SnapshotProvider> = Arc::new(memory.clone());
        let root_info = ProcessInfo::new(100, 1, "/bin/root").with_creation_time(1);
        let child_info = ProcessInfo::new(200, 100, "/bin/child").with_creation_time(2);
        memory.insert(root_info.clone());
        memory.insert(child_info.clone());

        let root = ProcessTreeNode::builder(Arc::clone(&provider)).associated(root_info);
        let (tx, rx) = flume::unbounded();
        forward(&root, tx);

        let child = ProcessTreeNode::builder(provider).associated(child_info);
        root.add_child(Arc::clone(&child)).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TreeEvent::ChildAdded {
                pid: 200,
                parent: 100,
                image: "child".into()
            }
        );

        assert!(!root.wait_for_exit(Duration::from_millis(1)).unwrap());
        memory.exit(100, 0);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TreeEvent::Exited {
                pid: Some(100),
                code: 0
            }
        );

        memory.exit(200, 2);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TreeEvent::ChildExited { pid: 200, code: 2 }
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TreeEvent::TreeExited
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
