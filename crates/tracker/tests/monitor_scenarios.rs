#![forbid(unsafe_code)]

use config::Config;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracker::{
    Error, InMemoryProvider, NodeState, PendingLaunch, ProcessInfo, ProcessMonitor,
    ProcessTreeNode, STOP_EXIT_CODE, SnapshotProvider,
};

fn fast_config() -> Config {
    let mut config = Config::default();
    config.monitor.poll_interval = Duration::from_millis(10);
    config
}

fn info(id: u32, parent: u32, image: &str, time: u64) -> ProcessInfo {
    ProcessInfo::new(id, parent, image).with_creation_time(time)
}

fn setup() -> (InMemoryProvider, ProcessMonitor) {
    let memory = InMemoryProvider::new();
    let provider: Arc<dyn SnapshotProvider> = Arc::new(memory.clone());
    (memory, ProcessMonitor::new(provider))
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn lifecycle_errors() {
    let (memory, monitor) = setup();
    assert!(matches!(monitor.stop(), Err(Error::NotRunning)));

    let root = info(100, 1, "/bin/root", 1);
    memory.insert(root.clone());
    let node = ProcessTreeNode::builder(Arc::clone(monitor.provider())).associated(root);
    assert!(matches!(
        monitor.track(Arc::clone(&node)),
        Err(Error::NotRunning)
    ));

    monitor.start(&fast_config()).unwrap();
    assert!(monitor.is_running());
    assert!(matches!(
        monitor.start(&fast_config()),
        Err(Error::AlreadyRunning)
    ));
    monitor.track(Arc::clone(&node)).unwrap();
    assert_eq!(monitor.tracked().len(), 1);

    monitor.stop().unwrap();
    monitor.stop().unwrap();
    assert!(!monitor.is_running());
    assert!(monitor.tracked().is_empty());
    assert_eq!(node.state(), NodeState::Disposed);
    assert!(matches!(monitor.track(node), Err(Error::NotRunning)));
}

#[test]
fn family_is_followed_until_the_tree_exits() {
    let (memory, monitor) = setup();
    memory.insert(info(100, 1, "/games/game.exe", 1));
    monitor.start(&fast_config()).unwrap();

    let root = ProcessTreeNode::builder(Arc::clone(monitor.provider()))
        .associated(info(100, 1, "/games/game.exe", 1));
    let child_exits = Arc::new(Mutex::new(Vec::new()));
    {
        let child_exits = Arc::clone(&child_exits);
        root.on_child_exit()
            .subscribe(move |event| child_exits.lock().push((event.id, event.exit_code)));
    }
    let added = Arc::new(AtomicUsize::new(0));
    {
        let added = Arc::clone(&added);
        root.on_child_added().subscribe(move |event| {
            assert_eq!(event.parent_id, 100);
            added.fetch_add(1, Ordering::SeqCst);
        });
    }
    monitor.track(Arc::clone(&root)).unwrap();

    memory.insert(info(200, 100, "/games/game.exe", 2));
    wait_until(|| root.find_descendant(200).is_some());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(added.load(Ordering::SeqCst), 1);

    memory.exit(200, 5);
    wait_until(|| !child_exits.lock().is_empty());
    assert_eq!(*child_exits.lock(), vec![(200, 5)]);
    assert!(!root.is_tree_exited());

    memory.exit(100, 0);
    wait_until(|| monitor.tracked().is_empty());
    assert!(root.is_tree_exited());
    assert_eq!(root.exit_code(), Some(0));

    monitor.stop().unwrap();
}

#[test]
fn orphans_are_announced_exactly_once() {
    let (memory, monitor) = setup();
    let started = Arc::new(Mutex::new(Vec::new()));
    let stopped = Arc::new(Mutex::new(Vec::new()));
    {
        let started = Arc::clone(&started);
        monitor
            .on_process_started()
            .subscribe(move |info: &ProcessInfo| started.lock().push(info.id()));
        let stopped = Arc::clone(&stopped);
        monitor
            .on_process_stopped()
            .subscribe(move |info: &ProcessInfo| stopped.lock().push(info.id()));
    }
    monitor.start(&fast_config()).unwrap();

    memory.insert(info(300, 999, "/bin/other", 5));
    wait_until(|| !started.lock().is_empty());
    memory.exit(300, 0);
    wait_until(|| !stopped.lock().is_empty());
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(*started.lock(), vec![300]);
    assert_eq!(*stopped.lock(), vec![300]);
    assert!(monitor.tracked().is_empty());

    monitor.stop().unwrap();
    assert!(!monitor.on_process_started().has_subscribers());
}

#[test]
fn stop_kills_tracked_trees_when_asked() {
    let (memory, monitor) = setup();
    memory.insert(info(100, 1, "/bin/root", 1));
    let mut config = fast_config();
    config.monitor.kill_tracked_on_stop = true;
    config.monitor.recursive_kill = true;
    monitor.start(&config).unwrap();

    let root = ProcessTreeNode::builder(Arc::clone(monitor.provider()))
        .associated(info(100, 1, "/bin/root", 1));
    monitor.track(Arc::clone(&root)).unwrap();
    memory.insert(info(200, 100, "/bin/child", 2));
    wait_until(|| root.find_descendant(200).is_some());

    monitor.stop().unwrap();
    let mut killed = memory.terminations();
    killed.sort();
    assert_eq!(killed, vec![(100, STOP_EXIT_CODE), (200, STOP_EXIT_CODE)]);
}

#[test]
fn failing_scan_ends_the_loop_and_allows_restart() {
    let (memory, monitor) = setup();
    monitor.start(&fast_config()).unwrap();

    memory.fail_enumerate(true);
    wait_until(|| !monitor.is_running());
    let node = ProcessTreeNode::builder(Arc::clone(monitor.provider()))
        .pending(PendingLaunch::new("game"));
    assert!(matches!(monitor.track(node), Err(Error::NotRunning)));

    memory.fail_enumerate(false);
    monitor.start(&fast_config()).unwrap();
    assert!(monitor.is_running());
    monitor.stop().unwrap();
}
