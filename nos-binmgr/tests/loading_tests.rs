//! Bank selection and loading thread tests

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use nos_binmgr::callback::Notifier;
use nos_binmgr::ipc::{MessageQueue, NamedQueues};
use nos_binmgr::loader::ImageLoader;
use nos_binmgr::loading::{LoadingQueue, LoadingThread};
use nos_binmgr::partition::PartitionRegistry;
use nos_binmgr::table::{BinaryTable, SharedTable};
use nos_binmgr::testing::{MemFlash, SimBoard, SimLoader, SimScheduler};
use nos_binmgr::types::fixed_str;
use nos_binmgr::{BinaryState, Error, LoadingRequest, PartitionType};

struct Rig {
    flash: MemFlash,
    sched: SimScheduler,
    loader: Arc<SimLoader>,
    table: SharedTable,
    images: Arc<ImageLoader>,
}

fn rig() -> Rig {
    let flash = MemFlash::new();
    for part in KERNEL_A..=RESOURCE_B {
        flash.add_partition(&path(part), PART_SIZE);
    }
    let table: SharedTable = Arc::new(spin::Mutex::new(BinaryTable::new(8)));
    let registry = PartitionRegistry::new(table.clone(), "2.0");
    let size = PART_SIZE as i32;
    registry.register_partition(APP1_A as i32, PartitionType::App, "app1", size).unwrap();
    registry.register_partition(APP1_B as i32, PartitionType::App, "app1", size).unwrap();
    registry.register_partition(APP2_A as i32, PartitionType::App, "app2", size).unwrap();
    registry.register_partition(COMMON_A as i32, PartitionType::Common, "common", size).unwrap();

    let sched = SimScheduler::new();
    let loader = Arc::new(SimLoader::new(sched.clone()));
    let images = Arc::new(ImageLoader::new(
        table.clone(),
        Arc::new(flash.clone()),
        loader.clone(),
        Arc::new(sched.clone()),
        PREFIX,
        64,
    ));
    Rig {
        flash,
        sched,
        loader,
        table,
        images,
    }
}

fn loading_thread(rig: &Rig, board: Arc<SimBoard>) -> LoadingThread {
    let notifier = Arc::new(Notifier::new(
        rig.table.clone(),
        Arc::new(rig.sched.clone()),
        Arc::new(NamedQueues::new()),
        Arc::new(MessageQueue::new(4)),
        Duration::from_millis(50),
    ));
    LoadingThread::new(
        Arc::new(LoadingQueue::new()),
        rig.images.clone(),
        rig.table.clone(),
        board,
        notifier,
    )
}

#[test]
fn test_strictly_higher_version_wins() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    write_app(&rig.flash, APP1_B, "app1", "7");

    rig.images.load_binary_info(1).unwrap();
    let table = rig.table.lock();
    let entry = table.get(1).unwrap();
    assert!(entry.info_valid);
    assert_eq!(entry.in_use_bank, 1);
    assert_eq!(entry.version.as_str(), "7");
    assert_eq!(entry.offset, 60);
    assert_eq!(entry.size, 256);
}

#[test]
fn test_equal_versions_are_ambiguous() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "5");
    write_app(&rig.flash, APP1_B, "app1", "5");

    assert!(matches!(rig.images.load_binary_info(1), Err(Error::NotFound(_))));
    assert!(!rig.table.lock().get(1).unwrap().info_valid);
}

#[test]
fn test_invalid_bank_is_skipped() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    write_app(&rig.flash, APP1_B, "app1", "9");
    let mut raw = rig.flash.read_at(&path(APP1_B), 100, 1);
    raw[0] ^= 0x40;
    rig.flash.program(&path(APP1_B), 100, &raw);

    rig.images.load_binary_info(1).unwrap();
    assert_eq!(rig.table.lock().get(1).unwrap().in_use_bank, 0);
}

#[test]
fn test_image_of_other_binary_is_skipped() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app2", "3");
    assert!(matches!(rig.images.load_binary_info(1), Err(Error::NotFound(_))));
}

#[test]
fn test_load_binary_requires_info() {
    let rig = rig();
    assert!(matches!(rig.images.load_binary(1), Err(Error::InvalidParameter(_))));
    assert!(rig.loader.calls().is_empty());
}

#[test]
fn test_load_uses_active_bank() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    write_app(&rig.flash, APP1_B, "app1", "7");

    let pid = rig.images.load(1).unwrap();
    let calls = rig.loader.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, path(APP1_B));
    assert_eq!(calls[0].bin_idx, 1);
    assert_eq!(calls[0].offset, 60);
    assert_eq!(calls[0].ram_size, 0x2000);
    assert_eq!(rig.table.lock().get(1).unwrap().id, Some(pid));
}

#[test]
fn test_failed_load_clears_pid() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    rig.images.load(1).unwrap();

    rig.loader.fail_path(&path(APP1_A));
    assert!(matches!(rig.images.load(1), Err(Error::OperationFailed(_))));
    assert_eq!(rig.table.lock().get(1).unwrap().id, None);
}

#[test]
fn test_kill_stops_at_first_terminate_failure() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    let pid = rig.images.load(1).unwrap();
    let helper = rig.sched.spawn(Some(1), false);
    rig.sched.fail_terminate(pid);

    assert!(matches!(rig.images.kill_binary(1), Err(Error::OperationFailed(_))));
    assert_eq!(rig.table.lock().get(1).unwrap().id, Some(pid));
    assert!(rig.sched.terminated().is_empty());
    assert_eq!(rig.sched.tasks_of(1).len(), 2);
    assert!(rig.sched.tasks_of(1).iter().any(|t| t.pid == helper));
}

#[test]
fn test_kill_terminates_every_task_of_binary() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    write_app(&rig.flash, APP2_A, "app2", "1");
    let pid = rig.images.load(1).unwrap();
    let helper = rig.sched.spawn(Some(1), true);
    let other = rig.images.load(2).unwrap();

    rig.images.kill_binary(1).unwrap();
    let terminated = rig.sched.terminated();
    assert!(terminated.contains(&pid) && terminated.contains(&helper));
    assert!(!terminated.contains(&other));
    assert!(rig.sched.tasks_of(1).is_empty());
    assert_eq!(rig.table.lock().get(1).unwrap().id, None);
}

#[test]
fn test_load_all_starts_common_first() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    write_app(&rig.flash, APP2_A, "app2", "1");
    write_app(&rig.flash, COMMON_A, "common", "1");
    let lt = loading_thread(&rig, Arc::new(SimBoard::new()));

    assert_eq!(lt.load_all().unwrap(), 3);
    let order: Vec<usize> = rig.loader.calls().iter().map(|c| c.bin_idx).collect();
    assert_eq!(order, vec![3, 1, 2]);
    let table = rig.table.lock();
    assert!(table.iter().skip(1).all(|e| e.state == BinaryState::Running));
}

#[test]
fn test_load_all_tolerates_partial_failure() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    let lt = loading_thread(&rig, Arc::new(SimBoard::new()));

    assert_eq!(lt.load_all().unwrap(), 1);
    assert_eq!(rig.table.lock().get(2).unwrap().state, BinaryState::Inactive);
}

#[test]
fn test_load_all_fails_when_nothing_loads() {
    let rig = rig();
    let lt = loading_thread(&rig, Arc::new(SimBoard::new()));
    assert!(matches!(lt.load_all(), Err(Error::OperationFailed(_))));
}

#[test]
fn test_routine_reload_goes_through_unload() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    let board = Arc::new(SimBoard::new());
    let lt = loading_thread(&rig, board.clone());
    let first = rig.images.load(1).unwrap();

    write_app(&rig.flash, APP1_B, "app1", "4");
    let second = lt.reload("app1").unwrap();
    assert_ne!(first, second);
    assert!(rig.sched.terminated().contains(&first));
    let table = rig.table.lock();
    assert_eq!(table.get(1).unwrap().state, BinaryState::Running);
    assert_eq!(table.get(1).unwrap().in_use_bank, 1);
    assert!(board.resets().is_empty());
}

#[test]
fn test_failed_recovery_reload_resets_board() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    let board = Arc::new(SimBoard::new());
    let lt = loading_thread(&rig, board.clone());
    rig.images.load(1).unwrap();
    rig.table.lock().set_state(1, BinaryState::Fault).unwrap();

    rig.loader.fail_path(&path(APP1_A));
    assert!(lt.handle(&LoadingRequest::Reload(fixed_str("app1").unwrap())).is_err());
    assert_eq!(board.resets().len(), 1);
}

#[test]
fn test_failed_routine_reload_does_not_reset() {
    let rig = rig();
    write_app(&rig.flash, APP1_A, "app1", "3");
    let board = Arc::new(SimBoard::new());
    let lt = loading_thread(&rig, board.clone());
    rig.images.load(1).unwrap();

    rig.loader.fail_path(&path(APP1_A));
    assert!(lt.reload("app1").is_err());
    assert!(board.resets().is_empty());
    assert_eq!(rig.table.lock().get(1).unwrap().state, BinaryState::Inactive);
}

#[test]
fn test_reload_of_unknown_or_kernel_rejected() {
    let rig = rig();
    let lt = loading_thread(&rig, Arc::new(SimBoard::new()));
    assert!(matches!(lt.reload("nope"), Err(Error::NotFound(_))));
    assert!(matches!(lt.reload("kernel"), Err(Error::InvalidParameter(_))));
}

#[test]
fn test_concurrent_reload_requests_never_overlap() {
    let fx = Fixture::with_load_delay(Duration::from_millis(30));
    let binmgr = fx.started();
    assert_eq!(fx.loader.calls().len(), 2);

    let clients: Vec<_> = [300, 301].iter().map(|&pid| binmgr.client(pid)).collect();
    thread::scope(|s| {
        s.spawn(|| clients[0].reload("app1").unwrap());
        s.spawn(|| clients[1].reload("app2").unwrap());
    });

    assert!(wait_for(Duration::from_secs(5), || fx.loader.calls().len() == 4));
    assert!(binmgr.wait_idle(Duration::from_secs(5)));
    assert_eq!(fx.loader.max_in_flight(), 1);
}

#[test]
fn test_repeated_reload_of_one_binary_runs_twice_in_order() {
    let fx = Fixture::with_load_delay(Duration::from_millis(30));
    let binmgr = fx.started();
    let app1_loads = || fx.loader.calls().iter().filter(|c| c.bin_idx == 1).count();
    assert_eq!(app1_loads(), 1);

    let client = binmgr.client(300);
    client.reload("app1").unwrap();
    client.reload("app1").unwrap();

    assert!(wait_for(Duration::from_secs(5), || app1_loads() == 3));
    assert!(binmgr.wait_idle(Duration::from_secs(5)));
    assert_eq!(app1_loads(), 3);
    assert_eq!(fx.loader.calls().len(), 4);
    assert_eq!(fx.loader.max_in_flight(), 1);
    assert_eq!(binmgr.table().lock().get(1).unwrap().state, BinaryState::Running);
}
