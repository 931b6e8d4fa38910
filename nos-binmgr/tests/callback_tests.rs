//! State-change callback tests

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use nos_api::{Pid, SIGBM};
use nos_binmgr::callback::{CallbackAck, Notifier};
use nos_binmgr::ipc::{MessageQueue, NamedQueues, PRIO_NORMAL, callback_queue_name};
use nos_binmgr::partition::PartitionRegistry;
use nos_binmgr::table::{BinaryTable, CallbackSubscription, SharedTable};
use nos_binmgr::testing::SimScheduler;
use nos_binmgr::{BinaryState, CallbackMessage, Error, NotifyReport, PartitionType};

const ACK_TIMEOUT: Duration = Duration::from_millis(50);

struct Rig {
    table: SharedTable,
    sched: SimScheduler,
    queues: Arc<NamedQueues<CallbackMessage>>,
    acks: Arc<MessageQueue<CallbackAck>>,
    notifier: Notifier,
}

fn rig() -> Rig {
    let table: SharedTable = Arc::new(spin::Mutex::new(BinaryTable::new(8)));
    let registry = PartitionRegistry::new(table.clone(), "2.0");
    registry.register_partition(3, PartitionType::App, "app1", 4096).unwrap();
    registry.register_partition(5, PartitionType::App, "app2", 4096).unwrap();

    let sched = SimScheduler::new();
    let queues = Arc::new(NamedQueues::new());
    let acks = Arc::new(MessageQueue::new(8));
    let notifier = Notifier::new(
        table.clone(),
        Arc::new(sched.clone()),
        queues.clone(),
        acks.clone(),
        ACK_TIMEOUT,
    );
    Rig {
        table,
        sched,
        queues,
        acks,
        notifier,
    }
}

impl Rig {
    /// Task in binary `owner` with a registered subscription and an open queue
    fn subscriber(&self, owner: Option<usize>, token: usize) -> Pid {
        let pid = self.sched.spawn(owner, false);
        self.queues.open_or_create(&callback_queue_name(pid), 4);
        self.notifier.register(pid, token).unwrap();
        pid
    }

    fn subscribers(&self, idx: usize) -> Vec<CallbackSubscription> {
        self.table.lock().get(idx).unwrap().subscribers.clone()
    }
}

#[test]
fn test_subscription_filed_under_owning_binary() {
    let rig = rig();
    let app_task = rig.subscriber(Some(2), 7);
    let kernel_thread = rig.subscriber(None, 8);

    assert_eq!(rig.subscribers(2), vec![CallbackSubscription { pid: app_task, token: 7 }]);
    assert_eq!(rig.subscribers(0), vec![CallbackSubscription { pid: kernel_thread, token: 8 }]);
    assert!(rig.subscribers(1).is_empty());
}

#[test]
fn test_second_registration_keeps_first() {
    let rig = rig();
    let pid = rig.subscriber(Some(1), 11);

    assert_eq!(rig.notifier.register(pid, 12), Err(Error::AlreadyRegistered));
    assert_eq!(rig.subscribers(1), vec![CallbackSubscription { pid, token: 11 }]);
}

#[test]
fn test_register_unknown_task_rejected() {
    let rig = rig();
    assert!(matches!(rig.notifier.register(4242, 1), Err(Error::InvalidParameter(_))));
}

#[test]
fn test_unregister() {
    let rig = rig();
    let pid = rig.subscriber(Some(1), 1);

    assert!(rig.notifier.unregister(pid).unwrap());
    assert!(!rig.notifier.unregister(pid).unwrap());
    assert!(rig.subscribers(1).is_empty());
}

#[test]
fn test_notify_skips_source_binary() {
    let rig = rig();
    let same = rig.subscriber(Some(1), 1);
    let other = rig.subscriber(Some(2), 2);

    let report = rig.notifier.notify(1, BinaryState::Running, false);
    assert_eq!(
        report,
        NotifyReport {
            sent: 1,
            acked: 0,
            failed: 0
        }
    );

    let msg = rig.queues.open(&callback_queue_name(other)).unwrap().try_receive().unwrap();
    assert_eq!(msg.bin_name.as_str(), "app1");
    assert_eq!(msg.state, BinaryState::Running);
    assert_eq!(msg.token, 2);
    assert!(!msg.needs_ack);
    assert!(rig.queues.open(&callback_queue_name(same)).unwrap().is_empty());
    assert_eq!(rig.sched.signals(), vec![(other, SIGBM)]);
}

#[test]
fn test_subscriber_without_queue_counts_as_failed() {
    let rig = rig();
    let pid = rig.sched.spawn(Some(2), false);
    rig.notifier.register(pid, 3).unwrap();

    let report = rig.notifier.notify(1, BinaryState::Unloaded, false);
    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 1);
    assert!(rig.sched.signals().is_empty());
}

#[test]
fn test_sync_notify_times_out_without_ack() {
    let rig = rig();
    rig.subscriber(Some(2), 5);

    let started = Instant::now();
    let report = rig.notifier.notify(1, BinaryState::ReadyToUnload, true);
    assert!(started.elapsed() >= ACK_TIMEOUT);
    assert_eq!(
        report,
        NotifyReport {
            sent: 1,
            acked: 0,
            failed: 1
        }
    );
}

#[test]
fn test_stale_ack_does_not_count() {
    let rig = rig();
    let pid = rig.subscriber(Some(2), 5);
    rig.acks.try_send(CallbackAck { pid }, PRIO_NORMAL).unwrap();

    let report = rig.notifier.notify(1, BinaryState::ReadyToUnload, true);
    assert_eq!(report.acked, 0);
    assert_eq!(report.failed, 1);
}

#[test]
fn test_sync_notify_collects_acks() {
    let rig = rig();
    let pid = rig.subscriber(Some(2), 5);
    let queue = rig.queues.open(&callback_queue_name(pid)).unwrap();
    let acks = rig.acks.clone();

    let responder = thread::spawn(move || {
        let msg = queue.receive_timeout(Duration::from_secs(5)).unwrap();
        assert!(msg.needs_ack);
        acks.send(CallbackAck { pid }, PRIO_NORMAL);
    });

    let report = rig.notifier.notify(1, BinaryState::ReadyToUnload, true);
    responder.join().unwrap();
    assert_eq!(
        report,
        NotifyReport {
            sent: 1,
            acked: 1,
            failed: 0
        }
    );
}

// ============================================================================
// Through the gateway
// ============================================================================

#[test]
fn test_client_sees_reload_lifecycle() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let listener_pid = fx.sched.spawn(Some(2), false);
    let listener = binmgr.client(listener_pid);
    listener.register_callback(42).unwrap();
    assert_eq!(listener.register_callback(43), Err(Error::AlreadyRegistered));

    binmgr.client(900).reload("app1").unwrap();

    let mut seen = Vec::new();
    while let Some(msg) = listener.next_callback(Duration::from_secs(5)) {
        assert_eq!(msg.bin_name.as_str(), "app1");
        assert_eq!(msg.token, 42);
        if msg.needs_ack {
            listener.ack_callback().unwrap();
        }
        seen.push(msg.state);
        if msg.state == BinaryState::Running {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![BinaryState::ReadyToUnload, BinaryState::Unloaded, BinaryState::Running]
    );
    assert!(binmgr.wait_idle(Duration::from_secs(5)));
}

#[test]
fn test_client_unregister() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let pid = fx.sched.spawn(Some(1), false);
    let client = binmgr.client(pid);

    assert!(matches!(client.unregister_callback(), Err(Error::NotFound(_))));
    client.register_callback(1).unwrap();
    client.unregister_callback().unwrap();
    assert!(client.next_callback(Duration::from_millis(10)).is_none());
}
