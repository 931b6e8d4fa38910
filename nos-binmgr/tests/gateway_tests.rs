//! Gateway request handling, end to end through client queues

mod common;

use std::time::Duration;

use common::*;
use nos_binmgr::{BinaryGroup, BinaryState, Command, Error, Payload, ResultCode};

#[test]
fn test_get_info_all_lists_kernel_first() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let rows = binmgr.client(200).get_info_all().unwrap();

    let rows: Vec<(&str, &str, i64)> = rows
        .iter()
        .map(|r| (r.name.as_str(), r.version.as_str(), r.available_size))
        .collect();
    assert_eq!(
        rows,
        vec![("kernel", "2.0", -1), ("app1", "3", PART_SIZE as i64), ("app2", "1", -1)]
    );
}

#[test]
fn test_get_info_single_binary() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let client = binmgr.client(200);

    let info = client.get_info("app1").unwrap();
    assert_eq!(info.version.as_str(), "3");
    assert_eq!(info.available_size, PART_SIZE as i64);
    assert!(matches!(client.get_info("nope"), Err(Error::NotFound(_))));
}

#[test]
fn test_get_state() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let client = binmgr.client(200);

    assert_eq!(client.get_state("app1").unwrap(), BinaryState::Running);
    assert_eq!(client.get_state("kernel").unwrap(), BinaryState::Running);
    assert!(matches!(client.get_state("nope"), Err(Error::NotFound(_))));
}

#[test]
fn test_get_path_points_at_inactive_bank() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let client = binmgr.client(200);

    assert_eq!(client.get_path("app1").unwrap().as_str(), path(APP1_B));
    assert!(matches!(client.get_path("app2"), Err(Error::NotFound(_))));
}

#[test]
fn test_reload_rejections() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let client = binmgr.client(200);

    assert!(matches!(client.reload("kernel"), Err(Error::InvalidParameter(_))));
    assert!(matches!(client.reload("nope"), Err(Error::NotFound(_))));
    assert_eq!(fx.loader.calls().len(), 2);
}

#[test]
fn test_reload_picks_up_new_image() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let client = binmgr.client(200);
    write_app(&fx.flash, APP1_B, "app1", "4");

    client.reload("app1").unwrap();
    assert!(wait_for(Duration::from_secs(5), || fx.loader.calls().len() == 3));
    assert!(binmgr.wait_idle(Duration::from_secs(5)));

    assert_eq!(client.get_info("app1").unwrap().version.as_str(), "4");
    assert_eq!(client.get_path("app1").unwrap().as_str(), path(APP1_A));
    assert_eq!(client.get_state("app1").unwrap(), BinaryState::Running);
}

#[test]
fn test_internal_commands_rejected_from_tasks() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let client = binmgr.client(200);

    let resp = client.call(Command::Fault { bin_idx: 1 }).unwrap();
    assert_eq!(resp.result, ResultCode::InvalidParameter);
    let resp = client.call(Command::Shutdown).unwrap();
    assert_eq!(resp.result, ResultCode::InvalidParameter);

    // Still serving, nothing quarantined
    assert_eq!(client.get_state("app1").unwrap(), BinaryState::Running);
    assert!(fx.board.resets().is_empty());
}

#[test]
fn test_update_without_newer_image() {
    let fx = Fixture::new();
    let binmgr = fx.started();

    let (code, groups) = binmgr.client(200).update(BinaryGroup::APP | BinaryGroup::KERNEL).unwrap();
    assert_eq!(code, ResultCode::AlreadyUpdated);
    assert_eq!(
        groups,
        vec![
            (BinaryGroup::KERNEL, ResultCode::AlreadyUpdated),
            (BinaryGroup::APP, ResultCode::AlreadyUpdated),
        ]
    );
    assert!(fx.flash.writes().is_empty());
}

#[test]
fn test_update_switches_app_bank() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    write_app(&fx.flash, APP1_B, "app1", "4");

    let (code, groups) = binmgr.client(200).update(BinaryGroup::APP | BinaryGroup::COMMON).unwrap();
    assert_eq!(code, ResultCode::Ok);
    assert_eq!(
        groups,
        vec![(BinaryGroup::APP, ResultCode::Ok), (BinaryGroup::COMMON, ResultCode::NotFound)]
    );

    let bootparam = binmgr.bootparam().unwrap();
    let bootparam = bootparam.lock();
    let record = bootparam.current().unwrap();
    assert_eq!(record.update_version, 1);
    assert_eq!(record.app_bank(1), Some(1));
    assert_eq!(record.app_bank(2), Some(0));
}

#[test]
fn test_update_without_group_is_invalid() {
    let fx = Fixture::new();
    let binmgr = fx.started();

    let resp = binmgr.client(200).call(Command::Update { groups: BinaryGroup::empty() }).unwrap();
    assert_eq!(resp.result, ResultCode::InvalidParameter);
    assert_eq!(resp.payload, Payload::None);
}

#[test]
fn test_response_goes_to_requester_only() {
    let fx = Fixture::new();
    let binmgr = fx.started();
    let a = binmgr.client(200);
    let b = binmgr.client(201);

    assert_eq!(a.get_state("app2").unwrap(), BinaryState::Running);
    assert_eq!(b.get_info("app2").unwrap().version.as_str(), "1");
    assert_eq!(a.get_info("app1").unwrap().version.as_str(), "3");
}
