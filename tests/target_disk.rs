//! Target disk discovery, sizing and partitioning over a simulated session.

use std::path::Path;
use std::sync::Arc;

use p2v_transfer::adapters::simulated::{SimulatedHost, SimulatedSession};
use p2v_transfer::core::models::{CommandOutput, DiskLayout, SwapDevice};
use p2v_transfer::core::TargetDisk;
use p2v_transfer::error::MigrationError;

const HUNDRED_GIB: &str = "107374182400\n";
const TWO_GIB: &str = "2147483648\n";

fn candidates() -> Vec<String> {
    vec!["/dev/xvda".to_string(), "/dev/vda".to_string(), "/dev/sda".to_string()]
}

fn target(host: &Arc<SimulatedHost>) -> TargetDisk {
    TargetDisk::new(host.clone(), "/target")
}

fn swap(devices: &[&str]) -> Vec<SwapDevice> {
    devices.iter().map(|d| SwapDevice(d.to_string())).collect()
}

#[tokio::test]
async fn test_finds_first_existing_candidate() {
    let host = Arc::new(SimulatedHost::new());
    let session = SimulatedSession::new();
    session.script("test -b", vec![Ok(CommandOutput::failure(1, ""))]);
    session.script("test -b /dev/vda", vec![Ok(CommandOutput::success())]);

    let disk = target(&host).find(&session, &candidates()).await.unwrap();

    assert_eq!(disk, "/dev/vda");
    assert_eq!(session.commands(), vec!["test -b /dev/xvda", "test -b /dev/vda"]);
}

#[tokio::test]
async fn test_no_disk_is_a_sizing_error() {
    let host = Arc::new(SimulatedHost::new());
    let session = SimulatedSession::new();
    session.script("test -b", vec![Ok(CommandOutput::failure(1, ""))]);

    let err = target(&host).find(&session, &candidates()).await.unwrap_err();

    assert!(matches!(err, MigrationError::Sizing(_)));
    assert_eq!(session.commands().len(), 3);
}

#[tokio::test]
async fn test_layout_resolves_references_and_caps_nothing_when_small() {
    let host = Arc::new(SimulatedHost::new());
    host.script("findfs UUID=1234-abcd", vec![Ok(CommandOutput::with_stdout("/dev/sda5\n"))]);
    host.script("blockdev --getsize64 /dev/sda5", vec![Ok(CommandOutput::with_stdout(TWO_GIB))]);
    let session = SimulatedSession::new();
    session.script("blockdev --getsize64 /dev/xvda", vec![Ok(CommandOutput::with_stdout(HUNDRED_GIB))]);

    let layout = target(&host)
        .determine_layout(&session, &swap(&["UUID=1234-abcd"]), "/dev/xvda")
        .await
        .unwrap();

    assert_eq!(
        layout,
        DiskLayout {
            total_megabytes: 102_400,
            swap_megabytes: 2048
        }
    );
    assert_eq!(
        host.commands(),
        vec!["findfs UUID=1234-abcd", "blockdev --getsize64 /dev/sda5"]
    );
}

#[tokio::test]
async fn test_swap_is_capped_at_a_tenth_of_the_disk() {
    let host = Arc::new(SimulatedHost::new());
    host.script("blockdev --getsize64 /dev/sda5", vec![Ok(CommandOutput::with_stdout(TWO_GIB))]);
    let session = SimulatedSession::new();
    // 10 GiB target
    session.script("blockdev --getsize64", vec![Ok(CommandOutput::with_stdout("10737418240\n"))]);

    let layout = target(&host)
        .determine_layout(&session, &swap(&["/dev/sda5"]), "/dev/xvda")
        .await
        .unwrap();

    assert_eq!(layout.total_megabytes, 10_240);
    assert_eq!(layout.swap_megabytes, 1024);
    assert_eq!(layout.data_megabytes(), 9216);
}

#[tokio::test]
async fn test_unreadable_swap_device_is_ignored() {
    let host = Arc::new(SimulatedHost::new());
    host.script("blockdev --getsize64 /dev/sda5", vec![Ok(CommandOutput::with_stdout(TWO_GIB))]);
    host.script("blockdev --getsize64 /dev/sdb2", vec![Ok(CommandOutput::failure(1, "No such device"))]);
    let session = SimulatedSession::new();
    session.script("blockdev --getsize64", vec![Ok(CommandOutput::with_stdout(HUNDRED_GIB))]);

    let layout = target(&host)
        .determine_layout(&session, &swap(&["/dev/sdb2", "/dev/sda5"]), "/dev/xvda")
        .await
        .unwrap();

    assert_eq!(layout.swap_megabytes, 2048);
}

#[tokio::test]
async fn test_no_swap_is_a_sizing_error() {
    let host = Arc::new(SimulatedHost::new());
    let session = SimulatedSession::new();
    session.script("blockdev --getsize64", vec![Ok(CommandOutput::with_stdout(HUNDRED_GIB))]);

    let err = target(&host)
        .determine_layout(&session, &[], "/dev/xvda")
        .await
        .unwrap_err();

    match err {
        MigrationError::Sizing(message) => assert_eq!(
            message,
            "No swap devices found, so swap size could not be determined."
        ),
        other => panic!("expected Sizing error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unresolvable_swap_reference_is_fatal() {
    let host = Arc::new(SimulatedHost::new());
    host.script("findfs", vec![Ok(CommandOutput::failure(1, "unable to resolve"))]);
    let session = SimulatedSession::new();
    session.script("blockdev --getsize64", vec![Ok(CommandOutput::with_stdout(HUNDRED_GIB))]);

    let err = target(&host)
        .determine_layout(&session, &swap(&["LABEL=swap"]), "/dev/xvda")
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Sizing(_)));
}

#[tokio::test]
async fn test_partition_issues_exact_commands() {
    let host = Arc::new(SimulatedHost::new());
    let session = SimulatedSession::new();
    let layout = DiskLayout::compute(102_400, 2048);

    target(&host)
        .partition(&session, &layout, "/dev/xvda")
        .await
        .unwrap();

    assert_eq!(
        session.commands(),
        vec![
            "sfdisk -uM /dev/xvda <<EOF\n0,100352,83\n,,82\nEOF\n",
            "mkfs.ext3 /dev/xvda1 && mkswap /dev/xvda2 && mkdir -p /target && mount /dev/xvda1 /target",
        ]
    );
}

#[tokio::test]
async fn test_partition_retries_once_after_cleanup() {
    let host = Arc::new(SimulatedHost::new());
    let session = SimulatedSession::new();
    session.script(
        "mkfs.ext3",
        vec![Ok(CommandOutput::failure(1, "device busy")), Ok(CommandOutput::success())],
    );
    let layout = DiskLayout::compute(102_400, 2048);

    target(&host)
        .partition(&session, &layout, "/dev/xvda")
        .await
        .unwrap();

    let commands = session.commands();
    assert_eq!(commands.len(), 5);
    assert!(commands[0].starts_with("sfdisk"));
    assert!(commands[1].starts_with("mkfs.ext3"));
    assert_eq!(commands[2], "umount /target ; rmdir /target");
    assert!(commands[3].starts_with("sfdisk"));
    assert!(commands[4].starts_with("mkfs.ext3"));
}

#[tokio::test]
async fn test_second_partition_failure_is_final() {
    let host = Arc::new(SimulatedHost::new());
    let session = SimulatedSession::new();
    session.script("sfdisk", vec![Ok(CommandOutput::failure(1, "re-reading partition table failed"))]);
    let layout = DiskLayout::compute(102_400, 2048);

    let err = target(&host)
        .partition(&session, &layout, "/dev/xvda")
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Partition(_)));
    let sfdisk_runs = session
        .commands()
        .iter()
        .filter(|c| c.starts_with("sfdisk"))
        .count();
    assert_eq!(sfdisk_runs, 2);
    assert!(!session.commands().iter().any(|c| c.starts_with("mkfs")));
}

#[tokio::test]
async fn test_dropped_connection_is_not_retried() {
    let host = Arc::new(SimulatedHost::new());
    let session = SimulatedSession::new();
    session.script("sfdisk", vec![Err("connection reset by peer".to_string())]);
    let layout = DiskLayout::compute(102_400, 2048);

    let err = target(&host)
        .partition(&session, &layout, "/dev/xvda")
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Connection(_)));
    let commands = session.commands();
    assert_eq!(commands.iter().filter(|c| c.starts_with("sfdisk")).count(), 1);
    assert!(!commands.iter().any(|c| c.starts_with("umount")));
}

#[test]
fn test_cleanup_command_shape() {
    assert_eq!(
        p2v_transfer::core::disk::cleanup_command(Path::new("/target")),
        "umount /target ; rmdir /target"
    );
}
