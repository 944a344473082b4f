//! Mounting and unmounting the source machine against a simulated host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use p2v_transfer::adapters::simulated::SimulatedHost;
use p2v_transfer::core::models::{CommandOutput, FilesystemEntry};
use p2v_transfer::core::{MigrationTracker, SourceMounts, UnmountPolicy};
use p2v_transfer::error::{MigrationError, MountError};

const FSTAB: &str = "\
# /etc/fstab: static file system information.
proc            /proc           proc    defaults        0       0
/dev/sda1       /               ext3    errors=remount-ro 0     1
/dev/sda2       /usr            ext4    defaults        0       2
/dev/sda3       /var            ext2    defaults        0       2
UUID=1234-abcd  none            swap    sw              0       0
/dev/scd0       /media/cdrom0   udf,iso9660 user,noauto 0       0
";

fn source_host() -> Arc<SimulatedHost> {
    let host = Arc::new(SimulatedHost::new());
    host.add_dir("/source");
    host.add_file("/source/etc/fstab", FSTAB);
    host
}

fn mounts(host: &Arc<SimulatedHost>) -> SourceMounts {
    SourceMounts::new(host.clone(), "/source", UnmountPolicy::default())
}

fn entries(pairs: &[(&str, &str)]) -> Vec<FilesystemEntry> {
    pairs
        .iter()
        .map(|(device, mount_point)| FilesystemEntry::new(*device, *mount_point))
        .collect()
}

#[tokio::test]
async fn test_mounts_root_then_table_entries_in_order() {
    let host = source_host();
    let tracker = MigrationTracker::new();

    let table = mounts(&host)
        .mount_all("/dev/sda1", None, &tracker)
        .await
        .unwrap();

    assert_eq!(
        host.commands(),
        vec![
            "mount /dev/sda1 /source",
            "mount /dev/sda2 /source/usr",
            "mount /dev/sda3 /source/var",
        ]
    );
    assert_eq!(table.swap_devices.len(), 1);
    assert_eq!(table.swap_devices[0].as_str(), "UUID=1234-abcd");
    assert_eq!(
        tracker.mounted().await,
        entries(&[("/dev/sda1", "/"), ("/dev/sda2", "/usr"), ("/dev/sda3", "/var")])
    );
}

#[tokio::test]
async fn test_given_table_replaces_source_fstab() {
    let host = source_host();
    let tracker = MigrationTracker::new();

    mounts(&host)
        .mount_all("/dev/sda1", Some("/dev/sdb1 /home ext4 defaults 0 2\n"), &tracker)
        .await
        .unwrap();

    assert_eq!(
        host.commands(),
        vec!["mount /dev/sda1 /source", "mount /dev/sdb1 /source/home"]
    );
}

#[tokio::test]
async fn test_creates_missing_mount_root() {
    let host = Arc::new(SimulatedHost::new());
    host.add_file("/source/etc/fstab", "/dev/sda1 / ext3 defaults 0 1\n");
    let tracker = MigrationTracker::new();

    mounts(&host)
        .mount_all("/dev/sda1", None, &tracker)
        .await
        .unwrap();

    assert!(host.mounted().contains(&PathBuf::from("/source")));
}

#[tokio::test]
async fn test_failed_filesystem_is_skipped() {
    let host = source_host();
    host.script("mount /dev/sda2", vec![Ok(CommandOutput::failure(32, "wrong fs type"))]);
    let tracker = MigrationTracker::new();

    mounts(&host)
        .mount_all("/dev/sda1", None, &tracker)
        .await
        .unwrap();

    assert_eq!(
        tracker.mounted().await,
        entries(&[("/dev/sda1", "/"), ("/dev/sda3", "/var")])
    );
    assert_eq!(
        host.mounted(),
        vec![PathBuf::from("/source"), PathBuf::from("/source/var")]
    );
}

#[tokio::test]
async fn test_root_mount_failure_is_fatal() {
    let host = source_host();
    host.script("mount /dev/sda1", vec![Ok(CommandOutput::failure(32, "special device does not exist"))]);
    let tracker = MigrationTracker::new();

    let err = mounts(&host)
        .mount_all("/dev/sda1", None, &tracker)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Mount(MountError::Root { .. })));
    assert!(tracker.mounted().await.is_empty());
    assert_eq!(host.commands().len(), 1);
}

#[tokio::test]
async fn test_uncreatable_root_is_fatal() {
    let host = Arc::new(SimulatedHost::new());
    host.deny_dir("/source");
    let tracker = MigrationTracker::new();

    let err = mounts(&host)
        .mount_all("/dev/sda1", None, &tracker)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Mount(MountError::Root { .. })));
    assert!(host.commands().is_empty());
}

#[tokio::test]
async fn test_missing_fstab_keeps_root_recorded() {
    let host = Arc::new(SimulatedHost::new());
    host.add_dir("/source");
    let tracker = MigrationTracker::new();

    let err = mounts(&host)
        .mount_all("/dev/sda1", None, &tracker)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::DeviceTable(_)));
    assert_eq!(tracker.mounted().await, entries(&[("/dev/sda1", "/")]));
}

#[tokio::test]
async fn test_unmounts_in_reverse_order() {
    let host = source_host();
    let tracker = MigrationTracker::new();
    let mounts = mounts(&host);
    mounts.mount_all("/dev/sda1", None, &tracker).await.unwrap();

    mounts.unmount_all(&tracker.take_mounted().await).await.unwrap();

    let unmounts: Vec<_> = host
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("umount"))
        .collect();
    assert_eq!(
        unmounts,
        vec!["umount /source/var", "umount /source/usr", "umount /source"]
    );
    assert!(host.mounted().is_empty());
}

#[tokio::test]
async fn test_busy_mount_is_retried() {
    let host = source_host();
    host.script(
        "umount /source/usr",
        vec![Ok(CommandOutput::failure(32, "target is busy")), Ok(CommandOutput::success())],
    );
    let tracker = MigrationTracker::new();
    let mounts = mounts(&host);
    mounts.mount_all("/dev/sda1", None, &tracker).await.unwrap();

    mounts.unmount_all(&tracker.take_mounted().await).await.unwrap();

    assert_eq!(host.pause_count(), 1);
    assert!(host.mounted().is_empty());
}

#[tokio::test]
async fn test_stuck_mount_is_reported_and_others_still_unmounted() {
    let host = source_host();
    host.script("umount /source/usr", vec![Ok(CommandOutput::failure(32, "target is busy"))]);
    let tracker = MigrationTracker::new();
    let mounts = mounts(&host);
    mounts.mount_all("/dev/sda1", None, &tracker).await.unwrap();

    let err = mounts
        .unmount_all(&tracker.take_mounted().await)
        .await
        .unwrap_err();

    match err {
        MigrationError::Unmount { failed } => {
            assert_eq!(failed, vec![PathBuf::from("/source/usr")]);
        }
        other => panic!("expected Unmount error, got {other:?}"),
    }
    let attempts = host
        .commands()
        .iter()
        .filter(|c| c.as_str() == "umount /source/usr")
        .count();
    assert_eq!(attempts, 3);
    assert_eq!(host.pause_count(), 2);
    assert_eq!(host.mounted(), vec![PathBuf::from("/source/usr")]);
}

#[tokio::test]
async fn test_unmount_skips_paths_not_mounted() {
    let host = source_host();
    let mounts = mounts(&host);

    mounts
        .unmount_all(&entries(&[("/dev/sda1", "/"), ("/dev/sda2", "/usr")]))
        .await
        .unwrap();

    assert!(host.commands().is_empty());
    assert!(!host.mounted().contains(&Path::new("/source").to_path_buf()));
}
