//! Device table (`/etc/fstab`) parsing.
//!
//! Only the two kinds of line the migration cares about are kept: journaling
//! ext filesystems, which get mounted and copied, and swap devices, which are
//! used to size swap on the target. Everything else is skipped silently.

use tracing::debug;

use super::models::{DeviceTable, FilesystemEntry, SwapDevice};

/// Filesystem types that are mounted and copied.
const ACCEPTED_FILESYSTEMS: &[&str] = &["ext2", "ext3", "ext4"];

const FIELD_COUNT: usize = 6;

/// Parse device table text, preserving line order.
pub fn parse(table: &str) -> DeviceTable {
    let mut parsed = DeviceTable::default();

    for line in table.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != FIELD_COUNT {
            continue;
        }

        let (device, mount_point, fs_type) = (fields[0], fields[1], fields[2]);

        if ACCEPTED_FILESYSTEMS.contains(&fs_type) {
            parsed
                .filesystems
                .push(FilesystemEntry::new(device, mount_point));
        } else if fs_type == "swap" {
            parsed.swap_devices.push(SwapDevice(device.to_string()));
        }
    }

    debug!(
        filesystems = %parsed
            .filesystems
            .iter()
            .map(|e| e.device.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        swap = %parsed
            .swap_devices
            .iter()
            .map(SwapDevice::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        "Interpreted device table"
    );

    parsed
}
