use std::env;

use serde::{Deserialize, Serialize};
use sysinfo::Disks;

/// Filesystems cameras and phones format removable media with.
const CAMERA_FILE_SYSTEMS: &[&str] = &["vfat", "fat", "fat16", "fat32", "msdos", "exfat"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub mount_point: String,
    pub file_system: String,
    pub total_space_bytes: u64,
    pub free_space_bytes: u64,
    pub is_removable: bool,
    /// Removable or camera-formatted, so worth offering as a scan root.
    pub candidate_source: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub arch: String,
    pub current_dir: Option<String>,
    pub volumes: Vec<VolumeInfo>,
    pub notes: Vec<String>,
}

pub fn collect_doctor_info() -> DoctorInfo {
    let current_dir = env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());

    let volumes = enumerate_volumes();
    let mut notes = vec![
        "Sources are only ever read; repaired files are written to the destination.".to_string(),
    ];
    if volumes.is_empty() {
        notes.push("No volumes detected by sysinfo; pass the card's mount point explicitly.".to_string());
    } else if !volumes.iter().any(|volume| volume.candidate_source) {
        notes.push(
            "No removable or FAT/exFAT volume found; is the card or OTG drive mounted?".to_string(),
        );
    }

    DoctorInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        current_dir,
        volumes,
        notes,
    }
}

fn enumerate_volumes() -> Vec<VolumeInfo> {
    let disks = Disks::new_with_refreshed_list();
    let mut volumes = disks
        .list()
        .iter()
        .map(|disk| {
            volume_info(
                disk.name().to_string_lossy().to_string(),
                disk.mount_point().to_string_lossy().to_string(),
                disk.file_system().to_string_lossy().to_string(),
                disk.total_space(),
                disk.available_space(),
                disk.is_removable(),
            )
        })
        .filter(|volume| !looks_virtual_mount(&volume.mount_point, &volume.file_system))
        .collect::<Vec<_>>();
    volumes.sort_by(|a, b| {
        b.candidate_source
            .cmp(&a.candidate_source)
            .then_with(|| a.mount_point.cmp(&b.mount_point))
    });
    volumes
}

fn volume_info(
    name: String,
    mount_point: String,
    file_system: String,
    total_space_bytes: u64,
    free_space_bytes: u64,
    is_removable: bool,
) -> VolumeInfo {
    let fs = file_system.to_ascii_lowercase();
    VolumeInfo {
        candidate_source: is_removable || CAMERA_FILE_SYSTEMS.contains(&fs.as_str()),
        name,
        mount_point,
        file_system,
        total_space_bytes,
        free_space_bytes,
        is_removable,
    }
}

fn looks_virtual_mount(mount: &str, fs: &str) -> bool {
    let fs = fs.to_ascii_lowercase();
    ["tmpfs", "overlay", "proc", "sysfs", "devfs", "ramfs", "squashfs"]
        .iter()
        .any(|pattern| fs.contains(pattern))
        || mount.starts_with("/proc")
        || mount.starts_with("/sys")
}

#[cfg(test)]
mod tests {
    use super::{collect_doctor_info, looks_virtual_mount, volume_info};

    #[test]
    fn fat_and_removable_volumes_are_candidates() {
        let card = volume_info(
            "sdb1".to_string(),
            "/media/user/CAMERA".to_string(),
            "vfat".to_string(),
            32 << 30,
            1 << 30,
            false,
        );
        assert!(card.candidate_source);

        let usb = volume_info(
            "sdc1".to_string(),
            "/media/user/OTG".to_string(),
            "ext4".to_string(),
            8 << 30,
            4 << 30,
            true,
        );
        assert!(usb.candidate_source);

        let system = volume_info(
            "nvme0n1p2".to_string(),
            "/".to_string(),
            "ext4".to_string(),
            512 << 30,
            100 << 30,
            false,
        );
        assert!(!system.candidate_source);
    }

    #[test]
    fn pseudo_filesystems_are_hidden() {
        assert!(looks_virtual_mount("/run", "tmpfs"));
        assert!(looks_virtual_mount("/proc", "proc"));
        assert!(!looks_virtual_mount("/media/card", "exfat"));
    }

    #[test]
    fn doctor_reports_platform() {
        let info = collect_doctor_info();
        assert!(!info.os.is_empty());
        assert!(!info.notes.is_empty());
    }
}
