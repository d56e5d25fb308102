use std::path::{Path, PathBuf};

/// Name of the instance that existed before multi-instance support.
pub const DEFAULT_INSTANCE: &str = "default";

/// Per-instance file names. Stable across versions.
pub const OPTIONS_FILE: &str = "options.json";
pub const HARDWARE_MODEL_FILE: &str = "machw.bin";
pub const MACHINE_IDENTIFIER_FILE: &str = "macid.bin";
pub const MAC_ADDRESS_FILE: &str = "macaddress.bin";
pub const AUXILIARY_STORAGE_FILE: &str = "macaux.bin";
pub const DISK_IMAGE_FILE: &str = "disk.img";
pub const RESTORE_IMAGE_FILE: &str = "restore.iso";
pub const SERIAL_OUTPUT_FILE: &str = "serial0.out";
pub const VNC_SECRET_FILE: &str = "vnc.secret";
/// Held (flock) by the process running the instance; holds its PID.
pub const PID_FILE: &str = "cannery.pid";

const TRASH_DIR: &str = ".trash";

fn data_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Root holding one directory per instance: `~/.local/share/cannery/machines/`
pub fn default_root() -> PathBuf {
    data_dir().join("cannery").join("machines")
}

/// Pre-multi-instance flat directory: `~/.local/share/canned-mac/`
pub fn legacy_dir() -> PathBuf {
    data_dir().join("canned-mac")
}

/// Host config file: `~/.config/cannery/cannery.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cannery")
        .join("cannery.toml")
}

/// Recoverable trash for deleted instances, kept under the root so a
/// rename never crosses filesystems.
pub fn trash_dir(root: &Path) -> PathBuf {
    root.join(TRASH_DIR)
}

pub fn instance_dir(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

/// Cached installer image for an instance.
pub fn restore_image_path(dir: &Path) -> PathBuf {
    dir.join(RESTORE_IMAGE_FILE)
}

/// Partial download, renamed over the cache path once complete.
pub fn restore_image_part_path(dir: &Path) -> PathBuf {
    dir.join(format!("{RESTORE_IMAGE_FILE}.part"))
}

pub fn disk_image_path(dir: &Path) -> PathBuf {
    dir.join(DISK_IMAGE_FILE)
}

pub fn options_path(dir: &Path) -> PathBuf {
    dir.join(OPTIONS_FILE)
}

pub fn serial_output_path(dir: &Path) -> PathBuf {
    dir.join(SERIAL_OUTPUT_FILE)
}

pub fn vnc_secret_path(dir: &Path) -> PathBuf {
    dir.join(VNC_SECRET_FILE)
}

pub fn pid_path(dir: &Path) -> PathBuf {
    dir.join(PID_FILE)
}

pub fn logs_dir(dir: &Path) -> PathBuf {
    dir.join("logs")
}
