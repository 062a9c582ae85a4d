//! Local mount-point layout for one safe.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Directory inside the remote buffer holding the dated backups.
pub const BACKUP_DIR: &str = "C14ABT";
/// Remote path the archive exposes over SSH.
pub const REMOTE_BUFFER: &str = "/buffer";

/// All canonical local paths for a safe.
///
/// ```text
/// <mount_root>/<safe>/
/// ├── c14/                  remote buffer mount
/// │   ├── C14ABT/<dated>/   committed backups
/// │   ├── backup_temp_<n>/  in-flight transfer
/// │   └── <safe>.encfs6.xml remote copy of the key file
/// ├── encrypted/            encrypted view of the source root
/// └── <safe>.encfs6.xml     key file
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePaths {
    pub safe_dir: PathBuf,
    pub remote_mount: PathBuf,
    pub encrypted_view: PathBuf,
    pub key_file_local: PathBuf,
    pub key_file_remote: PathBuf,
    pub backup_root: PathBuf,
}

impl SafePaths {
    pub fn new(mount_root: &Path, safe_name: &str) -> Self {
        let safe_dir = mount_root.join(safe_name);
        let remote_mount = safe_dir.join("c14");
        let key_file_name = format!("{safe_name}.encfs6.xml");
        Self {
            encrypted_view: safe_dir.join("encrypted"),
            key_file_local: safe_dir.join(&key_file_name),
            key_file_remote: remote_mount.join(&key_file_name),
            backup_root: remote_mount.join(BACKUP_DIR),
            remote_mount,
            safe_dir,
        }
    }

    /// Local path of a temp directory inside the mounted buffer.
    pub fn temp_dir(&self, temp_name: &str) -> PathBuf {
        self.remote_mount.join(temp_name)
    }

    /// Create the local mount points; idempotent.
    pub fn create_mount_points(&self, with_encrypted_view: bool) -> Result<()> {
        create_dir(&self.safe_dir)?;
        create_dir(&self.remote_mount)?;
        if with_encrypted_view {
            create_dir(&self.encrypted_view)?;
        }
        Ok(())
    }
}

/// Remote path of a temp directory, as seen over SSH.
pub fn remote_temp_path(temp_name: &str) -> String {
    format!("{REMOTE_BUFFER}/{temp_name}")
}

/// Fresh per-run temp directory name.
pub fn random_temp_name() -> String {
    format!("backup_temp_{}", rand::random::<u32>())
}

pub fn create_dir(dir: &Path) -> Result<()> {
    debug!(dir = %dir.display(), "creating folder");
    fs::create_dir_all(dir).with_context(|| format!("create folder {}", dir.display()))
}
