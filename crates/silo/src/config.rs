//! Repository configuration and filesystem layout.
//!
//! Everything silo persists lives under one repository directory: the two
//! shared regions and their create-lock file at the root, startup data,
//! notification data, and YANG modules in subdirectories created on first
//! init.

use std::path::{Path, PathBuf};

use silo_error::{Result, SiloError};

/// Environment variable overriding the repository path.
pub const REPO_PATH_ENV: &str = "SILO_REPO_PATH";

/// Repository location and permissions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SiloConfig {
    /// Repository directory.
    pub repo_path: PathBuf,
    /// Mode bits for created directories.
    pub dir_perm: u32,
    /// Mode bits for created files (regions, lock file, datastore files).
    pub file_perm: u32,
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("/var/lib/silo"),
            dir_perm: 0o770,
            file_perm: 0o660,
        }
    }
}

impl SiloConfig {
    /// Default configuration with the repository path taken from
    /// `SILO_REPO_PATH` when set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(REPO_PATH_ENV) {
            config.repo_path = PathBuf::from(path);
        }
        config
    }

    /// Configuration rooted at an explicit repository path.
    pub fn with_repo_path(path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: path.into(),
            ..Self::default()
        }
    }

    /// The main region file.
    #[must_use]
    pub fn main_shm_path(&self) -> PathBuf {
        self.repo_path.join("main.shm")
    }

    /// The extension region file.
    #[must_use]
    pub fn ext_shm_path(&self) -> PathBuf {
        self.repo_path.join("ext.shm")
    }

    /// The creation/mutation gate lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.repo_path.join("main.lock")
    }

    /// Startup datastore directory.
    #[must_use]
    pub fn startup_dir(&self) -> PathBuf {
        self.repo_path.join("data").join("startup")
    }

    /// Notification data directory.
    #[must_use]
    pub fn notif_dir(&self) -> PathBuf {
        self.repo_path.join("data").join("notif")
    }

    /// YANG module directory.
    #[must_use]
    pub fn yang_dir(&self) -> PathBuf {
        self.repo_path.join("yang")
    }

    /// Persisted startup file of one module.
    #[must_use]
    pub fn startup_file(&self, module: &str) -> PathBuf {
        self.startup_dir().join(format!("{module}.startup"))
    }

    /// Running-datastore file of one module.
    #[must_use]
    pub fn running_file(&self, module: &str) -> PathBuf {
        self.repo_path
            .join("data")
            .join(format!("{module}.running"))
    }
}

/// Create the repository directories on first init, with the configured
/// permissions.
pub fn check_dirs(config: &SiloConfig) -> Result<()> {
    for dir in [
        config.startup_dir(),
        config.notif_dir(),
        config.yang_dir(),
    ] {
        ensure_dir(&dir, config.dir_perm)?;
    }
    Ok(())
}

fn ensure_dir(path: &Path, perm: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(path).map_err(|_| SiloError::RepoUnavailable {
        path: path.to_path_buf(),
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(perm)).map_err(|_| {
        SiloError::RepoUnavailable {
            path: path.to_path_buf(),
        }
    })?;
    Ok(())
}
