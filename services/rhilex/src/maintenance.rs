//! Offline maintenance: database recovery and firmware upgrade
//!
//! Both operations run while the gateway is stopped and hold a lock file
//! for their duration. Uploaded files live under `<workdir>/upload`.

use std::fs;
use std::path::{Path, PathBuf};

use errors::{RhilexError, RhilexResult};
use tracing::{info, warn};

pub const LOCK_FILE: &str = "rhilex-upgrade.lock";
pub const RECOVERY_DB: &str = "upload/recovery.db";
pub const FIRMWARE: &str = "upload/firmware/rhilex";

/// Directory the gateway runs from
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn current() -> RhilexResult<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn recovery_db(&self) -> PathBuf {
        self.root.join(RECOVERY_DB)
    }

    pub fn firmware(&self) -> PathBuf {
        self.root.join(FIRMWARE)
    }

    /// Resolve a path from the config against the work dir
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Held while an operation runs; removes the lock file on drop
struct LockGuard(PathBuf);

impl LockGuard {
    fn acquire(path: PathBuf) -> RhilexResult<Self> {
        if path.exists() {
            return Err(RhilexError::AlreadyRunning(format!(
                "maintenance lock {} is held",
                path.display()
            )));
        }
        fs::write(&path, b"0")?;
        Ok(Self(path))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            warn!("Remove lock file {} failed: {}", self.0.display(), e);
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn require(path: &Path) -> RhilexResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(RhilexError::FileNotFound(path.display().to_string()))
    }
}

/// Replace the working database with `upload/recovery.db`. The current
/// database is kept as `<db>.bak`. Returns the backup path when one was made.
pub fn recover(dir: &WorkDir, db_path: impl AsRef<Path>) -> RhilexResult<Option<PathBuf>> {
    let source = dir.recovery_db();
    require(&source)?;
    let _lock = LockGuard::acquire(dir.lock_path())?;

    let db = dir.resolve(db_path);
    let backup = if db.exists() {
        let backup = with_suffix(&db, ".bak");
        fs::rename(&db, &backup)?;
        info!("Database backed up to {}", backup.display());
        Some(backup)
    } else {
        None
    };
    // sqlite sidecar files belong to the old database
    for sidecar in ["-wal", "-shm"] {
        let path = with_suffix(&db, sidecar);
        if path.exists() {
            fs::remove_file(&path)?;
        }
    }
    if let Err(e) = fs::rename(&source, &db) {
        if let Some(backup) = &backup {
            fs::rename(backup, &db)?;
        }
        return Err(e.into());
    }
    info!("Database recovered from {}", source.display());
    Ok(backup)
}

/// Swap the executable at `exe` for `upload/firmware/rhilex`, keeping the
/// old one next to it as `rhilex.old`
pub fn upgrade(dir: &WorkDir, exe: impl AsRef<Path>) -> RhilexResult<PathBuf> {
    let firmware = dir.firmware();
    require(&firmware)?;
    let _lock = LockGuard::acquire(dir.lock_path())?;

    let exe = dir.resolve(exe);
    let old = exe
        .parent()
        .map(|p| p.join("rhilex.old"))
        .ok_or_else(|| RhilexError::InvalidParameter {
            param: "exe".to_string(),
            reason: format!("{} has no parent directory", exe.display()),
        })?;
    if exe.exists() {
        fs::copy(&exe, &old)?;
        info!("Backed up {} to {}", exe.display(), old.display());
    }
    fs::copy(&firmware, &exe)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755))?;
    }
    fs::remove_file(&firmware)?;
    info!("Firmware installed at {}", exe.display());
    Ok(old)
}
