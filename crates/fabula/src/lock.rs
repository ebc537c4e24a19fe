//! Project lock to prevent concurrent workflow runs.
//!
//! A project has at most one active workflow thread. The lock file lives in
//! the project root and carries JSON metadata about the holder (PID,
//! hostname, timestamp, run_id). Stale locks older than the timeout are
//! taken over.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub const LOCK_FILE: &str = ".fabula.lock";

/// Information stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder
    pub pid: u32,
    /// Hostname where the lock was acquired
    pub hostname: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// Run being executed, once known
    pub run_id: Option<String>,
}

/// Lock file handle that releases on Drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the project lock. Fails if another live holder has it.
    pub fn acquire(project_root: &Path) -> Result<Self> {
        let lock_path = project_root.join(LOCK_FILE);
        fs::create_dir_all(project_root).map_err(EngineError::storage)?;

        if lock_path.exists() {
            let info = Self::read_lock_info(project_root)?;
            return Err(EngineError::user(format!(
                "another run holds the project lock (pid {} on {} since {}, run_id: {:?})",
                info.pid, info.hostname, info.acquired_at, info.run_id
            )));
        }

        Self::write_lock(&lock_path, None)?;
        Ok(Self { path: lock_path })
    }

    /// Acquire the lock, taking over stale holders older than `timeout`.
    /// A zero timeout forces takeover.
    pub fn acquire_with_timeout(project_root: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = project_root.join(LOCK_FILE);

        if lock_path.exists() {
            match Self::read_lock_info(project_root) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                        fs::remove_file(&lock_path).map_err(EngineError::storage)?;
                    } else {
                        return Err(EngineError::user(format!(
                            "another run holds the project lock (pid {} on {} since {})",
                            info.pid, info.hostname, info.acquired_at
                        )));
                    }
                }
                Err(_) => {
                    // Corrupt lock file: remove and take over.
                    fs::remove_file(&lock_path).map_err(EngineError::storage)?;
                }
            }
        }

        Self::acquire(project_root)
    }

    /// Stamp the lock with the run it now protects.
    pub fn set_run_id(&self, run_id: &str) -> Result<()> {
        Self::write_lock(&self.path, Some(run_id.to_string()))
    }

    pub fn is_locked(project_root: &Path) -> bool {
        project_root.join(LOCK_FILE).exists()
    }

    pub fn read_lock_info(project_root: &Path) -> Result<LockInfo> {
        let lock_path = project_root.join(LOCK_FILE);
        let content = fs::read_to_string(&lock_path).map_err(EngineError::storage)?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::Storage(format!("corrupt lock file: {e}")))
    }

    fn write_lock(lock_path: &Path, run_id: Option<String>) -> Result<()> {
        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            run_id,
        };
        let json = serde_json::to_string_pretty(&info)?;

        let tmp_path = lock_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path).map_err(EngineError::storage)?;
            file.write_all(json.as_bytes()).map_err(EngineError::storage)?;
            file.sync_all().ok();
        }
        fs::rename(&tmp_path, lock_path).map_err(EngineError::storage)?;
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
