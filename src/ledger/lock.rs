//! File locking for shared on-disk state
//!
//! Guards the per-cluster ledger files and the cluster index against
//! concurrent processes. A lock is a sibling `<name>.lock` file created
//! with `O_EXCL`, holding the owner's PID and acquisition time.
//!
//! - Stale threshold: a lock older than 5 s is forcibly broken, once
//! - Acquisition retries with jittered backoff up to ~4 s total

use crate::error::{HarmoniaError, Result};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Locks older than this are considered abandoned
pub const STALE_THRESHOLD_MS: i64 = 5_000;

/// Give up acquisition after roughly this long
const ACQUIRE_BUDGET_MS: u64 = 4_000;

/// Base delay between acquisition attempts; jitter is added on top
const RETRY_BASE_MS: u64 = 100;

/// Held file lock; released on drop
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// Acquire the lock guarding `target`
    ///
    /// Retries with jittered backoff. A stale lock (older than
    /// [`STALE_THRESHOLD_MS`]) is broken exactly once per acquisition
    /// attempt sequence; if the lock is still contended afterwards the
    /// acquisition fails.
    pub async fn acquire(target: &Path) -> Result<Self> {
        let lock_path = Self::lock_path_for(target);
        let deadline = std::time::Instant::now() + Duration::from_millis(ACQUIRE_BUDGET_MS);
        let mut broke_stale = false;

        loop {
            match Self::try_create(&lock_path) {
                Ok(()) => {
                    debug!(lock = %lock_path.display(), "lock acquired");
                    return Ok(Self { lock_path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !broke_stale && Self::is_stale(&lock_path) {
                        warn!(lock = %lock_path.display(), "breaking stale lock");
                        let _ = std::fs::remove_file(&lock_path);
                        broke_stale = true;
                        continue;
                    }
                }
                Err(err) => return Err(HarmoniaError::Io(err)),
            }

            if std::time::Instant::now() >= deadline {
                return Err(HarmoniaError::Lock(format!(
                    "could not acquire {} within {}ms",
                    lock_path.display(),
                    ACQUIRE_BUDGET_MS
                )));
            }

            let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_MS);
            tokio::time::sleep(Duration::from_millis(RETRY_BASE_MS + jitter)).await;
        }
    }

    /// Lock file path guarding `target`
    fn lock_path_for(target: &Path) -> PathBuf {
        let mut os = target.as_os_str().to_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    fn try_create(lock_path: &Path) -> std::io::Result<()> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = format!(
            "{}\n{}\n",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        );
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        use std::io::Write;
        let mut file = opts.open(lock_path)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Whether the lock file's recorded acquisition time is past the
    /// stale threshold
    fn is_stale(lock_path: &Path) -> bool {
        let Ok(body) = std::fs::read_to_string(lock_path) else {
            // Unreadable lock file: racing owner released it
            return false;
        };
        let Some(acquired_ms) = body.lines().nth(1).and_then(|l| l.trim().parse::<i64>().ok())
        else {
            // Malformed body counts as stale; a healthy owner rewrites it
            return true;
        };
        chrono::Utc::now().timestamp_millis() - acquired_ms > STALE_THRESHOLD_MS
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.lock_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(lock = %self.lock_path.display(), "failed to release lock: {err}");
            }
        }
    }
}
