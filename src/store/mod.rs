// =============================================================================
// Durable state store — advisory-locked JSON document with atomic rewrite
// =============================================================================
//
// Every mutation flows through `update(apply_fn)`: in-process mutex, advisory
// file lock (sidecar lockfile with a staleness timeout), read + parse, apply,
// write `.tmp`, fsync, rename over the document, unlock. A crash between lock
// and write leaves the previous document intact.
//
// Readers in other processes may read the on-disk file directly when stale
// data is acceptable.
// =============================================================================

pub mod model;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::RetentionConfig;
use model::{Order, TradingState};

/// Default staleness timeout for an abandoned lockfile.
const DEFAULT_LOCK_STALE: Duration = Duration::from_secs(30);
/// Poll interval while waiting on another process's lock.
const LOCK_POLL: Duration = Duration::from_millis(25);

pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_stale: Duration,
    retention: RetentionConfig,
    proc_lock: Mutex<()>,
}

/// Removes the lockfile when the guard drops, even on an apply panic.
struct FileLockGuard {
    lock_path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!(path = %self.lock_path.display(), error = %e, "failed to remove state lockfile");
        }
    }
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>, retention: RetentionConfig) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            lock_stale: DEFAULT_LOCK_STALE,
            retention,
            proc_lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn with_lock_stale(mut self, stale: Duration) -> Self {
        self.lock_stale = stale;
        self
    }

    // -------------------------------------------------------------------------
    // The apply-function contract
    // -------------------------------------------------------------------------

    /// Atomically mutate the document. Same-process callers serialize on the
    /// in-process mutex; other processes block on the file lock.
    pub fn update<F>(&self, apply_fn: F) -> Result<()>
    where
        F: FnOnce(&mut TradingState),
    {
        let _proc = self.proc_lock.lock();
        let _file = self.acquire_file_lock()?;

        let mut state = self.read_state()?;
        apply_fn(&mut state);

        if self.retention.keep_latest_only {
            prune(&mut state, &self.retention);
        }

        self.write_state(&state)
    }

    /// Deep read-only view of the current document.
    pub fn snapshot(&self) -> Result<TradingState> {
        let _proc = self.proc_lock.lock();
        self.read_state()
    }

    pub fn find_order_by_id(&self, id: &str) -> Result<Option<Order>> {
        Ok(self.snapshot()?.find_order(id).cloned())
    }

    pub fn get_open_orders(&self) -> Result<Vec<Order>> {
        Ok(self
            .snapshot()?
            .orders
            .into_iter()
            .filter(|o| o.state.is_open())
            .collect())
    }

    // -------------------------------------------------------------------------
    // File plumbing
    // -------------------------------------------------------------------------

    fn acquire_file_lock(&self) -> Result<FileLockGuard> {
        let deadline = Instant::now() + self.lock_stale * 2;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    // Payload is informational only (who holds the lock).
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(FileLockGuard {
                        lock_path: self.lock_path.clone(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        warn!(
                            path = %self.lock_path.display(),
                            "removing stale state lockfile"
                        );
                        let _ = std::fs::remove_file(&self.lock_path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        anyhow::bail!(
                            "timed out waiting for state lock {}",
                            self.lock_path.display()
                        );
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create lockfile {}", self.lock_path.display())
                    })
                }
            }
        }
    }

    fn lock_is_stale(&self) -> bool {
        std::fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > self.lock_stale)
    }

    fn read_state(&self) -> Result<TradingState> {
        if !self.path.exists() {
            return Ok(TradingState::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state file {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(TradingState::default());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse state file {}", self.path.display()))
    }

    fn write_state(&self, state: &TradingState) -> Result<()> {
        let content =
            serde_json::to_string_pretty(state).context("failed to serialise state")?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(content.as_bytes())
            .context("failed to write state tmp file")?;
        file.sync_all().context("failed to fsync state tmp file")?;
        drop(file);

        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename state into {}", self.path.display()))?;

        debug!(path = %self.path.display(), orders = state.orders.len(), "state written");
        Ok(())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    name.push_str(".lock");
    path.with_file_name(name)
}

/// Trim each collection to its retention cap, oldest entries first. Open
/// orders are always preserved.
fn prune(state: &mut TradingState, retention: &RetentionConfig) {
    // Closed orders: drop oldest beyond the cap; open orders never pruned.
    let closed_count = state.orders.iter().filter(|o| o.state.is_terminal()).count();
    if closed_count > retention.closed_orders {
        let mut to_drop = closed_count - retention.closed_orders;
        state.orders.retain(|o| {
            if to_drop > 0 && o.state.is_terminal() {
                to_drop -= 1;
                false
            } else {
                true
            }
        });
    }

    truncate_front(&mut state.order_events, retention.order_events);
    truncate_front(&mut state.fills, retention.fills);
    truncate_front(&mut state.strategy_runs, retention.strategy_runs);
    truncate_front(&mut state.balances_snapshots, retention.balances_snapshots);
    truncate_front(&mut state.risk_events, retention.risk_events);
    truncate_front(&mut state.system_health, retention.system_health);
    truncate_front(&mut state.agent_audit, retention.agent_audit);
}

fn truncate_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        items.drain(..items.len() - cap);
    }
}
