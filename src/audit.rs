// =============================================================================
// HTTP request audit — one event per request, JSONL sink with size rotation
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One audit record per HTTP request attempt made by the exchange client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAuditEvent {
    pub ts: String,
    pub method: String,
    pub path: String,
    pub requires_auth: bool,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub ok: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sink the exchange client publishes audit events to.
pub type AuditSink = Arc<dyn Fn(RequestAuditEvent) + Send + Sync>;

/// Append-only JSONL audit log. When the file grows past `max_bytes` the
/// oldest `prune_ratio` fraction of lines is dropped in one atomic rewrite.
pub struct JsonlAuditLog {
    path: PathBuf,
    max_bytes: u64,
    prune_ratio: f64,
    guard: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl AsRef<Path>, max_bytes: u64, prune_ratio: f64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes,
            prune_ratio: prune_ratio.clamp(0.05, 0.95),
            guard: Mutex::new(()),
        }
    }

    /// Append one event as a single JSON line, rotating first if needed.
    pub fn append(&self, event: &RequestAuditEvent) -> Result<()> {
        let _held = self.guard.lock();

        self.rotate_if_needed()?;

        let line = serde_json::to_string(event).context("failed to serialise audit event")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        writeln!(file, "{line}").context("failed to append audit line")?;
        Ok(())
    }

    /// Build a sink closure over this log. Append failures are logged, never
    /// propagated into the request path.
    pub fn sink(self: Arc<Self>) -> AuditSink {
        Arc::new(move |event: RequestAuditEvent| {
            if let Err(e) = self.append(&event) {
                warn!(error = %e, "failed to write request audit event");
            }
        })
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size <= self.max_bytes {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read audit log {}", self.path.display()))?;
        let lines: Vec<&str> = content.lines().collect();
        let drop = ((lines.len() as f64) * self.prune_ratio).ceil() as usize;
        let kept = &lines[drop.min(lines.len())..];

        let tmp = self.path.with_extension("jsonl.tmp");
        let mut body = kept.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(&tmp, body).context("failed to write pruned audit log")?;
        std::fs::rename(&tmp, &self.path).context("failed to rename pruned audit log")?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(attempt: u32) -> RequestAuditEvent {
        RequestAuditEvent {
            ts: "2026-01-01T00:00:00Z".to_string(),
            method: "GET".to_string(),
            path: "/v1/accounts".to_string(),
            requires_auth: true,
            attempt,
            status: Some(200),
            ok: true,
            duration_ms: 12,
            retryable: None,
            error: None,
        }
    }

    #[test]
    fn append_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::new(dir.path().join("audit.jsonl"), 1024 * 1024, 0.5);

        log.append(&sample_event(1)).unwrap();
        log.append(&sample_event(2)).unwrap();

        let content = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: RequestAuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.attempt, 2);
        assert_eq!(parsed.path, "/v1/accounts");
    }

    #[test]
    fn rotation_drops_oldest_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        // Tiny cap so a handful of events force rotation.
        let log = JsonlAuditLog::new(&path, 200, 0.5);

        for i in 0..20 {
            log.append(&sample_event(i)).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines.len() < 20, "rotation never happened");

        // Newest event survives.
        let last: RequestAuditEvent = serde_json::from_str(lines.last().unwrap()).unwrap();
        assert_eq!(last.attempt, 19);
    }
}
