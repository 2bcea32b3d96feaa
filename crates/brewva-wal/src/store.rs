//! The turn WAL store.

use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use brewva_core::{TurnEnvelope, now_ms};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const LOG_FILE: &str = "turns.jsonl";

/// WAL errors. Only genuine IO/serialization failures surface; a disabled
/// WAL is a silent no-op.
#[derive(Debug, Error)]
pub enum WalError {
    /// Filesystem failure.
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized.
    #[error("wal serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// State progression of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalState {
    /// Accepted, not yet dispatched.
    Pending,
    /// Dispatch started.
    Inflight,
    /// Fully processed.
    Done,
    /// Dispatch failed.
    Failed,
}

impl WalState {
    /// Terminal states are never replayed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Inflight => 1,
            Self::Done | Self::Failed => 2,
        }
    }
}

/// One folded WAL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalRecord {
    /// Time-prefixed unique id.
    pub wal_id: String,
    /// WAL scope, e.g. `channel-telegram`.
    pub scope: String,
    /// Provider-derived idempotency key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// The accepted turn.
    pub envelope: TurnEnvelope,
    /// Current state.
    pub state: WalState,
    /// Error string from the last failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Millisecond epoch of acceptance.
    pub created_at: i64,
    /// Millisecond epoch of the last transition.
    pub updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WalLine {
    Append {
        record: WalRecord,
    },
    Mark {
        wal_id: String,
        state: WalState,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
        at: i64,
    },
}

/// Result of [`TurnWal::append_pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The record id; `None` when the WAL is disabled.
    pub wal_id: Option<String>,
    /// True when an existing record was returned instead of appending.
    pub deduped: bool,
}

struct WalInner {
    file: Option<std::fs::File>,
    records: BTreeMap<String, WalRecord>,
    by_dedupe: HashMap<String, String>,
    seq: u32,
}

/// Append-only turn log for one scope.
pub struct TurnWal {
    path: PathBuf,
    scope: String,
    enabled: bool,
    inner: Mutex<WalInner>,
}

impl TurnWal {
    /// Open (or create) the WAL for `scope` under `wal_root`, replaying any
    /// existing log into memory.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory or log file cannot be opened.
    pub fn open(wal_root: &Path, scope: &str) -> Result<Self, WalError> {
        let dir = wal_root.join(scope);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);

        let (records, by_dedupe) = replay(&path);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        debug!(scope, records = records.len(), "turn wal opened");
        Ok(Self {
            path,
            scope: scope.to_string(),
            enabled: true,
            inner: Mutex::new(WalInner {
                file: Some(file),
                records,
                by_dedupe,
                seq: 0,
            }),
        })
    }

    /// A WAL that accepts every call and records nothing.
    #[must_use]
    pub fn disabled(scope: &str) -> Self {
        Self {
            path: PathBuf::new(),
            scope: scope.to_string(),
            enabled: false,
            inner: Mutex::new(WalInner {
                file: None,
                records: BTreeMap::new(),
                by_dedupe: HashMap::new(),
                seq: 0,
            }),
        }
    }

    /// Whether this WAL persists anything.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append a pending record.
    ///
    /// Idempotency: when `dedupe_key` already belongs to a `done` record the
    /// existing id is returned without writing. Pending and inflight
    /// duplicates are also suppressed; a `failed` record does not block a
    /// fresh append (retry).
    ///
    /// # Errors
    ///
    /// Returns an error when the append cannot be written; callers surface
    /// this as a failed dispatch.
    pub async fn append_pending(
        &self,
        envelope: &TurnEnvelope,
        dedupe_key: Option<&str>,
    ) -> Result<AppendOutcome, WalError> {
        if !self.enabled {
            return Ok(AppendOutcome {
                wal_id: None,
                deduped: false,
            });
        }

        let mut inner = self.inner.lock().await;
        if let Some(key) = dedupe_key
            && let Some(existing_id) = inner.by_dedupe.get(key)
            && let Some(existing) = inner.records.get(existing_id)
            && existing.state != WalState::Failed
        {
            return Ok(AppendOutcome {
                wal_id: Some(existing_id.clone()),
                deduped: true,
            });
        }

        let now = now_ms();
        inner.seq = inner.seq.wrapping_add(1);
        let wal_id = format!("{now:012x}-{:04x}-{:08x}", inner.seq, rand::random::<u32>());
        let record = WalRecord {
            wal_id: wal_id.clone(),
            scope: self.scope.clone(),
            dedupe_key: dedupe_key.map(str::to_string),
            envelope: envelope.clone(),
            state: WalState::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        write_line(
            &mut inner,
            &WalLine::Append {
                record: record.clone(),
            },
        )?;
        if let Some(key) = dedupe_key {
            inner.by_dedupe.insert(key.to_string(), wal_id.clone());
        }
        inner.records.insert(wal_id.clone(), record);
        Ok(AppendOutcome {
            wal_id: Some(wal_id),
            deduped: false,
        })
    }

    /// Mark a record inflight. Best-effort and idempotent.
    pub async fn mark_inflight(&self, wal_id: &str) {
        if let Err(e) = self.mark(wal_id, WalState::Inflight, None).await {
            warn!(wal_id, error = %e, "failed to mark wal record inflight");
        }
    }

    /// Mark a record done.
    ///
    /// # Errors
    ///
    /// Returns an error when the mark cannot be written.
    pub async fn mark_done(&self, wal_id: &str) -> Result<(), WalError> {
        self.mark(wal_id, WalState::Done, None).await
    }

    /// Mark a record failed with an error string.
    ///
    /// # Errors
    ///
    /// Returns an error when the mark cannot be written.
    pub async fn mark_failed(&self, wal_id: &str, error: &str) -> Result<(), WalError> {
        self.mark(wal_id, WalState::Failed, Some(error.to_string()))
            .await
    }

    async fn mark(
        &self,
        wal_id: &str,
        state: WalState,
        last_error: Option<String>,
    ) -> Result<(), WalError> {
        if !self.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.records.get(wal_id) else {
            warn!(wal_id, "mark for unknown wal record ignored");
            return Ok(());
        };
        // Monotonic progression: never regress, re-marking is idempotent.
        if current.state == state || current.state.rank() > state.rank() || current.state.is_terminal() {
            return Ok(());
        }

        let at = now_ms();
        write_line(
            &mut inner,
            &WalLine::Mark {
                wal_id: wal_id.to_string(),
                state,
                last_error: last_error.clone(),
                at,
            },
        )?;
        if let Some(record) = inner.records.get_mut(wal_id) {
            record.state = state;
            record.updated_at = at;
            if last_error.is_some() {
                record.last_error = last_error;
            }
        }
        Ok(())
    }

    /// All non-terminal records in acceptance order, for startup recovery.
    pub async fn non_terminal_records(&self) -> Vec<WalRecord> {
        let inner = self.inner.lock().await;
        let mut records: Vec<WalRecord> = inner
            .records
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.wal_id.cmp(&b.wal_id)));
        records
    }

    /// Current state of a record, mainly for tests and diagnostics.
    pub async fn record_state(&self, wal_id: &str) -> Option<WalState> {
        let inner = self.inner.lock().await;
        inner.records.get(wal_id).map(|r| r.state)
    }

    /// Drop terminal records whose last transition is older than
    /// `older_than_ms`, rewriting the log. Returns the number dropped.
    ///
    /// # Errors
    ///
    /// Returns an error when the rewritten log cannot be persisted; the
    /// previous log stays in place in that case.
    pub async fn compact(&self, older_than_ms: i64) -> Result<usize, WalError> {
        if !self.enabled {
            return Ok(0);
        }
        let cutoff = now_ms().saturating_sub(older_than_ms);

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let before = inner.records.len();
        inner
            .records
            .retain(|_, r| !(r.state.is_terminal() && r.updated_at <= cutoff));
        let dropped = before.saturating_sub(inner.records.len());

        let records = &inner.records;
        inner.by_dedupe.retain(|_, id| records.contains_key(id));

        // Rewrite as full records only; folded state needs no mark lines.
        let mut buffer = Vec::new();
        for record in inner.records.values() {
            serde_json::to_writer(
                &mut buffer,
                &WalLine::Append {
                    record: record.clone(),
                },
            )?;
            buffer.push(b'\n');
        }
        brewva_core::fsutil::write_atomic(&self.path, &buffer)?;
        inner.file = Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?,
        );
        debug!(scope = %self.scope, dropped, "wal compacted");
        Ok(dropped)
    }
}

fn write_line(inner: &mut WalInner, line: &WalLine) -> Result<(), WalError> {
    let Some(file) = inner.file.as_mut() else {
        return Ok(());
    };
    let mut bytes = serde_json::to_vec(line)?;
    bytes.push(b'\n');
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(())
}

/// Fold an existing log into records + dedupe index. Unparseable lines are
/// skipped with a warning so one torn tail line cannot poison recovery.
fn replay(path: &Path) -> (BTreeMap<String, WalRecord>, HashMap<String, String>) {
    let mut records = BTreeMap::new();
    let mut by_dedupe = HashMap::new();

    let Ok(raw) = std::fs::read_to_string(path) else {
        return (records, by_dedupe);
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<WalLine>(line) {
            Ok(WalLine::Append { record }) => {
                if let Some(key) = record.dedupe_key.clone() {
                    by_dedupe.insert(key, record.wal_id.clone());
                }
                records.insert(record.wal_id.clone(), record);
            },
            Ok(WalLine::Mark {
                wal_id,
                state,
                last_error,
                at,
            }) => {
                if let Some(record) = records.get_mut(&wal_id) {
                    if record.state.rank() <= state.rank() && !record.state.is_terminal() {
                        record.state = state;
                        record.updated_at = at;
                        if last_error.is_some() {
                            record.last_error = last_error;
                        }
                    }
                } else {
                    warn!(wal_id, "wal mark without append, skipped");
                }
            },
            Err(e) => {
                warn!(error = %e, "skipping unparseable wal line");
            },
        }
    }
    (records, by_dedupe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brewva_core::{TurnKind, TurnPart};

    fn envelope(turn_id: &str) -> TurnEnvelope {
        TurnEnvelope::new(
            TurnKind::User,
            "tg:123",
            turn_id,
            "telegram",
            "123",
            1_700_000_000_000,
            vec![TurnPart::text("hi")],
        )
    }

    async fn open(dir: &Path) -> TurnWal {
        TurnWal::open(dir, "channel-telegram").unwrap()
    }

    #[tokio::test]
    async fn append_then_mark_done() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path()).await;

        let outcome = wal
            .append_pending(&envelope("t1"), Some("telegram:t1"))
            .await
            .unwrap();
        let wal_id = outcome.wal_id.unwrap();
        assert!(!outcome.deduped);

        wal.mark_inflight(&wal_id).await;
        assert_eq!(wal.record_state(&wal_id).await, Some(WalState::Inflight));
        wal.mark_done(&wal_id).await.unwrap();
        assert_eq!(wal.record_state(&wal_id).await, Some(WalState::Done));
    }

    #[tokio::test]
    async fn done_dedupe_returns_existing_id() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path()).await;

        let first = wal
            .append_pending(&envelope("t1"), Some("telegram:t1"))
            .await
            .unwrap();
        let id = first.wal_id.unwrap();
        wal.mark_done(&id).await.unwrap();

        let second = wal
            .append_pending(&envelope("t1"), Some("telegram:t1"))
            .await
            .unwrap();
        assert!(second.deduped);
        assert_eq!(second.wal_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn failed_record_allows_retry_append() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path()).await;

        let first = wal
            .append_pending(&envelope("t1"), Some("telegram:t1"))
            .await
            .unwrap();
        wal.mark_failed(&first.wal_id.clone().unwrap(), "boom")
            .await
            .unwrap();

        let second = wal
            .append_pending(&envelope("t1"), Some("telegram:t1"))
            .await
            .unwrap();
        assert!(!second.deduped);
        assert_ne!(second.wal_id, first.wal_id);
    }

    #[tokio::test]
    async fn terminal_state_does_not_regress() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path()).await;

        let id = wal
            .append_pending(&envelope("t1"), None)
            .await
            .unwrap()
            .wal_id
            .unwrap();
        wal.mark_done(&id).await.unwrap();
        wal.mark_inflight(&id).await;
        wal.mark_failed(&id, "late").await.unwrap();
        assert_eq!(wal.record_state(&id).await, Some(WalState::Done));
    }

    #[tokio::test]
    async fn replay_folds_marks_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (done_id, inflight_id) = {
            let wal = open(dir.path()).await;
            let done_id = wal
                .append_pending(&envelope("t1"), Some("k1"))
                .await
                .unwrap()
                .wal_id
                .unwrap();
            wal.mark_done(&done_id).await.unwrap();
            let inflight_id = wal
                .append_pending(&envelope("t2"), Some("k2"))
                .await
                .unwrap()
                .wal_id
                .unwrap();
            wal.mark_inflight(&inflight_id).await;
            (done_id, inflight_id)
        };

        let wal = open(dir.path()).await;
        assert_eq!(wal.record_state(&done_id).await, Some(WalState::Done));
        assert_eq!(wal.record_state(&inflight_id).await, Some(WalState::Inflight));

        let pending = wal.non_terminal_records().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].wal_id, inflight_id);
    }

    #[tokio::test]
    async fn recovery_order_is_acceptance_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path()).await;
        let a = wal.append_pending(&envelope("a"), None).await.unwrap();
        let b = wal.append_pending(&envelope("b"), None).await.unwrap();

        let pending = wal.non_terminal_records().await;
        assert_eq!(pending[0].wal_id, a.wal_id.unwrap());
        assert_eq!(pending[1].wal_id, b.wal_id.unwrap());
    }

    #[tokio::test]
    async fn compaction_drops_old_terminal_records() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path()).await;

        let done = wal
            .append_pending(&envelope("t1"), Some("k1"))
            .await
            .unwrap()
            .wal_id
            .unwrap();
        wal.mark_done(&done).await.unwrap();
        let pending = wal
            .append_pending(&envelope("t2"), Some("k2"))
            .await
            .unwrap()
            .wal_id
            .unwrap();

        // Window 0: every terminal record is older than "now".
        let dropped = wal.compact(0).await.unwrap();
        assert_eq!(dropped, 1);
        assert!(wal.record_state(&done).await.is_none());
        assert_eq!(wal.record_state(&pending).await, Some(WalState::Pending));

        // The dropped dedupe key is free again.
        let again = wal
            .append_pending(&envelope("t1"), Some("k1"))
            .await
            .unwrap();
        assert!(!again.deduped);
    }

    #[tokio::test]
    async fn compaction_keeps_recent_terminal_records() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path()).await;
        let done = wal
            .append_pending(&envelope("t1"), None)
            .await
            .unwrap()
            .wal_id
            .unwrap();
        wal.mark_done(&done).await.unwrap();

        let dropped = wal.compact(3_600_000).await.unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(wal.record_state(&done).await, Some(WalState::Done));
    }

    #[tokio::test]
    async fn disabled_wal_is_a_no_op() {
        let wal = TurnWal::disabled("channel-telegram");
        let outcome = wal
            .append_pending(&envelope("t1"), Some("k"))
            .await
            .unwrap();
        assert_eq!(outcome.wal_id, None);
        assert!(wal.non_terminal_records().await.is_empty());
        assert_eq!(wal.compact(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn torn_tail_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let wal = open(dir.path()).await;
            wal.append_pending(&envelope("t1"), None)
                .await
                .unwrap()
                .wal_id
                .unwrap()
        };
        // Simulate a crash mid-append.
        let path = dir.path().join("channel-telegram").join(LOG_FILE);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"op\":\"mark\",\"walId\":\"");
        std::fs::write(&path, raw).unwrap();

        let wal = open(dir.path()).await;
        assert_eq!(wal.record_state(&id).await, Some(WalState::Pending));
    }
}
