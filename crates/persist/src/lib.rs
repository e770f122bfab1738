//! Fleetcheck persistence: SQLite record of reconciliations done during a suite,
//! so the surrounding framework can restore or clean up afterwards.
//! Opened explicitly at suite start and closed at suite end.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fleetcheck_core::{Document, ResourceKind, ResourceRef};

/// One successful reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRecord {
    pub target: ResourceRef,
    /// Live object before the patch, when the reconciler fetched it.
    pub before: Option<Document>,
    pub after: Document,
    /// Milliseconds since epoch.
    pub ts: i64,
}

impl ReconcileRecord {
    pub fn now(target: ResourceRef, before: Option<Document>, after: Document) -> Self {
        Self { target, before, after, ts: now_ts() }
    }
}

pub trait Store {
    fn put(&self, rec: &ReconcileRecord) -> Result<()>;
    /// Newest first.
    fn history(&self, target: &ResourceRef, limit: Option<usize>) -> Result<Vec<ReconcileRecord>>;
    /// Every target touched, oldest touch first.
    fn targets(&self) -> Result<Vec<ResourceRef>>;
}

fn keep_per_target() -> usize {
    std::env::var("FLEET_STATE_KEEP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(3)
}

/// SQLite-backed store. Synchronous; scenario code is not latency sensitive here.
pub struct StateStore {
    path: String,
    db: Mutex<Option<rusqlite::Connection>>,
}

impl StateStore {
    /// Path from `FLEET_STATE_DB`, else `$HOME/.fleetcheck/state.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("FLEET_STATE_DB").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS reconciliations (
                kind      TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                ts        INTEGER NOT NULL,
                before    TEXT,
                after     TEXT NOT NULL
            )",
            [],
        )
        .context("creating reconciliations table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_reconciliations_target_ts ON reconciliations(kind, namespace, name, ts DESC)",
            [],
        )
        .ok();
        histogram!("state_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path, "state store opened");
        Ok(Self { path: path.to_string(), db: Mutex::new(Some(db)) })
    }

    pub fn path(&self) -> &str { &self.path }

    pub fn is_open(&self) -> bool { self.conn().map(|g| g.is_some()).unwrap_or(false) }

    /// Checkpoint the WAL and release the connection. Later calls fail.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn()?;
        let Some(db) = guard.take() else { return Ok(()) };
        db.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())).ok();
        db.close().map_err(|(_, e)| anyhow!(e)).context("closing state store")?;
        info!(path = %self.path, "state store closed");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Option<rusqlite::Connection>>> {
        self.db.lock().map_err(|_| anyhow!("state store lock poisoned"))
    }

    /// Drop history for one target once it has been restored.
    pub fn forget(&self, target: &ResourceRef) -> Result<usize> {
        let guard = self.conn()?;
        let db = guard.as_ref().ok_or_else(|| anyhow!("state store closed"))?;
        let n = db.execute(
            "DELETE FROM reconciliations WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            (target.kind.as_str(), namespace_key(target), &target.name),
        )?;
        debug!(target_ref = %target, rows = n, "state forgotten");
        Ok(n)
    }
}

fn namespace_key(target: &ResourceRef) -> &str {
    if target.kind.namespaced() { target.namespace.as_deref().unwrap_or("") } else { "" }
}

fn to_text(doc: &Document) -> Result<String> { serde_json::to_string(doc).context("encoding document") }

fn from_text(s: &str) -> Result<Document> { serde_json::from_str(s).context("decoding stored document") }

fn target_of(kind: &str, namespace: String, name: String) -> Result<ResourceRef> {
    let kind: ResourceKind = kind.parse().map_err(|e| anyhow!("{}", e))?;
    let namespace = if namespace.is_empty() { None } else { Some(namespace) };
    Ok(ResourceRef { kind, name, namespace })
}

impl Store for StateStore {
    fn put(&self, rec: &ReconcileRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let before = rec.before.as_ref().map(to_text).transpose()?;
        let after = to_text(&rec.after)?;
        let ns = namespace_key(&rec.target);
        let mut guard = self.conn()?;
        let db = guard.as_mut().ok_or_else(|| anyhow!("state store closed"))?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO reconciliations(kind, namespace, name, ts, before, after) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (rec.target.kind.as_str(), ns, &rec.target.name, rec.ts, before, after),
        )?;
        // Keep the newest N rows per target.
        tx.execute(
            "DELETE FROM reconciliations
             WHERE kind = ?1 AND namespace = ?2 AND name = ?3
               AND rowid NOT IN (
                   SELECT rowid FROM reconciliations
                   WHERE kind = ?1 AND namespace = ?2 AND name = ?3
                   ORDER BY ts DESC, rowid DESC LIMIT ?4
               )",
            (rec.target.kind.as_str(), ns, &rec.target.name, keep_per_target() as i64),
        )?;
        tx.commit()?;
        histogram!("state_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("state_put_total", 1u64);
        Ok(())
    }

    fn history(&self, target: &ResourceRef, limit: Option<usize>) -> Result<Vec<ReconcileRecord>> {
        let cap = limit.unwrap_or_else(keep_per_target);
        let guard = self.conn()?;
        let db = guard.as_ref().ok_or_else(|| anyhow!("state store closed"))?;
        let mut stmt = db.prepare(
            "SELECT ts, before, after FROM reconciliations
             WHERE kind = ?1 AND namespace = ?2 AND name = ?3
             ORDER BY ts DESC, rowid DESC LIMIT ?4",
        )?;
        let mut rows = stmt.query((target.kind.as_str(), namespace_key(target), &target.name, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let ts: i64 = row.get(0)?;
            let before: Option<String> = row.get(1)?;
            let after: String = row.get(2)?;
            out.push(ReconcileRecord {
                target: target.clone(),
                before: before.as_deref().map(from_text).transpose()?,
                after: from_text(&after)?,
                ts,
            });
        }
        Ok(out)
    }

    fn targets(&self) -> Result<Vec<ResourceRef>> {
        let guard = self.conn()?;
        let db = guard.as_ref().ok_or_else(|| anyhow!("state store closed"))?;
        let mut stmt = db.prepare(
            "SELECT kind, namespace, name FROM reconciliations GROUP BY kind, namespace, name ORDER BY MIN(ts), MIN(rowid)",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            out.push(target_of(&kind, row.get(1)?, row.get(2)?)?);
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".fleetcheck");
        let _ = std::fs::create_dir_all(&p);
        p.push("state.db");
        return p.to_string_lossy().to_string();
    }
    "fleetcheck-state.db".to_string()
}

pub fn now_ts() -> i64 { chrono::Utc::now().timestamp_millis() }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> String {
        std::env::temp_dir().join(format!("fleetcheck-test-{}.db", uuid::Uuid::new_v4())).to_string_lossy().to_string()
    }

    fn pod() -> ResourceRef { ResourceRef::namespaced(ResourceKind::Pod, "test-k8s-good-pod", "kube-system") }

    #[test]
    fn put_history_rotate() {
        let s = StateStore::open(&temp_db()).unwrap();
        for i in 0..5 {
            let rec = ReconcileRecord {
                target: pod(),
                before: Some(Document::from(json!({"rev": i}))),
                after: Document::from(json!({"rev": i + 1})),
                ts: i as i64,
            };
            s.put(&rec).unwrap();
        }
        let rows = s.history(&pod(), None).unwrap();
        assert_eq!(rows.iter().map(|r| r.ts).collect::<Vec<_>>(), vec![4, 3, 2]);
        assert_eq!(rows[0].after.to_json(), json!({"rev": 5}));
        assert_eq!(rows[0].before.as_ref().map(Document::to_json), Some(json!({"rev": 4})));
        assert_eq!(s.history(&pod(), Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn targets_and_forget() {
        let s = StateStore::open(&temp_db()).unwrap();
        let role = ResourceRef::cluster(ResourceKind::ClusterRole, "reader");
        s.put(&ReconcileRecord { target: pod(), before: None, after: Document::default(), ts: 1 }).unwrap();
        s.put(&ReconcileRecord { target: role.clone(), before: None, after: Document::default(), ts: 2 }).unwrap();
        assert_eq!(s.targets().unwrap(), vec![pod(), role.clone()]);
        assert_eq!(s.forget(&pod()).unwrap(), 1);
        assert_eq!(s.targets().unwrap(), vec![role]);
    }

    #[test]
    fn closed_store_rejects_calls() {
        let path = temp_db();
        let s = StateStore::open(&path).unwrap();
        s.put(&ReconcileRecord::now(pod(), None, Document::default())).unwrap();
        s.close().unwrap();
        assert!(!s.is_open());
        assert!(s.put(&ReconcileRecord::now(pod(), None, Document::default())).is_err());
        s.close().unwrap();
        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.history(&pod(), None).unwrap().len(), 1);
    }
}
