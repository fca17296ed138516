use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

use crate::{EventType, Record, RecordStore, StoreError, StoreResult, WatchEventRecord};

/// Events kept in the log before the oldest are pruned.
pub const DEFAULT_EVENT_RETENTION: usize = 10_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bundledeployments (
    namespace          TEXT NOT NULL,
    name               TEXT NOT NULL,
    resource_version   INTEGER NOT NULL,
    uid                TEXT NOT NULL,
    creation_timestamp INTEGER NOT NULL,
    deletion_timestamp INTEGER,
    generation         INTEGER NOT NULL,
    labels             TEXT,
    annotations        TEXT,
    finalizers         TEXT,
    owner_references   TEXT,
    spec               TEXT NOT NULL,
    status             TEXT,
    PRIMARY KEY (namespace, name)
);
CREATE INDEX IF NOT EXISTS idx_resource_version ON bundledeployments(resource_version);
CREATE INDEX IF NOT EXISTS idx_labels ON bundledeployments(labels);
CREATE INDEX IF NOT EXISTS idx_deletion_timestamp ON bundledeployments(deletion_timestamp);

CREATE TABLE IF NOT EXISTS watch_events (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_version INTEGER NOT NULL,
    event_type       TEXT NOT NULL,
    namespace        TEXT NOT NULL,
    name             TEXT NOT NULL,
    timestamp        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_watch_rv ON watch_events(resource_version);
CREATE INDEX IF NOT EXISTS idx_watch_timestamp ON watch_events(timestamp);

CREATE TABLE IF NOT EXISTS resource_version (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    current_version INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO resource_version (id, current_version) VALUES (1, 0);
";

const SELECT_COLUMNS: &str = "SELECT namespace, name, resource_version, uid, creation_timestamp, \
     deletion_timestamp, generation, labels, annotations, finalizers, owner_references, spec, status \
     FROM bundledeployments";

/// SQLite-backed store over a single connection.
///
/// Lock order is `writer` then `db`. The writer lock is held from the counter
/// bump until the transaction commits, so versions are published in order.
pub struct SqliteStore {
    db: Mutex<Connection>,
    writer: Mutex<i64>,
    published: AtomicI64,
    retention: usize,
}

impl SqliteStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let started = Instant::now();
        let db = Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        info!(path, rv = me.current_resource_version(), "opened store");
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> StoreResult<Self> {
        db.execute_batch(SCHEMA)?;
        let rv: i64 =
            db.query_row("SELECT current_version FROM resource_version WHERE id = 1", [], |r| r.get(0))?;
        Ok(Self {
            db: Mutex::new(db),
            writer: Mutex::new(rv),
            published: AtomicI64::new(rv),
            retention: DEFAULT_EVENT_RETENTION,
        })
    }

    /// Keep at most `retention` events (minimum 1).
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn event_count(&self) -> StoreResult<u64> {
        let db = self.conn();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM watch_events", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn ping(&self) -> StoreResult<()> {
        let db = self.conn();
        db.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one write: bump the counter, apply `f`, append the event, prune,
    /// commit, then publish the new version.
    fn write<T>(
        &self,
        event: EventType,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&Transaction<'_>, i64) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let started = Instant::now();
        let mut last = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut db = self.conn();
        let tx = db.transaction()?;
        let rv = bump_version(&tx)?;
        let out = f(&tx, rv)?;
        tx.execute(
            "INSERT INTO watch_events (resource_version, event_type, namespace, name, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rv, event.as_str(), namespace, name, now_ts()],
        )?;
        let pruned = tx.execute(
            "DELETE FROM watch_events WHERE id <= (
                 SELECT id FROM watch_events ORDER BY id DESC LIMIT 1 OFFSET ?1
             )",
            [self.retention as i64],
        )?;
        tx.commit()?;
        *last = rv;
        self.published.store(rv, Ordering::Release);
        debug!(rv, %event, namespace, name, pruned, "write committed");
        histogram!("persist_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_write_total", 1u64, "event" => event.as_str());
        if pruned > 0 {
            counter!("persist_events_pruned_total", pruned as u64);
        }
        Ok(out)
    }
}

impl RecordStore for SqliteStore {
    fn next_resource_version(&self) -> StoreResult<i64> {
        let mut last = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut db = self.conn();
        let tx = db.transaction()?;
        let rv = bump_version(&tx)?;
        tx.commit()?;
        *last = rv;
        self.published.store(rv, Ordering::Release);
        Ok(rv)
    }

    fn current_resource_version(&self) -> i64 {
        self.published.load(Ordering::Acquire)
    }

    fn get(&self, namespace: &str, name: &str) -> StoreResult<Record> {
        let started = Instant::now();
        let db = self.conn();
        let rec = db
            .query_row(&format!("{SELECT_COLUMNS} WHERE namespace = ?1 AND name = ?2"), [namespace, name], row_to_record)
            .optional()?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        rec.ok_or_else(|| StoreError::not_found(namespace, name))
    }

    fn list(&self, namespace: Option<&str>) -> StoreResult<(Vec<Record>, i64)> {
        let started = Instant::now();
        let db = self.conn();
        let rows = match namespace {
            Some(ns) => {
                let mut stmt = db.prepare(&format!("{SELECT_COLUMNS} WHERE namespace = ?1 ORDER BY namespace, name"))?;
                let rows = stmt.query_map([ns], row_to_record)?.collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = db.prepare(&format!("{SELECT_COLUMNS} ORDER BY namespace, name"))?;
                let rows = stmt.query_map([], row_to_record)?.collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        let rv: i64 = db.query_row("SELECT current_version FROM resource_version WHERE id = 1", [], |r| r.get(0))?;
        histogram!("persist_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok((rows, rv))
    }

    fn create(&self, mut record: Record) -> StoreResult<Record> {
        let (ns, name) = (record.namespace.clone(), record.name.clone());
        self.write(EventType::Added, &ns, &name, |tx, rv| {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM bundledeployments WHERE namespace = ?1 AND name = ?2",
                    [&ns, &name],
                    |r| r.get::<_, i64>(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::AlreadyExists { namespace: ns.clone(), name: name.clone() });
            }
            record.resource_version = rv;
            tx.execute(
                "INSERT INTO bundledeployments
                   (namespace, name, resource_version, uid, creation_timestamp, deletion_timestamp, generation,
                    labels, annotations, finalizers, owner_references, spec, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.namespace,
                    record.name,
                    record.resource_version,
                    record.uid,
                    record.creation_timestamp,
                    record.deletion_timestamp,
                    record.generation,
                    record.labels,
                    record.annotations,
                    record.finalizers,
                    record.owner_references,
                    record.spec,
                    record.status,
                ],
            )?;
            Ok(record)
        })
    }

    fn update(&self, mut record: Record, expected_rv: Option<i64>) -> StoreResult<Record> {
        let (ns, name) = (record.namespace.clone(), record.name.clone());
        self.write(EventType::Modified, &ns, &name, |tx, rv| {
            let stored: Option<i64> = tx
                .query_row(
                    "SELECT resource_version FROM bundledeployments WHERE namespace = ?1 AND name = ?2",
                    [&ns, &name],
                    |r| r.get(0),
                )
                .optional()?;
            let stored = stored.ok_or_else(|| StoreError::not_found(&ns, &name))?;
            if let Some(expected) = expected_rv {
                if expected != stored {
                    return Err(StoreError::Conflict {
                        namespace: ns.clone(),
                        name: name.clone(),
                        expected,
                        actual: stored,
                    });
                }
            }
            record.resource_version = rv;
            tx.execute(
                "UPDATE bundledeployments SET
                   resource_version = ?3, uid = ?4, creation_timestamp = ?5, deletion_timestamp = ?6,
                   generation = ?7, labels = ?8, annotations = ?9, finalizers = ?10,
                   owner_references = ?11, spec = ?12, status = ?13
                 WHERE namespace = ?1 AND name = ?2",
                params![
                    record.namespace,
                    record.name,
                    record.resource_version,
                    record.uid,
                    record.creation_timestamp,
                    record.deletion_timestamp,
                    record.generation,
                    record.labels,
                    record.annotations,
                    record.finalizers,
                    record.owner_references,
                    record.spec,
                    record.status,
                ],
            )?;
            Ok(record)
        })
    }

    fn delete(&self, namespace: &str, name: &str) -> StoreResult<Record> {
        self.write(EventType::Deleted, namespace, name, |tx, rv| {
            let mut record = tx
                .query_row(&format!("{SELECT_COLUMNS} WHERE namespace = ?1 AND name = ?2"), [namespace, name], row_to_record)
                .optional()?
                .ok_or_else(|| StoreError::not_found(namespace, name))?;
            tx.execute("DELETE FROM bundledeployments WHERE namespace = ?1 AND name = ?2", [namespace, name])?;
            record.resource_version = rv;
            Ok(record)
        })
    }

    fn events_since(&self, rv: i64, namespace: Option<&str>, limit: usize) -> StoreResult<Vec<WatchEventRecord>> {
        let db = self.conn();
        let sql = "SELECT id, resource_version, event_type, namespace, name, timestamp FROM watch_events
                   WHERE resource_version > ?1 AND (?2 IS NULL OR namespace = ?2)
                   ORDER BY resource_version ASC LIMIT ?3";
        let mut stmt = db.prepare(sql)?;
        let raw = stmt
            .query_map(params![rv, namespace, limit as i64], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(id, resource_version, event_type, namespace, name, timestamp)| {
                Ok(WatchEventRecord { id, resource_version, event_type: event_type.parse()?, namespace, name, timestamp })
            })
            .collect()
    }

    fn oldest_event_version(&self) -> StoreResult<Option<i64>> {
        let db = self.conn();
        let v: Option<i64> = db.query_row("SELECT MIN(resource_version) FROM watch_events", [], |r| r.get(0))?;
        Ok(v)
    }
}

fn bump_version(tx: &Transaction<'_>) -> StoreResult<i64> {
    tx.execute("UPDATE resource_version SET current_version = current_version + 1 WHERE id = 1", [])?;
    let rv = tx.query_row("SELECT current_version FROM resource_version WHERE id = 1", [], |r| r.get(0))?;
    Ok(rv)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        namespace: row.get(0)?,
        name: row.get(1)?,
        resource_version: row.get(2)?,
        uid: row.get(3)?,
        creation_timestamp: row.get(4)?,
        deletion_timestamp: row.get(5)?,
        generation: row.get(6)?,
        labels: row.get(7)?,
        annotations: row.get(8)?,
        finalizers: row.get(9)?,
        owner_references: row.get(10)?,
        spec: row.get(11)?,
        status: row.get(12)?,
    })
}

/// `$HOME/.flotilla/flotilla.db`, or `flotilla.db` in the working directory.
pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".flotilla");
        let _ = std::fs::create_dir_all(&p);
        p.push("flotilla.db");
        return p.to_string_lossy().to_string();
    }
    "flotilla.db".to_string()
}

pub(crate) fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "flotilla-test-{}.db",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    fn record(ns: &str, name: &str) -> Record {
        Record {
            namespace: ns.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            creation_timestamp: 1_700_000_000,
            generation: 1,
            labels: Some(r#"{"env":"prod"}"#.to_string()),
            spec: r#"{"deploymentID":"abc"}"#.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn versions_are_strictly_increasing() {
        let s = SqliteStore::open_in_memory().unwrap();
        assert_eq!(s.current_resource_version(), 0);
        let a = s.create(record("ns1", "a")).unwrap();
        assert_eq!(a.resource_version, 1);
        let b = s.create(record("ns1", "b")).unwrap();
        let a2 = s.update(record("ns1", "a"), None).unwrap();
        let d = s.delete("ns1", "b").unwrap();
        let burned = s.next_resource_version().unwrap();
        let seq = [a.resource_version, b.resource_version, a2.resource_version, d.resource_version, burned];
        assert_eq!(seq, [1, 2, 3, 4, 5]);
        assert_eq!(s.current_resource_version(), 5);
    }

    #[test]
    fn each_write_appends_one_event() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.create(record("ns1", "a")).unwrap();
        s.update(record("ns1", "a"), None).unwrap();
        s.delete("ns1", "a").unwrap();
        let evs = s.events_since(0, None, 100).unwrap();
        let kinds: Vec<_> = evs.iter().map(|e| (e.resource_version, e.event_type)).collect();
        assert_eq!(kinds, vec![(1, EventType::Added), (2, EventType::Modified), (3, EventType::Deleted)]);
        assert_eq!(s.events_since(2, None, 100).unwrap().len(), 1);
        assert!(s.events_since(0, Some("other"), 100).unwrap().is_empty());
    }

    #[test]
    fn failed_write_does_not_consume_a_version() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.create(record("ns1", "a")).unwrap();
        let err = s.create(record("ns1", "a")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        let err = s.update(record("ns1", "missing"), None).unwrap_err();
        assert!(err.is_not_found());
        assert!(s.delete("ns1", "missing").unwrap_err().is_not_found());
        assert_eq!(s.current_resource_version(), 1);
        assert_eq!(s.event_count().unwrap(), 1);
        assert_eq!(s.create(record("ns1", "b")).unwrap().resource_version, 2);
    }

    #[test]
    fn update_with_expected_version_detects_conflict() {
        let s = SqliteStore::open_in_memory().unwrap();
        let a = s.create(record("ns1", "a")).unwrap();
        let err = s.update(record("ns1", "a"), Some(a.resource_version + 7)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 8, actual: 1, .. }));
        let ok = s.update(record("ns1", "a"), Some(a.resource_version)).unwrap();
        assert_eq!(ok.resource_version, 2);
    }

    #[test]
    fn list_filters_namespace_and_reports_counter() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.create(record("ns1", "a")).unwrap();
        s.create(record("ns2", "b")).unwrap();
        s.next_resource_version().unwrap();
        let (all, rv) = s.list(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(rv, 3);
        let (one, _) = s.list(Some("ns2")).unwrap();
        assert_eq!(one.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn retention_prunes_oldest_events() {
        let s = SqliteStore::open_in_memory().unwrap().with_retention(3);
        for i in 0..6 {
            s.create(record("ns1", &format!("o{i}"))).unwrap();
        }
        assert_eq!(s.event_count().unwrap(), 3);
        assert_eq!(s.oldest_event_version().unwrap(), Some(4));
    }

    #[test]
    fn counter_survives_reopen() {
        let path = temp_db();
        {
            let s = SqliteStore::open(&path).unwrap();
            s.create(record("ns1", "a")).unwrap();
            s.create(record("ns1", "b")).unwrap();
            s.ping().unwrap();
        }
        let s = SqliteStore::open(&path).unwrap();
        assert_eq!(s.current_resource_version(), 2);
        assert_eq!(s.create(record("ns1", "c")).unwrap().resource_version, 3);
        let got = s.get("ns1", "a").unwrap();
        assert_eq!(got.spec, r#"{"deploymentID":"abc"}"#);
        assert_eq!(got.labels.as_deref(), Some(r#"{"env":"prod"}"#));
    }
}
