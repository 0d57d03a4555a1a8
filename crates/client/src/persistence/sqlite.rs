use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::info;

use super::DurableStore;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE replica_updates (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id      TEXT NOT NULL,
    payload     BLOB NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX replica_updates_doc_idx
    ON replica_updates (doc_id, id);
"#;

const MIGRATION_V2_SQL: &str = r#"
CREATE TABLE replica_compactions (
    doc_id          TEXT PRIMARY KEY,
    compacted_at    TEXT NOT NULL,
    merged_updates  INTEGER NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// Append-only update log per document, backed by a local SQLite file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create replica store directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open replica store at `{}`", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas for replica store")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory replica store")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migrate(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn schema_version(&self) -> Result<i64> {
        schema_version_of(&self.conn)
    }

    /// When the document was last compacted, if ever.
    pub fn last_compaction(&self, doc_id: &str) -> Result<Option<(String, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT compacted_at, merged_updates FROM replica_compactions WHERE doc_id = ?1")
            .context("failed to prepare compaction lookup")?;
        let mut rows = stmt.query(params![doc_id]).context("failed to query compactions")?;
        match rows.next().context("failed to read compaction row")? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
            None => Ok(None),
        }
    }
}

impl DurableStore for SqliteStore {
    fn load_updates(&mut self, doc_id: &str) -> Result<Vec<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM replica_updates WHERE doc_id = ?1 ORDER BY id")
            .context("failed to prepare update load")?;
        let rows = stmt
            .query_map(params![doc_id], |row| row.get::<_, Vec<u8>>(0))
            .with_context(|| format!("failed to load updates for `{doc_id}`"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read stored update for `{doc_id}`"))
    }

    fn append_update(&mut self, doc_id: &str, delta: &[u8]) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO replica_updates (doc_id, payload, created_at) VALUES (?1, ?2, ?3)",
                params![doc_id, delta, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to append update for `{doc_id}`"))?;
        Ok(())
    }

    fn update_count(&mut self, doc_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM replica_updates WHERE doc_id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count updates for `{doc_id}`"))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn compact(&mut self, doc_id: &str, full_state: &[u8]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().context("failed to start compaction transaction")?;
        let merged = tx
            .execute("DELETE FROM replica_updates WHERE doc_id = ?1", params![doc_id])
            .with_context(|| format!("failed to clear updates for `{doc_id}`"))?;
        tx.execute(
            "INSERT INTO replica_updates (doc_id, payload, created_at) VALUES (?1, ?2, ?3)",
            params![doc_id, full_state, now],
        )
        .with_context(|| format!("failed to write compacted state for `{doc_id}`"))?;
        tx.execute(
            "INSERT INTO replica_compactions (doc_id, compacted_at, merged_updates)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (doc_id) DO UPDATE SET
                compacted_at = excluded.compacted_at,
                merged_updates = excluded.merged_updates",
            params![doc_id, now, merged as i64],
        )
        .with_context(|| format!("failed to record compaction for `{doc_id}`"))?;
        tx.commit().with_context(|| format!("failed to commit compaction for `{doc_id}`"))
    }
}

/// Bring the replica schema up to the newest migration. Returns the
/// versions applied by this call.
fn migrate(conn: &mut Connection) -> Result<Vec<i64>> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS replica_schema (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );",
    )
    .context("failed to create replica_schema table")?;

    let from = schema_version_of(conn)?;
    let mut applied = Vec::new();
    for &(version, sql) in MIGRATIONS.iter().filter(|(version, _)| *version > from) {
        let tx = conn.transaction().context("failed to start replica schema upgrade")?;
        tx.execute_batch(sql)
            .with_context(|| format!("replica schema v{version} failed to apply"))?;
        tx.execute(
            "INSERT INTO replica_schema (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("failed to record replica schema v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit replica schema v{version}"))?;
        applied.push(version);
    }

    if let Some(to) = applied.last() {
        info!(from, to = *to, "upgraded replica store schema");
    }
    Ok(applied)
}

fn schema_version_of(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM replica_schema", [], |row| row.get(0))
        .context("failed to read replica schema version")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema_and_records_latest_migration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("nested").join("replicas.db"))
            .expect("store should open");
        assert_eq!(store.schema_version().expect("schema version"), 2);
    }

    #[test]
    fn schema_upgrade_runs_each_version_once() {
        let mut conn = Connection::open_in_memory().expect("connection");
        assert_eq!(migrate(&mut conn).expect("first upgrade"), vec![1, 2]);
        assert!(migrate(&mut conn).expect("second upgrade").is_empty());
        assert_eq!(schema_version_of(&conn).expect("schema version"), 2);
    }

    #[test]
    fn reopening_keeps_updates_and_migrations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("replicas.db");
        {
            let mut store = SqliteStore::open(&path).expect("first open");
            store.append_update("doc-a", b"one").expect("append");
            store.append_update("doc-a", b"two").expect("append");
        }

        let mut store = SqliteStore::open(&path).expect("second open");
        assert_eq!(store.schema_version().expect("schema version"), 2);
        assert_eq!(
            store.load_updates("doc-a").expect("load"),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn updates_are_scoped_by_document() {
        let mut store = SqliteStore::open_in_memory().expect("store");
        store.append_update("doc-a", b"a").expect("append");
        store.append_update("doc-b", b"b").expect("append");

        assert_eq!(store.load_updates("doc-a").expect("load"), vec![b"a".to_vec()]);
        assert_eq!(store.update_count("doc-b").expect("count"), 1);
        assert!(store.load_updates("doc-c").expect("load").is_empty());
    }

    #[test]
    fn compaction_replaces_log_with_single_state() {
        let mut store = SqliteStore::open_in_memory().expect("store");
        for delta in [b"1", b"2", b"3"] {
            store.append_update("doc", delta).expect("append");
        }

        store.compact("doc", b"state").expect("compact");

        assert_eq!(store.load_updates("doc").expect("load"), vec![b"state".to_vec()]);
        let (_, merged) = store
            .last_compaction("doc")
            .expect("lookup")
            .expect("compaction should be recorded");
        assert_eq!(merged, 3);
        assert!(store.last_compaction("other").expect("lookup").is_none());
    }
}
