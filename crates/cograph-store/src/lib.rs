use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cograph_config::{DEFAULT_BUSY_TIMEOUT_MS, cograph_dir, graph_db_path};
use cograph_core::{ItemId, SessionId};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod read;
mod write;

pub use write::{GraphTx, NextUpsert, SessionMembers};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub seq: i64,
    pub session_id: SessionId,
    pub created_at: i64,
    /// Time of the latest aggregation call that folded new memberships of
    /// this session into CO_OCCURS.
    pub aggregated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextEdgeRecord {
    pub from_item: ItemId,
    pub to_item: ItemId,
    pub weight: i64,
    pub sessions: BTreeSet<SessionId>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextEdgeSummary {
    pub from_item: ItemId,
    pub to_item: ItemId,
    pub weight: i64,
    pub session_count: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoOccursEdgeRecord {
    pub item_a: ItemId,
    pub item_b: ItemId,
    pub weight: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDegree {
    pub item_id: ItemId,
    pub session_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoOccursNeighbor {
    pub item_id: ItemId,
    pub weight: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub items: i64,
    pub sessions: i64,
    /// Sessions with at least one membership and none left to aggregate.
    pub sessions_aggregated: i64,
    pub contains_edges: i64,
    pub co_occurs_edges: i64,
    pub co_occurs_weight: i64,
    pub next_edges: i64,
    pub next_weight: i64,
}

/// Cursor of the aggregation pass currently in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationStateRecord {
    pub next_skip: u64,
    pub passes_completed: u64,
    pub last_run_at: Option<i64>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Lock contention that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Read side of the graph. Analytics and tests consume the graph through this
/// trait; every mutation goes through [`SqliteGraphStore::write_unit`].
pub trait GraphStore {
    fn graph_summary(&self) -> Result<GraphSummary, StoreError>;
    fn top_items_by_contains(&self, limit: u32) -> Result<Vec<ItemDegree>, StoreError>;
    fn top_co_occurs(&self, limit: u32) -> Result<Vec<CoOccursEdgeRecord>, StoreError>;
    fn top_next(&self, limit: u32) -> Result<Vec<NextEdgeSummary>, StoreError>;
    fn co_occurs_neighbors(
        &self,
        item_id: &str,
        limit: u32,
    ) -> Result<Vec<CoOccursNeighbor>, StoreError>;

    fn get_next_edge(
        &self,
        from_item: &str,
        to_item: &str,
    ) -> Result<Option<NextEdgeRecord>, StoreError>;
    fn get_co_occurs(
        &self,
        left: &str,
        right: &str,
    ) -> Result<Option<CoOccursEdgeRecord>, StoreError>;
    fn list_session_items(&self, session_id: &str) -> Result<Vec<ItemId>, StoreError>;
    fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;
    fn get_aggregation_state(&self) -> Result<AggregationStateRecord, StoreError>;
}

pub struct SqliteGraphStore {
    conn: Connection,
    cograph_dir: PathBuf,
    db_path: PathBuf,
}

impl SqliteGraphStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_busy_timeout(
            workspace_root,
            Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        )
    }

    pub fn open_with_busy_timeout(
        workspace_root: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let workspace_root = workspace_root.as_ref();
        let cograph_dir = cograph_dir(workspace_root);
        let db_path = graph_db_path(workspace_root);

        fs::create_dir_all(&cograph_dir)?;

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        run_migrations(&conn)?;

        tracing::debug!(path = %db_path.display(), "opened graph store");

        Ok(Self {
            conn,
            cograph_dir,
            db_path,
        })
    }

    pub fn cograph_dir(&self) -> &Path {
        &self.cograph_dir
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        let ok: i64 = self.conn.query_row("SELECT 1", [], |row| row.get(0))?;
        if ok == 1 {
            Ok(())
        } else {
            Err(StoreError::InvalidArgument(format!(
                "connectivity probe returned {ok}"
            )))
        }
    }

    /// Runs `work` inside one `BEGIN IMMEDIATE` transaction. The write lock is
    /// taken up front, so every read-modify-write inside `work` is serialized
    /// against other writers. Returning `Err` rolls the whole unit back.
    pub fn write_unit<T, E, F>(&mut self, work: F) -> Result<T, E>
    where
        F: FnOnce(&GraphTx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let value = work(&GraphTx::new(&tx))?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            item_id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS sessions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL,
            aggregated_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS contains_edges (
            session_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            aggregated_at INTEGER,
            PRIMARY KEY (session_id, item_id)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_contains_edges_item
            ON contains_edges(item_id);

        CREATE TABLE IF NOT EXISTS next_edges (
            src_item TEXT NOT NULL,
            dst_item TEXT NOT NULL,
            weight INTEGER NOT NULL CHECK (weight > 0),
            created_at INTEGER NOT NULL,
            PRIMARY KEY (src_item, dst_item)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_next_edges_weight
            ON next_edges(weight DESC, src_item, dst_item);

        CREATE TABLE IF NOT EXISTS next_edge_sessions (
            src_item TEXT NOT NULL,
            dst_item TEXT NOT NULL,
            session_id TEXT NOT NULL,
            PRIMARY KEY (src_item, dst_item, session_id)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS co_occurs_edges (
            item_a TEXT NOT NULL,
            item_b TEXT NOT NULL,
            weight INTEGER NOT NULL CHECK (weight > 0),
            created_at INTEGER NOT NULL,
            PRIMARY KEY (item_a, item_b),
            CHECK (item_a < item_b)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_co_occurs_edges_weight
            ON co_occurs_edges(weight DESC, item_a, item_b);

        CREATE INDEX IF NOT EXISTS idx_co_occurs_edges_item_b
            ON co_occurs_edges(item_b);

        CREATE TABLE IF NOT EXISTS aggregation_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            next_skip INTEGER NOT NULL,
            passes_completed INTEGER NOT NULL,
            last_run_at INTEGER
        );
        "#,
    )?;

    Ok(())
}

pub(crate) fn clamp_limit(limit: u32) -> i64 {
    i64::from(limit.clamp(1, 200))
}
