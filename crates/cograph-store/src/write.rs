use cograph_core::{ItemId, ItemPair};
use rusqlite::{Connection, OptionalExtension, params};

use super::{AggregationStateRecord, SessionRecord, StoreError};

/// Outcome of a NEXT edge upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextUpsert {
    pub created: bool,
    pub session_added: bool,
}

/// Memberships of one session, split by aggregation state. Both lists are
/// sorted by item id and never share an item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMembers {
    pub aggregated: Vec<ItemId>,
    pub pending: Vec<ItemId>,
}

/// Handle to the write transaction opened by
/// [`SqliteGraphStore::write_unit`](crate::SqliteGraphStore::write_unit).
///
/// Every upsert is a single `INSERT .. ON CONFLICT` statement, so create and
/// match branches resolve inside the database instead of in a read-then-write
/// round trip.
pub struct GraphTx<'t> {
    conn: &'t Connection,
}

impl<'t> GraphTx<'t> {
    pub(crate) fn new(conn: &'t Connection) -> Self {
        Self { conn }
    }

    /// Returns `true` when the item did not exist before.
    pub fn upsert_item(&self, item_id: &str, now_ms: i64) -> Result<bool, StoreError> {
        let changed = self.conn.prepare_cached(
            "INSERT INTO items (item_id, created_at) VALUES (?1, ?2) ON CONFLICT(item_id) DO NOTHING",
        )?
        .execute(params![item_id, now_ms])?;
        Ok(changed > 0)
    }

    /// Returns `true` when the session did not exist before. New sessions get
    /// the next `seq`, which fixes their position in aggregation order.
    pub fn upsert_session(&self, session_id: &str, now_ms: i64) -> Result<bool, StoreError> {
        let changed = self.conn.prepare_cached(
            "INSERT INTO sessions (session_id, created_at) VALUES (?1, ?2) ON CONFLICT(session_id) DO NOTHING",
        )?
        .execute(params![session_id, now_ms])?;
        Ok(changed > 0)
    }

    pub fn upsert_next(
        &self,
        from_item: &str,
        to_item: &str,
        session_id: Option<&str>,
        now_ms: i64,
    ) -> Result<NextUpsert, StoreError> {
        let weight: i64 = self
            .conn
            .prepare_cached(
                r#"
                INSERT INTO next_edges (src_item, dst_item, weight, created_at)
                VALUES (?1, ?2, 1, ?3)
                ON CONFLICT(src_item, dst_item) DO UPDATE SET
                    weight = next_edges.weight + 1
                RETURNING weight
                "#,
            )?
            .query_row(params![from_item, to_item, now_ms], |row| row.get(0))?;

        let session_added = match session_id {
            Some(session_id) => {
                self.conn
                    .prepare_cached(
                        r#"
                        INSERT INTO next_edge_sessions (src_item, dst_item, session_id)
                        VALUES (?1, ?2, ?3)
                        ON CONFLICT(src_item, dst_item, session_id) DO NOTHING
                        "#,
                    )?
                    .execute(params![from_item, to_item, session_id])?
                    > 0
            }
            None => false,
        };

        Ok(NextUpsert {
            created: weight == 1,
            session_added,
        })
    }

    /// Returns `true` when the membership edge did not exist before.
    pub fn upsert_contains(&self, session_id: &str, item_id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.prepare_cached(
            r#"
            INSERT INTO contains_edges (session_id, item_id) VALUES (?1, ?2)
            ON CONFLICT(session_id, item_id) DO NOTHING
            "#,
        )?
        .execute(params![session_id, item_id])?;
        Ok(changed > 0)
    }

    /// Adds `increment` to the pair's weight, creating the edge when absent.
    /// Returns `true` on creation.
    pub fn upsert_co_occurs(
        &self,
        pair: &ItemPair,
        increment: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        if increment <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "co-occurrence increment must be positive, got {increment}"
            )));
        }

        let weight: i64 = self
            .conn
            .prepare_cached(
                r#"
                INSERT INTO co_occurs_edges (item_a, item_b, weight, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(item_a, item_b) DO UPDATE SET
                    weight = co_occurs_edges.weight + excluded.weight
                RETURNING weight
                "#,
            )?
            .query_row(
                params![pair.first(), pair.second(), increment, now_ms],
                |row| row.get(0),
            )?;

        // An existing edge already holds weight >= 1.
        Ok(weight == increment)
    }

    pub fn session_page(&self, skip: u64, limit: u32) -> Result<Vec<SessionRecord>, StoreError> {
        let skip = i64::try_from(skip).map_err(|_| {
            StoreError::InvalidArgument(format!("session offset {skip} is out of range"))
        })?;

        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT seq, session_id, created_at, aggregated_at
            FROM sessions
            ORDER BY seq ASC
            LIMIT ?1 OFFSET ?2
            "#,
        )?;
        let rows = stmt.query_map(params![i64::from(limit), skip], |row| {
            Ok(SessionRecord {
                seq: row.get(0)?,
                session_id: row.get(1)?,
                created_at: row.get(2)?,
                aggregated_at: row.get(3)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn session_items(&self, session_id: &str) -> Result<Vec<ItemId>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT item_id FROM contains_edges WHERE session_id = ?1 ORDER BY item_id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| row.get(0))?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Splits a session's memberships into those already folded into
    /// CO_OCCURS and those added since.
    pub fn session_members(&self, session_id: &str) -> Result<SessionMembers, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT item_id, aggregated_at IS NOT NULL
            FROM contains_edges
            WHERE session_id = ?1
            ORDER BY item_id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, ItemId>(0)?, row.get::<_, bool>(1)?))
        })?;

        let mut members = SessionMembers::default();
        for row in rows {
            let (item_id, aggregated) = row?;
            if aggregated {
                members.aggregated.push(item_id);
            } else {
                members.pending.push(item_id);
            }
        }
        Ok(members)
    }

    /// Marks every pending membership of the session as aggregated and
    /// stamps the session. Returns the number of memberships marked.
    pub fn mark_members_aggregated(
        &self,
        session_id: &str,
        now_ms: i64,
    ) -> Result<usize, StoreError> {
        let marked = self
            .conn
            .prepare_cached(
                r#"
                UPDATE contains_edges SET aggregated_at = ?2
                WHERE session_id = ?1 AND aggregated_at IS NULL
                "#,
            )?
            .execute(params![session_id, now_ms])?;

        if marked > 0 {
            self.conn
                .prepare_cached("UPDATE sessions SET aggregated_at = ?2 WHERE session_id = ?1")?
                .execute(params![session_id, now_ms])?;
        }
        Ok(marked)
    }

    pub fn aggregation_state(&self) -> Result<AggregationStateRecord, StoreError> {
        read_aggregation_state(self.conn)
    }

    pub fn put_aggregation_state(&self, record: &AggregationStateRecord) -> Result<(), StoreError> {
        let next_skip = i64::try_from(record.next_skip).unwrap_or(i64::MAX);
        let passes_completed = i64::try_from(record.passes_completed).unwrap_or(i64::MAX);

        self.conn.execute(
            r#"
            INSERT INTO aggregation_state (id, next_skip, passes_completed, last_run_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                next_skip = excluded.next_skip,
                passes_completed = excluded.passes_completed,
                last_run_at = excluded.last_run_at
            "#,
            params![next_skip, passes_completed, record.last_run_at],
        )?;
        Ok(())
    }
}

pub(crate) fn read_aggregation_state(
    conn: &Connection,
) -> Result<AggregationStateRecord, StoreError> {
    let record = conn
        .query_row(
            "SELECT next_skip, passes_completed, last_run_at FROM aggregation_state WHERE id = 1",
            [],
            |row| {
                Ok(AggregationStateRecord {
                    next_skip: row.get::<_, i64>(0)?.max(0) as u64,
                    passes_completed: row.get::<_, i64>(1)?.max(0) as u64,
                    last_run_at: row.get(2)?,
                })
            },
        )
        .optional()?;

    Ok(record.unwrap_or_default())
}
