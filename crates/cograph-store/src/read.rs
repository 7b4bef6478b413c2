use std::collections::BTreeSet;

use cograph_core::{ItemId, ItemPair};
use rusqlite::{OptionalExtension, params};

use super::write::read_aggregation_state;
use super::{
    AggregationStateRecord, CoOccursEdgeRecord, CoOccursNeighbor, GraphStore, GraphSummary,
    ItemDegree, NextEdgeRecord, NextEdgeSummary, SessionRecord, SqliteGraphStore, StoreError,
    clamp_limit,
};

impl GraphStore for SqliteGraphStore {
    fn graph_summary(&self) -> Result<GraphSummary, StoreError> {
        let summary = self.conn.query_row(
            r#"
            SELECT
                (SELECT COUNT(*) FROM items),
                (SELECT COUNT(*) FROM sessions),
                (SELECT COUNT(DISTINCT session_id) FROM contains_edges
                    WHERE session_id NOT IN (
                        SELECT session_id FROM contains_edges WHERE aggregated_at IS NULL
                    )),
                (SELECT COUNT(*) FROM contains_edges),
                (SELECT COUNT(*) FROM co_occurs_edges),
                (SELECT COALESCE(SUM(weight), 0) FROM co_occurs_edges),
                (SELECT COUNT(*) FROM next_edges),
                (SELECT COALESCE(SUM(weight), 0) FROM next_edges)
            "#,
            [],
            |row| {
                Ok(GraphSummary {
                    items: row.get(0)?,
                    sessions: row.get(1)?,
                    sessions_aggregated: row.get(2)?,
                    contains_edges: row.get(3)?,
                    co_occurs_edges: row.get(4)?,
                    co_occurs_weight: row.get(5)?,
                    next_edges: row.get(6)?,
                    next_weight: row.get(7)?,
                })
            },
        )?;

        Ok(summary)
    }

    fn top_items_by_contains(&self, limit: u32) -> Result<Vec<ItemDegree>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT item_id, COUNT(*) AS degree
            FROM contains_edges
            GROUP BY item_id
            ORDER BY degree DESC, item_id ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![clamp_limit(limit)], |row| {
            Ok(ItemDegree {
                item_id: row.get(0)?,
                session_count: row.get(1)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn top_co_occurs(&self, limit: u32) -> Result<Vec<CoOccursEdgeRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT item_a, item_b, weight, created_at
            FROM co_occurs_edges
            ORDER BY weight DESC, item_a ASC, item_b ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![clamp_limit(limit)], |row| {
            Ok(CoOccursEdgeRecord {
                item_a: row.get(0)?,
                item_b: row.get(1)?,
                weight: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn top_next(&self, limit: u32) -> Result<Vec<NextEdgeSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT
                e.src_item,
                e.dst_item,
                e.weight,
                (
                    SELECT COUNT(*)
                    FROM next_edge_sessions s
                    WHERE s.src_item = e.src_item AND s.dst_item = e.dst_item
                ),
                e.created_at
            FROM next_edges e
            ORDER BY e.weight DESC, e.src_item ASC, e.dst_item ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![clamp_limit(limit)], |row| {
            Ok(NextEdgeSummary {
                from_item: row.get(0)?,
                to_item: row.get(1)?,
                weight: row.get(2)?,
                session_count: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn co_occurs_neighbors(
        &self,
        item_id: &str,
        limit: u32,
    ) -> Result<Vec<CoOccursNeighbor>, StoreError> {
        let item_id = item_id.trim();
        if item_id.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT neighbor, weight FROM (
                SELECT item_b AS neighbor, weight FROM co_occurs_edges WHERE item_a = ?1
                UNION ALL
                SELECT item_a AS neighbor, weight FROM co_occurs_edges WHERE item_b = ?1
            )
            ORDER BY weight DESC, neighbor ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![item_id, clamp_limit(limit)], |row| {
            Ok(CoOccursNeighbor {
                item_id: row.get(0)?,
                weight: row.get(1)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_next_edge(
        &self,
        from_item: &str,
        to_item: &str,
    ) -> Result<Option<NextEdgeRecord>, StoreError> {
        let edge = self
            .conn
            .query_row(
                r#"
                SELECT weight, created_at
                FROM next_edges
                WHERE src_item = ?1 AND dst_item = ?2
                "#,
                params![from_item, to_item],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let Some((weight, created_at)) = edge else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id
            FROM next_edge_sessions
            WHERE src_item = ?1 AND dst_item = ?2
            ORDER BY session_id ASC
            "#,
        )?;
        let sessions = stmt
            .query_map(params![from_item, to_item], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Some(NextEdgeRecord {
            from_item: from_item.to_owned(),
            to_item: to_item.to_owned(),
            weight,
            sessions,
            created_at,
        }))
    }

    fn get_co_occurs(
        &self,
        left: &str,
        right: &str,
    ) -> Result<Option<CoOccursEdgeRecord>, StoreError> {
        let Some(pair) = ItemPair::new(left, right) else {
            return Ok(None);
        };

        let record = self
            .conn
            .query_row(
                r#"
                SELECT item_a, item_b, weight, created_at
                FROM co_occurs_edges
                WHERE item_a = ?1 AND item_b = ?2
                "#,
                params![pair.first(), pair.second()],
                |row| {
                    Ok(CoOccursEdgeRecord {
                        item_a: row.get(0)?,
                        item_b: row.get(1)?,
                        weight: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(record)
    }

    fn list_session_items(&self, session_id: &str) -> Result<Vec<ItemId>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id FROM contains_edges WHERE session_id = ?1 ORDER BY item_id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| row.get(0))?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT seq, session_id, created_at, aggregated_at
                FROM sessions
                WHERE session_id = ?1
                "#,
                params![session_id],
                |row| {
                    Ok(SessionRecord {
                        seq: row.get(0)?,
                        session_id: row.get(1)?,
                        created_at: row.get(2)?,
                        aggregated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(record)
    }

    fn get_aggregation_state(&self) -> Result<AggregationStateRecord, StoreError> {
        read_aggregation_state(&self.conn)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::{GraphStore, SqliteGraphStore, StoreError};
    use cograph_core::ItemPair;

    fn seeded_store(workspace: &std::path::Path) -> SqliteGraphStore {
        let mut store = SqliteGraphStore::open(workspace).expect("open store");
        store
            .write_unit(|tx| {
                for (session_id, items) in [
                    ("S1", vec!["A", "B", "C"]),
                    ("S2", vec!["A", "B"]),
                    ("S3", vec!["C", "D"]),
                ] {
                    tx.upsert_session(session_id, 1)?;
                    for item in items {
                        tx.upsert_item(item, 1)?;
                        tx.upsert_contains(session_id, item)?;
                    }
                }
                for (left, right, weight) in [("A", "B", 2), ("C", "D", 2), ("A", "C", 1)] {
                    let pair = ItemPair::new(left, right).expect("pair");
                    tx.upsert_co_occurs(&pair, weight, 1)?;
                }
                tx.upsert_next("A", "B", Some("S1"), 1)?;
                tx.upsert_next("A", "B", Some("S2"), 1)?;
                tx.upsert_next("B", "C", Some("S1"), 1)?;
                Ok::<_, StoreError>(())
            })
            .expect("seed graph");
        store
    }

    #[test]
    fn summary_counts_entities_and_weights() {
        let temp = tempdir().expect("tempdir");
        let store = seeded_store(temp.path());

        let summary = store.graph_summary().expect("summary");
        assert_eq!(summary.items, 4);
        assert_eq!(summary.sessions, 3);
        assert_eq!(summary.sessions_aggregated, 0);
        assert_eq!(summary.contains_edges, 7);
        assert_eq!(summary.co_occurs_edges, 3);
        assert_eq!(summary.co_occurs_weight, 5);
        assert_eq!(summary.next_edges, 2);
        assert_eq!(summary.next_weight, 3);
    }

    #[test]
    fn top_k_reads_break_weight_ties_by_item_id() {
        let temp = tempdir().expect("tempdir");
        let store = seeded_store(temp.path());

        let degrees = store.top_items_by_contains(10).expect("top items");
        let rendered = degrees
            .iter()
            .map(|row| (row.item_id.as_str(), row.session_count))
            .collect::<Vec<_>>();
        assert_eq!(rendered, vec![("A", 2), ("B", 2), ("C", 2), ("D", 1)]);

        let co = store.top_co_occurs(2).expect("top co-occurs");
        assert_eq!(co.len(), 2);
        assert_eq!((co[0].item_a.as_str(), co[0].item_b.as_str()), ("A", "B"));
        assert_eq!((co[1].item_a.as_str(), co[1].item_b.as_str()), ("C", "D"));

        let next = store.top_next(10).expect("top next");
        assert_eq!(next[0].from_item, "A");
        assert_eq!(next[0].weight, 2);
        assert_eq!(next[0].session_count, 2);
        assert_eq!(next[1].from_item, "B");
    }

    #[test]
    fn neighbors_read_both_orientations() {
        let temp = tempdir().expect("tempdir");
        let store = seeded_store(temp.path());

        let neighbors = store.co_occurs_neighbors("C", 10).expect("neighbors");
        let rendered = neighbors
            .iter()
            .map(|row| (row.item_id.as_str(), row.weight))
            .collect::<Vec<_>>();
        assert_eq!(rendered, vec![("D", 2), ("A", 1)]);
        assert!(store.co_occurs_neighbors("  ", 10).expect("blank").is_empty());
    }

    #[test]
    fn point_reads_return_none_for_missing_rows() {
        let temp = tempdir().expect("tempdir");
        let store = seeded_store(temp.path());

        assert!(store.get_next_edge("C", "A").expect("next").is_none());
        assert!(store.get_co_occurs("A", "A").expect("self pair").is_none());
        assert!(store.get_co_occurs("B", "D").expect("absent").is_none());
        assert!(store.get_session("S9").expect("session").is_none());
        assert_eq!(
            store.list_session_items("S1").expect("items"),
            vec!["A", "B", "C"]
        );
    }
}
