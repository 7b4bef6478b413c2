use std::io::Read;
use std::time::Duration;

use cograph_config::IngestConfig;
use cograph_core::{Interaction, InteractionRow, SkipReason, current_unix_timestamp_millis};
use cograph_store::{GraphTx, SqliteGraphStore, StoreError};
use serde::{Deserialize, Serialize};

use crate::BuildError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

impl IngestOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    pub index: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounters {
    pub items_created: u64,
    pub sessions_created: u64,
    pub next_created: u64,
    pub next_updated: u64,
    pub next_sessions_added: u64,
    pub contains_created: u64,
}

impl WriteCounters {
    fn merge(&mut self, other: &Self) {
        self.items_created += other.items_created;
        self.sessions_created += other.sessions_created;
        self.next_created += other.next_created;
        self.next_updated += other.next_updated;
        self.next_sessions_added += other.next_sessions_added;
        self.contains_created += other.contains_created;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub rows_received: usize,
    pub rows_applied: usize,
    pub rows_skipped: usize,
    pub skipped: Vec<SkippedRow>,
    pub chunks_committed: usize,
    pub counters: WriteCounters,
}

/// Applies interaction batches to the graph.
///
/// Valid rows are written in chunks, one `BEGIN IMMEDIATE` transaction per
/// chunk. A chunk that fails on lock contention rolled back in full, so it is
/// retried as a whole; any other store error stops the batch and reports how
/// many rows were already committed.
pub struct Ingestor {
    store: SqliteGraphStore,
    options: IngestOptions,
}

impl Ingestor {
    pub fn new(store: SqliteGraphStore, options: IngestOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &SqliteGraphStore {
        &self.store
    }

    pub fn into_store(self) -> SqliteGraphStore {
        self.store
    }

    pub fn ingest(&mut self, batch: &[InteractionRow]) -> Result<IngestResult, BuildError> {
        let mut skipped = Vec::new();
        let mut valid = Vec::with_capacity(batch.len());
        for (index, row) in batch.iter().enumerate() {
            match row.validate() {
                Ok(interaction) => valid.push(interaction),
                Err(reason) => {
                    tracing::debug!(index, reason = %reason, "skipping interaction row");
                    skipped.push(SkippedRow { index, reason });
                }
            }
        }

        let mut counters = WriteCounters::default();
        let mut rows_committed = 0usize;
        let mut chunks_committed = 0usize;

        for chunk in valid.chunks(self.options.chunk_size.max(1)) {
            let chunk_counters = self
                .apply_chunk_with_retry(chunk)
                .map_err(|source| BuildError::IngestAborted {
                    rows_committed,
                    source,
                })?;

            counters.merge(&chunk_counters);
            rows_committed += chunk.len();
            chunks_committed += 1;

            tracing::info!(
                committed = rows_committed,
                total = valid.len(),
                items_created = chunk_counters.items_created,
                next_created = chunk_counters.next_created,
                contains_created = chunk_counters.contains_created,
                "ingest chunk committed"
            );
        }

        if !skipped.is_empty() {
            tracing::warn!(
                skipped = skipped.len(),
                received = batch.len(),
                "interaction rows skipped"
            );
        }

        Ok(IngestResult {
            rows_received: batch.len(),
            rows_applied: rows_committed,
            rows_skipped: skipped.len(),
            skipped,
            chunks_committed,
            counters,
        })
    }

    fn apply_chunk_with_retry(
        &mut self,
        chunk: &[Interaction],
    ) -> Result<WriteCounters, StoreError> {
        let mut attempt = 0u32;
        loop {
            let now_ms = current_unix_timestamp_millis();
            match self
                .store
                .write_unit(|tx| apply_interactions(tx, chunk, now_ms))
            {
                Ok(counters) => return Ok(counters),
                Err(err) if err.is_transient() && attempt < self.options.max_retries => {
                    let wait = self
                        .options
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = self.options.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "ingest chunk hit lock contention, retrying"
                    );
                    std::thread::sleep(wait);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn apply_interactions(
    tx: &GraphTx<'_>,
    interactions: &[Interaction],
    now_ms: i64,
) -> Result<WriteCounters, StoreError> {
    let mut counters = WriteCounters::default();

    for interaction in interactions {
        let item_id = interaction.item_id.as_str();
        let session_id = interaction.session_id.as_deref();

        counters.items_created += u64::from(tx.upsert_item(item_id, now_ms)?);

        if let Some(next_item_id) = interaction.next_item_id.as_deref() {
            counters.items_created += u64::from(tx.upsert_item(next_item_id, now_ms)?);

            let outcome = tx.upsert_next(item_id, next_item_id, session_id, now_ms)?;
            if outcome.created {
                counters.next_created += 1;
            } else {
                counters.next_updated += 1;
            }
            counters.next_sessions_added += u64::from(outcome.session_added);
        }

        if let Some(session_id) = session_id {
            counters.sessions_created += u64::from(tx.upsert_session(session_id, now_ms)?);
            counters.contains_created += u64::from(tx.upsert_contains(session_id, item_id)?);
            // The target of an in-session transition was also seen in that session.
            if let Some(next_item_id) = interaction.next_item_id.as_deref() {
                counters.contains_created +=
                    u64::from(tx.upsert_contains(session_id, next_item_id)?);
            }
        }
    }

    Ok(counters)
}

/// Parses a JSON array of interaction rows, the format the batch generator
/// writes.
pub fn read_interaction_batch<R: Read>(reader: R) -> Result<Vec<InteractionRow>, BuildError> {
    let rows: Vec<InteractionRow> = serde_json::from_reader(reader)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use cograph_store::GraphStore;
    use rusqlite::Connection;
    use tempfile::tempdir;

    use super::*;

    fn row(item: &str, next: Option<&str>, session: Option<&str>) -> InteractionRow {
        InteractionRow {
            item_id: Some(item.to_owned()),
            next_item_id: next.map(str::to_owned),
            session_id: session.map(str::to_owned),
        }
    }

    #[test]
    fn skipped_rows_do_not_stop_the_batch() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open(temp.path()).expect("open store");
        let mut ingestor = Ingestor::new(store, IngestOptions::default());

        let batch = vec![
            row("A", Some("B"), Some("S1")),
            InteractionRow {
                item_id: None,
                next_item_id: Some("C".to_owned()),
                session_id: Some("S1".to_owned()),
            },
            row("B", None, Some("S1")),
        ];
        let result = ingestor.ingest(&batch).expect("ingest");

        assert_eq!(result.rows_received, 3);
        assert_eq!(result.rows_applied, 2);
        assert_eq!(result.rows_skipped, 1);
        assert_eq!(
            result.skipped,
            vec![SkippedRow {
                index: 1,
                reason: SkipReason::MissingItemId,
            }]
        );

        let summary = ingestor.store().graph_summary().expect("summary");
        assert_eq!(summary.items, 2);
        assert_eq!(summary.next_edges, 1);
        assert_eq!(summary.contains_edges, 2);
    }

    #[test]
    fn counters_distinguish_created_and_updated_edges() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open(temp.path()).expect("open store");
        let mut ingestor = Ingestor::new(
            store,
            IngestOptions {
                chunk_size: 2,
                ..IngestOptions::default()
            },
        );

        let batch = vec![
            row("A", Some("B"), Some("S1")),
            row("A", Some("B"), Some("S1")),
            row("A", Some("B"), Some("S2")),
            row("A", Some("B"), None),
            row("C", None, None),
        ];
        let result = ingestor.ingest(&batch).expect("ingest");

        assert_eq!(result.chunks_committed, 3);
        assert_eq!(
            result.counters,
            WriteCounters {
                items_created: 3,
                sessions_created: 2,
                next_created: 1,
                next_updated: 3,
                next_sessions_added: 2,
                contains_created: 4,
            }
        );
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open(temp.path()).expect("open store");
        let mut ingestor = Ingestor::new(store, IngestOptions::default());

        let result = ingestor.ingest(&[]).expect("ingest");
        assert_eq!(result.rows_applied, 0);
        assert_eq!(result.chunks_committed, 0);
    }

    fn hold_write_lock(store: &SqliteGraphStore) -> Connection {
        let holder = Connection::open(store.db_path()).expect("open second connection");
        holder
            .execute_batch("BEGIN IMMEDIATE;")
            .expect("take write lock");
        holder
    }

    fn single_row_chunks(max_retries: u32, retry_backoff: Duration) -> IngestOptions {
        IngestOptions {
            chunk_size: 1,
            max_retries,
            retry_backoff,
        }
    }

    #[test]
    fn failed_chunk_reports_rows_committed_before_it() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open(temp.path()).expect("open store");
        Connection::open(store.db_path())
            .expect("open second connection")
            .execute_batch(
                r#"
                CREATE TRIGGER reject_item BEFORE INSERT ON items
                WHEN NEW.item_id = 'REJECTED'
                BEGIN
                    SELECT RAISE(ABORT, 'item rejected');
                END;
                "#,
            )
            .expect("install trigger");

        let mut ingestor = Ingestor::new(store, single_row_chunks(0, Duration::ZERO));
        let batch = vec![
            row("A", None, Some("S1")),
            row("REJECTED", None, Some("S1")),
            row("C", None, Some("S1")),
        ];
        let err = ingestor.ingest(&batch).expect_err("second chunk fails");

        match err {
            BuildError::IngestAborted {
                rows_committed,
                source,
            } => {
                assert_eq!(rows_committed, 1);
                assert!(!source.is_transient());
            }
            other => panic!("unexpected error: {other}"),
        }

        let store = ingestor.store();
        let summary = store.graph_summary().expect("summary");
        assert_eq!(summary.items, 1);
        assert_eq!(summary.sessions, 1);
        assert_eq!(store.list_session_items("S1").expect("items"), vec!["A"]);
    }

    #[test]
    fn lock_contention_without_retries_aborts_with_nothing_committed() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open_with_busy_timeout(temp.path(), Duration::from_millis(20))
            .expect("open store");
        let holder = hold_write_lock(&store);

        let mut ingestor = Ingestor::new(store, single_row_chunks(0, Duration::from_millis(10)));
        let batch = vec![
            row("A", None, Some("S1")),
            row("B", None, Some("S1")),
            row("C", None, Some("S1")),
        ];
        let err = ingestor.ingest(&batch).expect_err("locked database");
        holder.execute_batch("ROLLBACK;").expect("release lock");

        match err {
            BuildError::IngestAborted {
                rows_committed,
                source,
            } => {
                assert_eq!(rows_committed, 0);
                assert!(source.is_transient());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ingestor.store().graph_summary().expect("summary").items, 0);
    }

    #[test]
    fn chunk_is_retried_after_lock_is_released_during_backoff() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open_with_busy_timeout(temp.path(), Duration::from_millis(20))
            .expect("open store");
        let holder = hold_write_lock(&store);
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            holder.execute_batch("COMMIT;").expect("release lock");
        });

        let mut ingestor = Ingestor::new(store, single_row_chunks(5, Duration::from_millis(100)));
        let started = Instant::now();
        let result = ingestor
            .ingest(&[row("A", Some("B"), Some("S1"))])
            .expect("retry commits the chunk");
        release.join().expect("lock holder thread");

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(result.rows_applied, 1);
        assert_eq!(result.chunks_committed, 1);
        let edge = ingestor
            .store()
            .get_next_edge("A", "B")
            .expect("read edge")
            .expect("edge exists");
        assert_eq!(edge.weight, 1);
    }

    #[test]
    fn read_interaction_batch_accepts_generator_output() {
        let raw = br#"[
            {"session_id": 1, "item_id": 214536502, "next_item_id": 214536500},
            {"session_id": 1, "item_id": 214536500, "next_item_id": null}
        ]"#;

        let rows = read_interaction_batch(&raw[..]).expect("parse batch");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].next_item_id.as_deref(), Some("214536500"));
        assert_eq!(rows[1].next_item_id, None);

        let err = read_interaction_batch(&b"{\"item_id\": 1}"[..]).expect_err("object is not a batch");
        assert!(matches!(err, BuildError::Json(_)));
    }
}
