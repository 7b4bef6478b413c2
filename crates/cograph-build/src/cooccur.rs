use std::collections::BTreeMap;

use cograph_config::AggregateConfig;
use cograph_core::{ItemPair, canonical_pairs, current_unix_timestamp_millis};
use cograph_store::{GraphStore, GraphTx, SqliteGraphStore, StoreError};
use serde::{Deserialize, Serialize};

use crate::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub batch_size: u32,
    pub skip_sessions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub sessions_processed: u64,
    pub sessions_already_aggregated: u64,
    pub pairs_upserted: u64,
    pub edges_created: u64,
    /// Fewer sessions than `batch_size` were left: the pass is finished.
    pub complete: bool,
    pub next_skip: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassRequest {
    pub batch_size: u32,
    /// Continue from the persisted cursor instead of session 0.
    pub resume: bool,
    /// Stop after this many calls even if the pass is unfinished.
    pub max_calls: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassResult {
    pub started_at_skip: u64,
    pub calls: u32,
    pub sessions_processed: u64,
    pub sessions_already_aggregated: u64,
    pub pairs_upserted: u64,
    pub edges_created: u64,
    pub complete: bool,
    pub next_skip: u64,
    pub passes_completed: u64,
}

/// Expands each session's item set into canonical pairs and folds them into
/// CO_OCCURS weights, one bounded page of sessions per call.
///
/// A call runs in a single write transaction: the page read, the pair
/// upserts, the per-membership markers and (for full passes) the cursor commit
/// together or not at all.
pub struct CoOccurrenceAggregator {
    store: SqliteGraphStore,
    track_sessions: bool,
}

impl CoOccurrenceAggregator {
    pub fn new(store: SqliteGraphStore, config: &AggregateConfig) -> Self {
        Self {
            store,
            track_sessions: config.track_sessions,
        }
    }

    pub fn store(&self) -> &SqliteGraphStore {
        &self.store
    }

    pub fn into_store(self) -> SqliteGraphStore {
        self.store
    }

    pub fn aggregate(&mut self, request: AggregateRequest) -> Result<AggregateResult, BuildError> {
        validate_batch_size(request.batch_size)?;

        let track_sessions = self.track_sessions;
        let now_ms = current_unix_timestamp_millis();
        let result = self
            .store
            .write_unit(|tx| aggregate_page(tx, request, track_sessions, now_ms))?;

        tracing::info!(
            skip_sessions = request.skip_sessions,
            sessions = result.sessions_processed,
            pairs = result.pairs_upserted,
            edges_created = result.edges_created,
            complete = result.complete,
            "co-occurrence batch committed"
        );
        Ok(result)
    }

    /// Repeats [`aggregate`](Self::aggregate) until a short page ends the
    /// pass, persisting the cursor with every call so an interrupted pass can
    /// resume where the last committed call stopped.
    pub fn run_pass(&mut self, request: PassRequest) -> Result<PassResult, BuildError> {
        validate_batch_size(request.batch_size)?;

        let state = self.store.get_aggregation_state()?;
        let started_at_skip = if request.resume { state.next_skip } else { 0 };
        let track_sessions = self.track_sessions;

        let mut pass = PassResult {
            started_at_skip,
            calls: 0,
            sessions_processed: 0,
            sessions_already_aggregated: 0,
            pairs_upserted: 0,
            edges_created: 0,
            complete: false,
            next_skip: started_at_skip,
            passes_completed: state.passes_completed,
        };

        while !pass.complete {
            if request.max_calls.is_some_and(|max_calls| pass.calls >= max_calls) {
                tracing::info!(next_skip = pass.next_skip, "co-occurrence pass paused");
                break;
            }

            let call = AggregateRequest {
                batch_size: request.batch_size,
                skip_sessions: pass.next_skip,
            };
            let now_ms = current_unix_timestamp_millis();
            let (result, passes_completed) = self.store.write_unit(|tx| {
                let result = aggregate_page(tx, call, track_sessions, now_ms)?;

                let mut state = tx.aggregation_state()?;
                if result.complete {
                    state.next_skip = 0;
                    state.passes_completed += 1;
                } else {
                    state.next_skip = result.next_skip;
                }
                state.last_run_at = Some(now_ms);
                tx.put_aggregation_state(&state)?;

                Ok::<_, StoreError>((result, state.passes_completed))
            })?;

            pass.calls += 1;
            pass.sessions_processed += result.sessions_processed;
            pass.sessions_already_aggregated += result.sessions_already_aggregated;
            pass.pairs_upserted += result.pairs_upserted;
            pass.edges_created += result.edges_created;
            pass.complete = result.complete;
            pass.next_skip = result.next_skip;
            pass.passes_completed = passes_completed;

            tracing::info!(
                call = pass.calls,
                skip_sessions = call.skip_sessions,
                sessions = result.sessions_processed,
                pairs = result.pairs_upserted,
                "co-occurrence pass progress"
            );
        }

        Ok(pass)
    }
}

fn validate_batch_size(batch_size: u32) -> Result<(), BuildError> {
    if batch_size == 0 {
        return Err(BuildError::InvalidInput(
            "batch_size must be greater than zero".to_owned(),
        ));
    }
    Ok(())
}

fn aggregate_page(
    tx: &GraphTx<'_>,
    request: AggregateRequest,
    track_sessions: bool,
    now_ms: i64,
) -> Result<AggregateResult, StoreError> {
    let sessions = tx.session_page(request.skip_sessions, request.batch_size)?;

    let mut pair_counts = BTreeMap::<ItemPair, i64>::new();
    let mut already_aggregated = 0u64;
    for session in &sessions {
        if !track_sessions {
            let items = tx.session_items(&session.session_id)?;
            for pair in canonical_pairs(items) {
                *pair_counts.entry(pair).or_insert(0) += 1;
            }
            continue;
        }

        // Only pairs touching a membership added since the last call are
        // new; pairs among aggregated members were counted already.
        let members = tx.session_members(&session.session_id)?;
        if members.pending.is_empty() {
            if !members.aggregated.is_empty() {
                already_aggregated += 1;
            }
            continue;
        }

        for pair in canonical_pairs(&members.pending) {
            *pair_counts.entry(pair).or_insert(0) += 1;
        }
        for new_item in &members.pending {
            for old_item in &members.aggregated {
                if let Some(pair) = ItemPair::new(new_item.as_str(), old_item.as_str()) {
                    *pair_counts.entry(pair).or_insert(0) += 1;
                }
            }
        }

        tx.mark_members_aggregated(&session.session_id, now_ms)?;
    }

    let mut edges_created = 0u64;
    for (pair, count) in &pair_counts {
        if tx.upsert_co_occurs(pair, *count, now_ms)? {
            edges_created += 1;
        }
    }

    let sessions_processed = sessions.len() as u64;
    Ok(AggregateResult {
        sessions_processed,
        sessions_already_aggregated: already_aggregated,
        pairs_upserted: pair_counts.len() as u64,
        edges_created,
        complete: sessions_processed < u64::from(request.batch_size),
        next_skip: request.skip_sessions + sessions_processed,
    })
}
