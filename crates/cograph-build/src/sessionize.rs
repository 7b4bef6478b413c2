use std::collections::{BTreeSet, HashMap};
use std::io::Read;

use chrono::{DateTime, NaiveDateTime, Utc};
use cograph_config::SessionizeConfig;
use cograph_core::{InteractionRow, ItemId, SessionId};
use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};

use crate::BuildError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickEvent {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub item_id: ItemId,
}

/// Events parsed from a raw click log, plus the number of lines that could not
/// be turned into an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClickLog {
    pub events: Vec<ClickEvent>,
    pub malformed_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionizeOptions {
    pub min_session_length: usize,
    pub min_item_freq: usize,
}

impl Default for SessionizeOptions {
    fn default() -> Self {
        Self::from_config(&SessionizeConfig::default())
    }
}

impl SessionizeOptions {
    pub fn from_config(config: &SessionizeConfig) -> Self {
        Self {
            min_session_length: config.min_session_length,
            min_item_freq: config.min_item_freq.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionizeReport {
    pub events_in: usize,
    pub sessions_in: usize,
    pub sessions_dropped_short: usize,
    pub events_dropped_rare_items: usize,
    pub sessions_dropped_after_item_filter: usize,
    pub events_out: usize,
    pub sessions_out: usize,
    pub items_out: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sessionized {
    pub rows: Vec<InteractionRow>,
    pub report: SessionizeReport,
}

/// Reads a headerless `session_id,timestamp,item_id[,category]` click log.
///
/// Lines with a blank id or a timestamp that does not parse are counted and
/// skipped; an I/O failure aborts the read.
pub fn read_click_events<R: Read>(reader: R) -> Result<ClickLog, BuildError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut log = ClickLog::default();
    let mut record = StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(true) => match parse_click_record(&record) {
                Some(event) => log.events.push(event),
                None => {
                    log.malformed_rows += 1;
                    tracing::debug!(
                        line = ?record.position().map(|pos| pos.line()),
                        "skipping malformed click row"
                    );
                }
            },
            Ok(false) => break,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                log.malformed_rows += 1;
                tracing::debug!(error = %err, "skipping unreadable click row");
            }
        }
    }

    if log.malformed_rows > 0 {
        tracing::warn!(
            malformed = log.malformed_rows,
            parsed = log.events.len(),
            "click log contained malformed rows"
        );
    }
    Ok(log)
}

fn parse_click_record(record: &StringRecord) -> Option<ClickEvent> {
    let session_id = record.get(0).filter(|value| !value.is_empty())?;
    let timestamp = parse_timestamp(record.get(1)?)?;
    let item_id = record.get(2).filter(|value| !value.is_empty())?;

    Some(ClickEvent {
        session_id: session_id.to_owned(),
        timestamp,
        item_id: item_id.to_owned(),
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    // Offset-less timestamps are read as UTC.
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Orders each session's events by time, applies the length and item
/// frequency filters, and emits one interaction row per surviving event with
/// the following event's item as `next_item_id`.
///
/// Sessions keep the order in which they first appear in `events`; events with
/// equal timestamps keep their input order.
pub fn sessionize(events: Vec<ClickEvent>, options: SessionizeOptions) -> Sessionized {
    let mut report = SessionizeReport {
        events_in: events.len(),
        ..SessionizeReport::default()
    };

    let mut sessions = group_by_session(events);
    report.sessions_in = sessions.len();

    let before = sessions.len();
    sessions.retain(|(_, clicks)| clicks.len() >= options.min_session_length);
    report.sessions_dropped_short = before - sessions.len();

    let mut item_counts = HashMap::<&str, usize>::new();
    for (_, clicks) in &sessions {
        for click in clicks {
            *item_counts.entry(click.item_id.as_str()).or_insert(0) += 1;
        }
    }
    let rare_items = item_counts
        .into_iter()
        .filter(|(_, count)| *count < options.min_item_freq)
        .map(|(item_id, _)| item_id.to_owned())
        .collect::<BTreeSet<_>>();

    for (_, clicks) in &mut sessions {
        let before = clicks.len();
        clicks.retain(|click| !rare_items.contains(&click.item_id));
        report.events_dropped_rare_items += before - clicks.len();
    }

    let before = sessions.len();
    sessions.retain(|(_, clicks)| {
        !clicks.is_empty() && clicks.len() >= options.min_session_length
    });
    report.sessions_dropped_after_item_filter = before - sessions.len();

    let mut rows = Vec::new();
    let mut items_out = BTreeSet::new();
    for (session_id, clicks) in &sessions {
        for (position, click) in clicks.iter().enumerate() {
            items_out.insert(click.item_id.as_str());
            let mut row =
                InteractionRow::new(click.item_id.clone()).with_session(session_id.clone());
            if let Some(next) = clicks.get(position + 1) {
                row = row.with_next(next.item_id.clone());
            }
            rows.push(row);
        }
    }

    report.events_out = rows.len();
    report.sessions_out = sessions.len();
    report.items_out = items_out.len();

    tracing::info!(
        events_in = report.events_in,
        events_out = report.events_out,
        sessions_in = report.sessions_in,
        sessions_out = report.sessions_out,
        items_out = report.items_out,
        "sessionized click events"
    );

    Sessionized { rows, report }
}

fn group_by_session(events: Vec<ClickEvent>) -> Vec<(SessionId, Vec<ClickEvent>)> {
    let mut index = HashMap::<SessionId, usize>::new();
    let mut sessions = Vec::<(SessionId, Vec<ClickEvent>)>::new();

    for event in events {
        let slot = match index.get(&event.session_id) {
            Some(slot) => *slot,
            None => {
                index.insert(event.session_id.clone(), sessions.len());
                sessions.push((event.session_id.clone(), Vec::new()));
                sessions.len() - 1
            }
        };
        sessions[slot].1.push(event);
    }

    for (_, clicks) in &mut sessions {
        clicks.sort_by_key(|click| click.timestamp);
    }
    sessions
}
