use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

pub type ItemId = String;
pub type SessionId = String;

/// One raw interaction as produced upstream. Every field is optional on the
/// wire; [`InteractionRow::validate`] decides whether the row can be applied.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InteractionRow {
    #[serde(default, deserialize_with = "deserialize_opaque_id")]
    pub item_id: Option<ItemId>,
    #[serde(
        default,
        deserialize_with = "deserialize_opaque_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_item_id: Option<ItemId>,
    #[serde(
        default,
        deserialize_with = "deserialize_opaque_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<SessionId>,
}

impl InteractionRow {
    pub fn new(item_id: impl Into<ItemId>) -> Self {
        Self {
            item_id: normalize_id(item_id.into()),
            next_item_id: None,
            session_id: None,
        }
    }

    pub fn with_next(mut self, next_item_id: impl Into<ItemId>) -> Self {
        self.next_item_id = normalize_id(next_item_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = normalize_id(session_id.into());
        self
    }

    pub fn validate(&self) -> Result<Interaction, SkipReason> {
        let item_id = self
            .item_id
            .as_deref()
            .and_then(|value| normalize_id(value.to_owned()))
            .ok_or(SkipReason::MissingItemId)?;

        Ok(Interaction {
            item_id,
            next_item_id: self
                .next_item_id
                .as_deref()
                .and_then(|value| normalize_id(value.to_owned())),
            session_id: self
                .session_id
                .as_deref()
                .and_then(|value| normalize_id(value.to_owned())),
        })
    }
}

/// A row that passed validation and can be written to the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interaction {
    pub item_id: ItemId,
    pub next_item_id: Option<ItemId>,
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingItemId,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingItemId => "missing_item_id",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unordered pair of distinct items in canonical orientation:
/// `first < second` under byte-wise lexical order of the item id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemPair {
    first: ItemId,
    second: ItemId,
}

impl ItemPair {
    /// Returns `None` for a self-pair.
    pub fn new(left: impl Into<ItemId>, right: impl Into<ItemId>) -> Option<Self> {
        let left = left.into();
        let right = right.into();
        match left.cmp(&right) {
            std::cmp::Ordering::Less => Some(Self {
                first: left,
                second: right,
            }),
            std::cmp::Ordering::Greater => Some(Self {
                first: right,
                second: left,
            }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn second(&self) -> &str {
        &self.second
    }
}

/// Expands an item set into every canonical unordered pair. Duplicates in the
/// input collapse; the output is sorted.
pub fn canonical_pairs<I, S>(items: I) -> Vec<ItemPair>
where
    I: IntoIterator<Item = S>,
    S: Into<ItemId>,
{
    let mut sorted = items.into_iter().map(Into::into).collect::<Vec<ItemId>>();
    sorted.sort();
    sorted.dedup();

    let mut pairs = Vec::with_capacity(sorted.len() * sorted.len().saturating_sub(1) / 2);
    for left_idx in 0..sorted.len() {
        for right_idx in (left_idx + 1)..sorted.len() {
            pairs.push(ItemPair {
                first: sorted[left_idx].clone(),
                second: sorted[right_idx].clone(),
            });
        }
    }
    pairs
}

pub fn current_unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn normalize_id(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_owned())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OpaqueId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

fn deserialize_opaque_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<OpaqueId>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| match value {
        OpaqueId::Text(text) => normalize_id(text),
        OpaqueId::Signed(number) => Some(number.to_string()),
        OpaqueId::Unsigned(number) => Some(number.to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_pair_orients_both_directions_identically() {
        let forward = ItemPair::new("b", "a").expect("distinct pair");
        let backward = ItemPair::new("a", "b").expect("distinct pair");

        assert_eq!(forward, backward);
        assert_eq!(forward.first(), "a");
        assert_eq!(forward.second(), "b");
        assert!(ItemPair::new("a", "a").is_none());
    }

    #[test]
    fn item_pair_uses_lexical_not_numeric_order() {
        let pair = ItemPair::new("9", "10").expect("distinct pair");
        assert_eq!(pair.first(), "10");
        assert_eq!(pair.second(), "9");
    }

    #[test]
    fn canonical_pairs_dedups_and_expands_all_pairs() {
        let pairs = canonical_pairs(["c", "a", "b", "a"]);
        let rendered = pairs
            .iter()
            .map(|pair| format!("{}-{}", pair.first(), pair.second()))
            .collect::<Vec<_>>();

        assert_eq!(rendered, vec!["a-b", "a-c", "b-c"]);
        assert!(canonical_pairs(["only"]).is_empty());
        assert_eq!(canonical_pairs((0..6).map(|n| n.to_string())).len(), 15);
    }

    #[test]
    fn rows_deserialize_string_and_integer_ids() {
        let rows: Vec<InteractionRow> = serde_json::from_str(
            r#"[
                {"item_id": 214536502, "next_item_id": "214536500", "session_id": 1},
                {"item_id": "A", "next_item_id": null},
                {"item_id": "  ", "session_id": ""},
                {"next_item_id": "B"}
            ]"#,
        )
        .expect("parse rows");

        assert_eq!(
            rows[0],
            InteractionRow::new("214536502")
                .with_next("214536500")
                .with_session("1")
        );
        assert_eq!(rows[1], InteractionRow::new("A"));
        assert_eq!(rows[2].item_id, None);
        assert_eq!(rows[2].session_id, None);
        assert_eq!(rows[3].item_id, None);
    }

    #[test]
    fn validate_rejects_missing_item_and_trims_optional_fields() {
        let missing = InteractionRow {
            item_id: None,
            next_item_id: Some("B".to_owned()),
            session_id: None,
        };
        assert_eq!(missing.validate(), Err(SkipReason::MissingItemId));

        let padded = InteractionRow {
            item_id: Some(" A ".to_owned()),
            next_item_id: Some("   ".to_owned()),
            session_id: Some("S1".to_owned()),
        };
        assert_eq!(
            padded.validate(),
            Ok(Interaction {
                item_id: "A".to_owned(),
                next_item_id: None,
                session_id: Some("S1".to_owned()),
            })
        );
    }
}
