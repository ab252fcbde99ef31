//! The untrusted candidate result proposed by the inference step.
//!
//! Decoding is lenient: anything with the wrong shape is treated as absent
//! rather than rejected, so a half-broken response still yields whatever
//! entries can be salvaged. Validation against the episode set happens later
//! in [`crate::sanitize`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Untrusted consolidation proposal.
///
/// The model's `patterns` field is never decoded: patterns are always
/// recomputed from the episode set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawConsolidation {
    #[serde(default)]
    pub rules_to_promote: Vec<RawRuleCandidate>,
    #[serde(default)]
    pub contradictions: Vec<RawContradiction>,
    #[serde(default)]
    pub salience_updates: Vec<RawSalienceUpdate>,
    #[serde(default)]
    pub prune_candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawRuleCandidate {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub source_episode_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawContradiction {
    pub episode_a: Option<String>,
    pub episode_b: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawSalienceUpdate {
    pub episode_id: Option<String>,
    pub score: Option<f64>,
    pub reason: Option<String>,
}

impl RawConsolidation {
    /// Salvages a candidate from arbitrary JSON. Never fails.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        Self {
            rules_to_promote: objects(object, "rules_to_promote")
                .map(|entry| RawRuleCandidate {
                    title: string_field(entry, "title"),
                    description: string_field(entry, "description"),
                    triggers: string_list(entry.get("triggers")),
                    source_episode_ids: string_list(entry.get("source_episode_ids")),
                })
                .collect(),
            contradictions: objects(object, "contradictions")
                .map(|entry| RawContradiction {
                    episode_a: string_field(entry, "episode_a"),
                    episode_b: string_field(entry, "episode_b"),
                    reason: string_field(entry, "reason"),
                })
                .collect(),
            salience_updates: objects(object, "salience_updates")
                .map(|entry| RawSalienceUpdate {
                    episode_id: string_field(entry, "episode_id"),
                    score: entry.get("score").and_then(number_like),
                    reason: string_field(entry, "reason"),
                })
                .collect(),
            prune_candidates: string_list(object.get("prune_candidates")),
        }
    }

    /// Parses a raw model response body. Malformed JSON yields an empty candidate.
    #[must_use]
    pub fn from_json_str(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::from_value(&value),
            Err(err) => {
                tracing::warn!(%err, "candidate is not valid JSON; treating as empty");
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules_to_promote.is_empty()
            && self.contradictions.is_empty()
            && self.salience_updates.is_empty()
            && self.prune_candidates.is_empty()
    }
}

fn objects<'a>(
    object: &'a Map<String, Value>,
    field: &str,
) -> impl Iterator<Item = &'a Map<String, Value>> {
    object
        .get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn string_field(object: &Map<String, Value>, field: &str) -> Option<String> {
    object.get(field).and_then(Value::as_str).map(str::to_string)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|parsed| parsed.is_finite()),
        _ => None,
    }
}
