//! Deterministic consolidation kernel for review-derived episodes.
//!
//! The inference step that proposes rules is untrusted. This crate holds the
//! pure layer that turns its proposal into something safe to persist:
//! - [`classify`] maps narrative text onto the closed [`PatternKey`] catalog.
//! - [`calibrate_initial`] and [`bound_delta`] keep salience scores in range.
//! - [`sanitize`] validates a [`RawConsolidation`] against the episode set.
//!
//! Nothing here performs I/O or holds state between calls.

pub mod catalog;
pub mod classifier;
pub mod config;
pub mod raw;
pub mod salience;
pub mod sanitize;

use serde::{Deserialize, Serialize};

pub use catalog::{
    catalog, CatalogEntry, PatternKey, SalienceBand, SuperCategory, FALLBACK_PATTERN_KEY,
    PRIORITY_ORDER,
};
pub use classifier::{classify, classify_with_scores, CategoryScore, Classification};
pub use config::{
    parse_min_rule_support, ConsolidationConfig, DEFAULT_MIN_RULE_SUPPORT, MIN_RULE_SUPPORT_ENV,
};
pub use raw::{RawConsolidation, RawContradiction, RawRuleCandidate, RawSalienceUpdate};
pub use salience::{
    bound_delta, bound_salience_updates, calibrate_initial, clamp_score,
    DEFAULT_MAX_SALIENCE_DELTA, MAX_SALIENCE, MIN_SALIENCE,
};
pub use sanitize::{
    group_by_pattern, normalize_triggers, sanitize, sanitize_with_report, ConsolidationResult,
    EpisodeIndex, MergedCandidate, PatternGroup, SanitizeReport, MAX_RULE_TRIGGERS,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown pattern key: {0}")]
    UnknownPatternKey(String),
}

/// Where an episode was extracted from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceRef {
    pub repository: String,
    pub pull_request: Option<u64>,
    pub url: Option<String>,
}

/// A recorded review incident. Authoritative input to consolidation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Episode {
    pub id: String,
    pub title: String,
    pub what_happened: Option<String>,
    pub the_pattern: Option<String>,
    pub the_fix: Option<String>,
    pub why_it_matters: Option<String>,
    pub pattern_key: PatternKey,
    pub salience_score: u8,
    #[serde(default)]
    pub triggers: Vec<String>,
    pub source: Option<SourceRef>,
}

/// An episode as captured, before classification and calibration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewEpisode {
    pub id: Option<String>,
    pub title: String,
    pub what_happened: Option<String>,
    pub the_pattern: Option<String>,
    pub the_fix: Option<String>,
    pub why_it_matters: Option<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    pub raw_salience: f64,
    pub source: Option<SourceRef>,
}

impl NewEpisode {
    /// Checks the fields a stored episode cannot do without.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the title is blank, a supplied
    /// id is blank, or the source repository is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.title.trim().is_empty() {
            return Err(CoreError::Validation("title MUST be provided".to_string()));
        }

        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(CoreError::Validation(
                    "id MUST be non-empty when provided".to_string(),
                ));
            }
        }

        if let Some(source) = &self.source {
            if source.repository.trim().is_empty() {
                return Err(CoreError::Validation(
                    "source repository MUST be non-empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Narrative fields joined in reading order, skipping absent ones.
    #[must_use]
    pub fn narrative_text(&self) -> String {
        join_narrative([
            self.what_happened.as_deref(),
            self.the_pattern.as_deref(),
            self.the_fix.as_deref(),
            self.why_it_matters.as_deref(),
        ])
    }

    /// Validates, classifies and calibrates into a storable [`Episode`].
    ///
    /// `fallback_id` is used when the capture did not carry its own id.
    /// Classification reads every captured trigger; only the stored list is
    /// normalized and capped.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when [`NewEpisode::validate`] fails.
    pub fn encode(self, fallback_id: impl Into<String>) -> Result<Episode, CoreError> {
        self.validate()?;

        let narrative = self.narrative_text();
        let encoded = classify_and_calibrate(
            &self.title,
            Some(narrative.as_str()).filter(|text| !text.is_empty()),
            &self.triggers,
            self.raw_salience,
        );
        let triggers = normalize_triggers(&self.triggers);

        Ok(Episode {
            id: self
                .id
                .map(|id| id.trim().to_string())
                .unwrap_or_else(|| fallback_id.into()),
            title: self.title.trim().to_string(),
            what_happened: self.what_happened,
            the_pattern: self.the_pattern,
            the_fix: self.the_fix,
            why_it_matters: self.why_it_matters,
            pattern_key: encoded.pattern_key,
            salience_score: encoded.salience_score,
            triggers,
            source: self.source,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct EncodedEpisode {
    pub pattern_key: PatternKey,
    pub salience_score: u8,
}

/// Encode-time composition of classification and initial calibration.
#[must_use]
pub fn classify_and_calibrate(
    title: &str,
    narrative: Option<&str>,
    triggers: &[String],
    raw_salience: f64,
) -> EncodedEpisode {
    let pattern_key = classify(Some(title), narrative, triggers);
    EncodedEpisode {
        pattern_key,
        salience_score: calibrate_initial(raw_salience, pattern_key),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Pattern {
    pub pattern_key: PatternKey,
    pub name: String,
    pub episode_ids: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rule {
    pub rule_key: PatternKey,
    pub title: String,
    pub description: String,
    pub triggers: Vec<String>,
    pub source_episode_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Contradiction {
    pub episode_a: String,
    pub episode_b: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SalienceUpdate {
    pub episode_id: String,
    pub score: u8,
    pub reason: String,
}

fn join_narrative<'a>(fields: impl IntoIterator<Item = Option<&'a str>>) -> String {
    fields
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
