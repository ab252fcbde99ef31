use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::catalog::PatternKey;
use crate::classifier::classify;
use crate::config::ConsolidationConfig;
use crate::raw::{RawConsolidation, RawContradiction, RawRuleCandidate, RawSalienceUpdate};
use crate::salience::clamp_score;
use crate::{Contradiction, Episode, Pattern, Rule, SalienceUpdate};

pub const MAX_RULE_TRIGGERS: usize = 12;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidationResult {
    pub patterns: Vec<Pattern>,
    pub rules_to_promote: Vec<Rule>,
    pub contradictions: Vec<Contradiction>,
    pub salience_updates: Vec<SalienceUpdate>,
    pub prune_candidates: Vec<String>,
}

impl ConsolidationResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
            && self.rules_to_promote.is_empty()
            && self.contradictions.is_empty()
            && self.salience_updates.is_empty()
            && self.prune_candidates.is_empty()
    }
}

/// Counts of what the sanitizer discarded from the candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitizeReport {
    pub rule_candidates_dropped: usize,
    pub rule_candidates_below_threshold: usize,
    pub membership_claims_ignored: usize,
    pub contradictions_dropped: usize,
    pub salience_updates_dropped: usize,
    pub salience_updates_superseded: usize,
    pub prune_candidates_dropped: usize,
}

/// Authoritative id lookup. Duplicate ids keep their first occurrence.
#[derive(Debug, Clone)]
pub struct EpisodeIndex<'a> {
    ordered: Vec<&'a Episode>,
    by_id: BTreeMap<&'a str, &'a Episode>,
}

impl<'a> EpisodeIndex<'a> {
    #[must_use]
    pub fn new(episodes: &'a [Episode]) -> Self {
        let mut ordered = Vec::with_capacity(episodes.len());
        let mut by_id = BTreeMap::new();
        for episode in episodes {
            if by_id.contains_key(episode.id.as_str()) {
                continue;
            }
            by_id.insert(episode.id.as_str(), episode);
            ordered.push(episode);
        }
        Self { ordered, by_id }
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&'a Episode> {
        self.by_id.get(id).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Episodes sharing one pattern key, in episode input order.
#[derive(Debug, Clone)]
pub struct PatternGroup<'a> {
    pub pattern_key: PatternKey,
    pub episodes: Vec<&'a Episode>,
}

impl PatternGroup<'_> {
    #[must_use]
    pub fn episode_ids(&self) -> Vec<String> {
        self.episodes.iter().map(|episode| episode.id.clone()).collect()
    }
}

/// Candidates merged per resolved category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedCandidate {
    pub triggers: Vec<String>,
    /// Union of the model-proposed ids. Bookkeeping only: rule membership
    /// always comes from the deterministic group.
    pub source_episode_ids: Vec<String>,
}

/// Validates an untrusted candidate against the authoritative episode set.
#[must_use]
pub fn sanitize(
    raw: &RawConsolidation,
    episodes: &[Episode],
    config: &ConsolidationConfig,
) -> ConsolidationResult {
    let (result, report) = sanitize_with_report(raw, episodes, config);
    tracing::debug!(
        patterns = result.patterns.len(),
        rules = result.rules_to_promote.len(),
        contradictions = result.contradictions.len(),
        salience_updates = result.salience_updates.len(),
        prune_candidates = result.prune_candidates.len(),
        rule_candidates_dropped = report.rule_candidates_dropped,
        rule_candidates_below_threshold = report.rule_candidates_below_threshold,
        membership_claims_ignored = report.membership_claims_ignored,
        contradictions_dropped = report.contradictions_dropped,
        salience_updates_dropped = report.salience_updates_dropped,
        salience_updates_superseded = report.salience_updates_superseded,
        prune_candidates_dropped = report.prune_candidates_dropped,
        "sanitized consolidation candidate"
    );
    result
}

#[must_use]
pub fn sanitize_with_report(
    raw: &RawConsolidation,
    episodes: &[Episode],
    config: &ConsolidationConfig,
) -> (ConsolidationResult, SanitizeReport) {
    let index = EpisodeIndex::new(episodes);
    if index.is_empty() {
        return (ConsolidationResult::default(), SanitizeReport::default());
    }

    let mut report = SanitizeReport::default();
    let groups = group_by_pattern(&index);
    let merged = merge_rule_candidates(&raw.rules_to_promote, &index, &mut report);

    let result = ConsolidationResult {
        patterns: build_patterns(&groups),
        rules_to_promote: build_rules(
            &groups,
            &merged,
            config.effective_min_rule_support(),
            &mut report,
        ),
        contradictions: validate_contradictions(&raw.contradictions, &index, &mut report),
        salience_updates: validate_salience_updates(&raw.salience_updates, &index, &mut report),
        prune_candidates: validate_prune_candidates(&raw.prune_candidates, &index, &mut report),
    };

    (result, report)
}

/// Groups episodes by their assigned key. Largest group first, ties by key string.
#[must_use]
pub fn group_by_pattern<'a>(index: &EpisodeIndex<'a>) -> Vec<PatternGroup<'a>> {
    let mut grouped: BTreeMap<PatternKey, Vec<&'a Episode>> = BTreeMap::new();
    for episode in index.ordered.iter().copied() {
        grouped.entry(episode.pattern_key).or_default().push(episode);
    }

    let mut groups: Vec<PatternGroup<'a>> = grouped
        .into_iter()
        .map(|(pattern_key, episodes)| PatternGroup {
            pattern_key,
            episodes,
        })
        .collect();
    groups.sort_by_key(|group| (Reverse(group.episodes.len()), group.pattern_key.as_str()));
    groups
}

/// Lowercases, trims, drops empties and duplicates, then caps the list.
#[must_use]
pub fn normalize_triggers<I, S>(triggers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut normalized = Vec::new();
    for trigger in triggers {
        if normalized.len() == MAX_RULE_TRIGGERS {
            break;
        }
        let value = trigger.as_ref().trim().to_lowercase();
        if value.is_empty() || !seen.insert(value.clone()) {
            continue;
        }
        normalized.push(value);
    }
    normalized
}

fn build_patterns(groups: &[PatternGroup<'_>]) -> Vec<Pattern> {
    groups
        .iter()
        .map(|group| Pattern {
            pattern_key: group.pattern_key,
            name: group.pattern_key.label().to_string(),
            episode_ids: group.episode_ids(),
            summary: pattern_summary(group.pattern_key, group.episodes.len()),
        })
        .collect()
}

fn pattern_summary(pattern_key: PatternKey, count: usize) -> String {
    if count == 1 {
        format!("{}: 1 episode shares this pattern.", pattern_key.label())
    } else {
        format!("{}: {count} episodes share this pattern.", pattern_key.label())
    }
}

/// Resolves each candidate to a category and merges candidates that collide.
///
/// Candidates whose source ids are all unknown are dropped.
fn merge_rule_candidates(
    candidates: &[RawRuleCandidate],
    index: &EpisodeIndex<'_>,
    report: &mut SanitizeReport,
) -> BTreeMap<PatternKey, MergedCandidate> {
    let mut merged: BTreeMap<PatternKey, MergedCandidate> = BTreeMap::new();

    for candidate in candidates {
        let known_ids: Vec<&str> = candidate
            .source_episode_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| index.contains(id))
            .collect();
        if known_ids.is_empty() {
            report.rule_candidates_dropped += 1;
            continue;
        }

        let pattern_key = resolve_candidate_key(candidate, &known_ids, index);
        let entry = merged.entry(pattern_key).or_default();
        entry.triggers = normalize_triggers(entry.triggers.iter().chain(&candidate.triggers));
        for id in known_ids {
            if !entry.source_episode_ids.iter().any(|existing| existing == id) {
                entry.source_episode_ids.push(id.to_string());
            }
        }
    }

    merged
}

/// Majority key among the candidate's source episodes, ties by key string.
fn resolve_candidate_key(
    candidate: &RawRuleCandidate,
    known_ids: &[&str],
    index: &EpisodeIndex<'_>,
) -> PatternKey {
    let mut support: BTreeMap<PatternKey, usize> = BTreeMap::new();
    let mut counted = BTreeSet::new();
    for id in known_ids {
        if !counted.insert(*id) {
            continue;
        }
        if let Some(episode) = index.get(id) {
            *support.entry(episode.pattern_key).or_default() += 1;
        }
    }

    let best = support
        .into_iter()
        .max_by_key(|(key, count)| (*count, Reverse(key.as_str())));

    match best {
        Some((key, _)) => key,
        None => classify(
            candidate.title.as_deref(),
            candidate.description.as_deref(),
            &candidate.triggers,
        ),
    }
}

fn build_rules(
    groups: &[PatternGroup<'_>],
    merged: &BTreeMap<PatternKey, MergedCandidate>,
    min_rule_support: usize,
    report: &mut SanitizeReport,
) -> Vec<Rule> {
    let mut rules = Vec::new();

    for group in groups {
        if group.episodes.len() < min_rule_support {
            continue;
        }

        let candidate = merged.get(&group.pattern_key);
        let members = group.episode_ids();
        if let Some(candidate) = candidate {
            report.membership_claims_ignored += candidate
                .source_episode_ids
                .iter()
                .filter(|id| !members.contains(id))
                .count();
        }

        let candidate_triggers = candidate
            .map(|merged| merged.triggers.as_slice())
            .unwrap_or_default();
        let episode_triggers = group
            .episodes
            .iter()
            .flat_map(|episode| episode.triggers.iter());
        let mut triggers = normalize_triggers(candidate_triggers.iter().chain(episode_triggers));
        if triggers.is_empty() {
            triggers.push(group.pattern_key.as_str().to_string());
        }

        rules.push(Rule {
            rule_key: group.pattern_key,
            title: group.pattern_key.rule_title().to_string(),
            description: group.pattern_key.rule_description().to_string(),
            triggers,
            source_episode_ids: members,
        });
    }

    report.rule_candidates_below_threshold = merged
        .keys()
        .filter(|key| {
            !groups
                .iter()
                .any(|group| group.pattern_key == **key && group.episodes.len() >= min_rule_support)
        })
        .count();

    rules
}

fn validate_contradictions(
    contradictions: &[RawContradiction],
    index: &EpisodeIndex<'_>,
    report: &mut SanitizeReport,
) -> Vec<Contradiction> {
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    let mut valid = Vec::new();

    for raw in contradictions {
        let (Some(episode_a), Some(episode_b)) = (raw.episode_a.as_deref(), raw.episode_b.as_deref())
        else {
            report.contradictions_dropped += 1;
            continue;
        };
        let episode_a = episode_a.trim();
        let episode_b = episode_b.trim();
        let reason = raw.reason.as_deref().map(str::trim).unwrap_or_default();

        if !index.contains(episode_a)
            || !index.contains(episode_b)
            || episode_a == episode_b
            || reason.is_empty()
        {
            report.contradictions_dropped += 1;
            continue;
        }

        let pair = if episode_a < episode_b {
            (episode_a.to_string(), episode_b.to_string())
        } else {
            (episode_b.to_string(), episode_a.to_string())
        };
        if !seen.insert(pair) {
            report.contradictions_dropped += 1;
            continue;
        }

        valid.push(Contradiction {
            episode_a: episode_a.to_string(),
            episode_b: episode_b.to_string(),
            reason: reason.to_string(),
        });
    }

    valid
}

/// Last valid update per episode wins; output is ordered by episode id.
fn validate_salience_updates(
    updates: &[RawSalienceUpdate],
    index: &EpisodeIndex<'_>,
    report: &mut SanitizeReport,
) -> Vec<SalienceUpdate> {
    let mut accepted = 0_usize;
    let latest = updates
        .iter()
        .filter_map(|raw| {
            let episode_id = raw.episode_id.as_deref().map(str::trim)?;
            let reason = raw.reason.as_deref().map(str::trim)?;
            let score = raw.score?;
            if !index.contains(episode_id) || reason.is_empty() {
                return None;
            }
            Some(SalienceUpdate {
                episode_id: episode_id.to_string(),
                score: clamp_score(score),
                reason: reason.to_string(),
            })
        })
        .fold(BTreeMap::new(), |mut latest, update| {
            accepted += 1;
            latest.insert(update.episode_id.clone(), update);
            latest
        });

    report.salience_updates_dropped = updates.len() - accepted;
    report.salience_updates_superseded = accepted - latest.len();
    latest.into_values().collect()
}

fn validate_prune_candidates(
    candidates: &[String],
    index: &EpisodeIndex<'_>,
    report: &mut SanitizeReport,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut valid = Vec::new();
    for candidate in candidates {
        let id = candidate.trim();
        if index.contains(id) && seen.insert(id) {
            valid.push(id.to_string());
        } else {
            report.prune_candidates_dropped += 1;
        }
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn episode(id: &str, pattern_key: PatternKey, triggers: &[&str]) -> Episode {
        Episode {
            id: id.to_string(),
            title: format!("episode {id}"),
            what_happened: None,
            the_pattern: None,
            the_fix: None,
            why_it_matters: None,
            pattern_key,
            salience_score: 5,
            triggers: triggers.iter().map(|value| (*value).to_string()).collect(),
            source: None,
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    fn candidate(source_ids: &[&str], triggers: &[&str]) -> RawRuleCandidate {
        RawRuleCandidate {
            title: Some("Model proposed title".to_string()),
            description: Some("Model proposed description".to_string()),
            triggers: ids(triggers),
            source_episode_ids: ids(source_ids),
        }
    }

    fn contradiction(a: &str, b: &str, reason: &str) -> RawContradiction {
        RawContradiction {
            episode_a: Some(a.to_string()),
            episode_b: Some(b.to_string()),
            reason: Some(reason.to_string()),
        }
    }

    fn update(id: &str, score: f64, reason: &str) -> RawSalienceUpdate {
        RawSalienceUpdate {
            episode_id: Some(id.to_string()),
            score: Some(score),
            reason: Some(reason.to_string()),
        }
    }

    fn scenario_episodes() -> Vec<Episode> {
        vec![
            episode("e1", PatternKey::RetryStrategy, &[]),
            episode("e2", PatternKey::RetryStrategy, &[]),
            episode("e3", PatternKey::ReviewHygiene, &[]),
        ]
    }

    #[test]
    fn scenario_groups_and_promotes_above_threshold() {
        let result = sanitize(
            &RawConsolidation::default(),
            &scenario_episodes(),
            &ConsolidationConfig::default(),
        );

        assert_eq!(result.patterns.len(), 2);
        assert_eq!(result.patterns[0].pattern_key, PatternKey::RetryStrategy);
        assert_eq!(result.patterns[0].episode_ids, ids(&["e1", "e2"]));
        assert_eq!(result.patterns[0].name, "Retry strategy");
        assert_eq!(
            result.patterns[0].summary,
            "Retry strategy: 2 episodes share this pattern."
        );
        assert_eq!(result.patterns[1].pattern_key, PatternKey::ReviewHygiene);
        assert_eq!(result.patterns[1].episode_ids, ids(&["e3"]));

        assert_eq!(result.rules_to_promote.len(), 1);
        let rule = &result.rules_to_promote[0];
        assert_eq!(rule.rule_key, PatternKey::RetryStrategy);
        assert_eq!(rule.source_episode_ids, ids(&["e1", "e2"]));
        assert_eq!(rule.title, PatternKey::RetryStrategy.rule_title());
        assert_eq!(rule.triggers, ids(&["retry-strategy"]));
    }

    #[test]
    fn empty_episode_set_short_circuits() {
        let raw = RawConsolidation {
            rules_to_promote: vec![candidate(&["e1"], &["x"])],
            contradictions: vec![contradiction("e1", "e2", "x")],
            salience_updates: vec![update("e1", 5.0, "x")],
            prune_candidates: ids(&["e1"]),
        };
        let (result, report) = sanitize_with_report(&raw, &[], &ConsolidationConfig::default());
        assert!(result.is_empty());
        assert_eq!(report, SanitizeReport::default());
    }

    #[test]
    fn pattern_ties_sort_by_key_string() {
        let episodes = vec![
            episode("a", PatternKey::TimeoutHandling, &[]),
            episode("b", PatternKey::ApiContract, &[]),
            episode("c", PatternKey::NullSafety, &[]),
            episode("d", PatternKey::NullSafety, &[]),
        ];
        let result = sanitize(
            &RawConsolidation::default(),
            &episodes,
            &ConsolidationConfig::default(),
        );
        let order: Vec<PatternKey> = result.patterns.iter().map(|p| p.pattern_key).collect();
        assert_eq!(
            order,
            vec![
                PatternKey::NullSafety,
                PatternKey::ApiContract,
                PatternKey::TimeoutHandling
            ]
        );
    }

    #[test]
    fn threshold_gates_rules_but_not_patterns() {
        let episodes = vec![
            episode("a1", PatternKey::ErrorHandling, &[]),
            episode("a2", PatternKey::ErrorHandling, &[]),
            episode("b1", PatternKey::NullSafety, &[]),
            episode("b2", PatternKey::NullSafety, &[]),
            episode("b3", PatternKey::NullSafety, &[]),
        ];
        let config = ConsolidationConfig::default().with_min_rule_support("3");
        let result = sanitize(&RawConsolidation::default(), &episodes, &config);

        assert_eq!(result.patterns.len(), 2);
        assert_eq!(result.rules_to_promote.len(), 1);
        assert_eq!(result.rules_to_promote[0].rule_key, PatternKey::NullSafety);
    }

    #[test]
    fn rule_membership_is_the_deterministic_group() {
        let episodes = vec![
            episode("e1", PatternKey::RetryStrategy, &[]),
            episode("e2", PatternKey::RetryStrategy, &[]),
            episode("e3", PatternKey::RetryStrategy, &[]),
            episode("e4", PatternKey::RetryStrategy, &[]),
            episode("h1", PatternKey::ReviewHygiene, &[]),
        ];
        let raw = RawConsolidation {
            rules_to_promote: vec![
                candidate(&["e1", "e2"], &["Backoff"]),
                candidate(&["e2", "e3", "h1"], &["jitter"]),
            ],
            ..RawConsolidation::default()
        };

        let (result, report) =
            sanitize_with_report(&raw, &episodes, &ConsolidationConfig::default());

        assert_eq!(result.rules_to_promote.len(), 1);
        let rule = &result.rules_to_promote[0];
        assert_eq!(rule.rule_key, PatternKey::RetryStrategy);
        assert_eq!(rule.source_episode_ids, ids(&["e1", "e2", "e3", "e4"]));
        assert_eq!(rule.title, PatternKey::RetryStrategy.rule_title());
        assert_eq!(rule.description, PatternKey::RetryStrategy.rule_description());
        assert_eq!(rule.triggers, ids(&["backoff", "jitter"]));
        assert_eq!(report.membership_claims_ignored, 1);
    }

    #[test]
    fn merged_candidate_keeps_bookkeeping_union() {
        let episodes = vec![
            episode("e1", PatternKey::RetryStrategy, &[]),
            episode("e2", PatternKey::RetryStrategy, &[]),
            episode("e3", PatternKey::RetryStrategy, &[]),
        ];
        let index = EpisodeIndex::new(&episodes);
        let mut report = SanitizeReport::default();
        let merged = merge_rule_candidates(
            &[candidate(&["e1", "e2"], &["a"]), candidate(&["e2", "e3", "ghost"], &["b"])],
            &index,
            &mut report,
        );

        assert_eq!(merged.len(), 1);
        let retry = merged.get(&PatternKey::RetryStrategy);
        assert_eq!(
            retry.map(|entry| entry.source_episode_ids.clone()),
            Some(ids(&["e1", "e2", "e3"]))
        );
        assert_eq!(retry.map(|entry| entry.triggers.clone()), Some(ids(&["a", "b"])));
    }

    #[test]
    fn candidate_category_uses_majority_then_key_string() {
        let episodes = vec![
            episode("r1", PatternKey::RetryStrategy, &[]),
            episode("t1", PatternKey::TimeoutHandling, &[]),
            episode("t2", PatternKey::TimeoutHandling, &[]),
        ];
        let index = EpisodeIndex::new(&episodes);

        let majority = resolve_candidate_key(&candidate(&[], &[]), &["r1", "t1", "t2"], &index);
        assert_eq!(majority, PatternKey::TimeoutHandling);

        // One each: "retry-strategy" < "timeout-handling".
        let tie = resolve_candidate_key(&candidate(&[], &[]), &["t1", "r1"], &index);
        assert_eq!(tie, PatternKey::RetryStrategy);

        let repeated = resolve_candidate_key(&candidate(&[], &[]), &["r1", "r1", "t1"], &index);
        assert_eq!(repeated, PatternKey::RetryStrategy);
    }

    #[test]
    fn candidate_without_known_ids_falls_back_to_classifier() {
        let episodes = vec![episode("e1", PatternKey::RetryStrategy, &[])];
        let index = EpisodeIndex::new(&episodes);
        let raw = RawRuleCandidate {
            title: Some("Mutex held across await causes deadlock".to_string()),
            description: None,
            triggers: Vec::new(),
            source_episode_ids: Vec::new(),
        };
        assert_eq!(
            resolve_candidate_key(&raw, &[], &index),
            PatternKey::ConcurrencySafety
        );
    }

    #[test]
    fn candidates_with_only_dangling_ids_are_dropped() {
        let episodes = scenario_episodes();
        let raw = RawConsolidation {
            rules_to_promote: vec![candidate(&["ghost", "phantom"], &["retry"])],
            ..RawConsolidation::default()
        };
        let (result, report) =
            sanitize_with_report(&raw, &episodes, &ConsolidationConfig::default());
        assert_eq!(report.rule_candidates_dropped, 1);
        assert_eq!(result.rules_to_promote[0].triggers, ids(&["retry-strategy"]));
    }

    #[test]
    fn below_threshold_candidates_do_not_create_rules() {
        let episodes = scenario_episodes();
        let raw = RawConsolidation {
            rules_to_promote: vec![candidate(&["e3"], &["typo"])],
            ..RawConsolidation::default()
        };
        let (result, report) =
            sanitize_with_report(&raw, &episodes, &ConsolidationConfig::default());
        assert!(result
            .rules_to_promote
            .iter()
            .all(|rule| rule.rule_key != PatternKey::ReviewHygiene));
        assert_eq!(report.rule_candidates_below_threshold, 1);
    }

    #[test]
    fn rule_triggers_union_candidate_and_episode_triggers() {
        let episodes = vec![
            episode("e1", PatternKey::TimeoutHandling, &["Deadline ", "timeout"]),
            episode("e2", PatternKey::TimeoutHandling, &["TIMEOUT", ""]),
        ];
        let raw = RawConsolidation {
            rules_to_promote: vec![candidate(&["e1"], &["hang", "deadline"])],
            ..RawConsolidation::default()
        };
        let result = sanitize(&raw, &episodes, &ConsolidationConfig::default());
        assert_eq!(
            result.rules_to_promote[0].triggers,
            ids(&["hang", "deadline", "timeout"])
        );
    }

    #[test]
    fn triggers_are_capped_at_twelve() {
        let many: Vec<String> = (0..30).map(|n| format!("Trigger-{n}")).collect();
        let normalized = normalize_triggers(&many);
        assert_eq!(normalized.len(), MAX_RULE_TRIGGERS);
        assert_eq!(normalized[0], "trigger-0");

        let sparse = normalize_triggers(["", "  ", "A", "a", " a "]);
        assert_eq!(sparse, ids(&["a"]));
    }

    #[test]
    fn contradictions_dedupe_symmetric_pairs() {
        let raw = RawConsolidation {
            contradictions: vec![
                contradiction("e1", "e2", "  x  "),
                contradiction("e2", "e1", "y"),
            ],
            ..RawConsolidation::default()
        };
        let result = sanitize(&raw, &scenario_episodes(), &ConsolidationConfig::default());
        assert_eq!(result.contradictions.len(), 1);
        assert_eq!(result.contradictions[0].reason, "x");
        assert_eq!(result.contradictions[0].episode_a, "e1");
    }

    #[test]
    fn invalid_contradictions_are_dropped() {
        let raw = RawConsolidation {
            contradictions: vec![
                contradiction("e1", "e1", "self"),
                contradiction("e1", "ghost", "dangling"),
                contradiction("e1", "e3", "   "),
                RawContradiction {
                    episode_a: Some("e1".to_string()),
                    episode_b: None,
                    reason: Some("half".to_string()),
                },
                contradiction("e3", "e2", "kept"),
                contradiction("e2", "e1", "  "),
                contradiction("e1", "e2", "valid after blank"),
            ],
            ..RawConsolidation::default()
        };
        let (result, report) =
            sanitize_with_report(&raw, &scenario_episodes(), &ConsolidationConfig::default());
        assert_eq!(result.contradictions.len(), 2);
        assert_eq!(result.contradictions[0].reason, "kept");
        assert_eq!(result.contradictions[1].reason, "valid after blank");
        assert_eq!(result.contradictions[1].episode_a, "e1");
        assert_eq!(report.contradictions_dropped, 5);
    }

    #[test]
    fn salience_last_write_wins() {
        let raw = RawConsolidation {
            salience_updates: vec![
                update("e2", 4.0, "first"),
                update("e1", 12.0, "clamped"),
                update("e2", 9.0, "second"),
                update("e2", 1.0, "  "),
                update("ghost", 3.0, "dangling"),
            ],
            ..RawConsolidation::default()
        };
        let (result, report) =
            sanitize_with_report(&raw, &scenario_episodes(), &ConsolidationConfig::default());

        assert_eq!(result.salience_updates.len(), 2);
        assert_eq!(result.salience_updates[0].episode_id, "e1");
        assert_eq!(result.salience_updates[0].score, 10);
        assert_eq!(result.salience_updates[1].episode_id, "e2");
        assert_eq!(result.salience_updates[1].score, 9);
        assert_eq!(result.salience_updates[1].reason, "second");
        assert_eq!(report.salience_updates_dropped, 2);
        assert_eq!(report.salience_updates_superseded, 1);
    }

    #[test]
    fn prune_candidates_are_deduped_and_filtered() {
        let raw = RawConsolidation {
            prune_candidates: ids(&["e3", "ghost", "e1", "e3"]),
            ..RawConsolidation::default()
        };
        let result = sanitize(&raw, &scenario_episodes(), &ConsolidationConfig::default());
        assert_eq!(result.prune_candidates, ids(&["e3", "e1"]));
    }

    #[test]
    fn model_patterns_are_ignored() {
        let value = serde_json::json!({
            "patterns": [{"name": "made up", "episode_ids": ["ghost"]}],
        });
        let raw = RawConsolidation::from_value(&value);
        let result = sanitize(&raw, &scenario_episodes(), &ConsolidationConfig::default());
        assert_eq!(result.patterns.len(), 2);
        assert!(result
            .patterns
            .iter()
            .all(|pattern| !pattern.episode_ids.contains(&"ghost".to_string())));
    }

    fn arb_key() -> impl Strategy<Value = PatternKey> {
        (0_usize..PatternKey::ALL.len()).prop_map(|index| PatternKey::ALL[index])
    }

    fn arb_id() -> impl Strategy<Value = String> {
        prop_oneof![
            (0_u8..6).prop_map(|n| format!("e{n}")),
            (0_u8..4).prop_map(|n| format!("ghost{n}")),
        ]
    }

    fn arb_raw() -> impl Strategy<Value = RawConsolidation> {
        (
            prop::collection::vec(
                (prop::collection::vec(arb_id(), 0..4), prop::collection::vec("[a-z]{0,6}", 0..4)),
                0..4,
            ),
            prop::collection::vec((arb_id(), arb_id(), "[a-z ]{0,4}"), 0..6),
            prop::collection::vec((arb_id(), -5.0_f64..20.0, "[a-z ]{0,4}"), 0..6),
            prop::collection::vec(arb_id(), 0..6),
        )
            .prop_map(|(rules, contradictions, updates, prune)| RawConsolidation {
                rules_to_promote: rules
                    .into_iter()
                    .map(|(source_episode_ids, triggers)| RawRuleCandidate {
                        title: None,
                        description: None,
                        triggers,
                        source_episode_ids,
                    })
                    .collect(),
                contradictions: contradictions
                    .into_iter()
                    .map(|(a, b, reason)| contradiction(&a, &b, &reason))
                    .collect(),
                salience_updates: updates
                    .into_iter()
                    .map(|(id, score, reason)| update(&id, score, &reason))
                    .collect(),
                prune_candidates: prune,
            })
    }

    proptest! {
        #[test]
        fn prop_output_never_references_unknown_ids(
            keys in prop::collection::vec(arb_key(), 0..6),
            raw in arb_raw(),
        ) {
            let episodes: Vec<Episode> = keys
                .iter()
                .enumerate()
                .map(|(n, key)| episode(&format!("e{n}"), *key, &[]))
                .collect();
            let known: BTreeSet<String> = episodes.iter().map(|e| e.id.clone()).collect();

            let result = sanitize(&raw, &episodes, &ConsolidationConfig::default());

            for rule in &result.rules_to_promote {
                prop_assert!(rule.source_episode_ids.iter().all(|id| known.contains(id)));
                prop_assert!(rule.source_episode_ids.len() >= 2);
                prop_assert!(!rule.triggers.is_empty() && rule.triggers.len() <= MAX_RULE_TRIGGERS);
            }
            for item in &result.contradictions {
                prop_assert!(known.contains(&item.episode_a) && known.contains(&item.episode_b));
                prop_assert_ne!(&item.episode_a, &item.episode_b);
            }
            for item in &result.salience_updates {
                prop_assert!(known.contains(&item.episode_id));
                prop_assert!(item.score <= 10);
            }
            prop_assert!(result.prune_candidates.iter().all(|id| known.contains(id)));

            let keys_in_rules: BTreeSet<PatternKey> =
                result.rules_to_promote.iter().map(|rule| rule.rule_key).collect();
            prop_assert_eq!(keys_in_rules.len(), result.rules_to_promote.len());
        }
    }
}
