use std::collections::BTreeMap;

use crate::catalog::PatternKey;
use crate::{Episode, SalienceUpdate};

pub const MIN_SALIENCE: u8 = 0;
pub const MAX_SALIENCE: u8 = 10;
pub const DEFAULT_MAX_SALIENCE_DELTA: u8 = 3;

/// Clamps an arbitrary score into `[0, 10]` and rounds it. Non-finite input maps to 0.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn clamp_score(value: f64) -> u8 {
    if !value.is_finite() {
        return MIN_SALIENCE;
    }
    value
        .clamp(f64::from(MIN_SALIENCE), f64::from(MAX_SALIENCE))
        .round() as u8
}

/// Initial calibration, applied once when an episode is encoded.
#[must_use]
pub fn calibrate_initial(raw_score: f64, pattern_key: PatternKey) -> u8 {
    pattern_key.salience_band().clamp(clamp_score(raw_score))
}

/// Caps how far a single update may move a live score.
///
/// Does not re-apply the category band: live scores are allowed to leave it
/// over time, only the step size is bounded.
#[must_use]
pub fn bound_delta(current: f64, proposed: f64, max_delta: u8) -> u8 {
    let current = clamp_score(current);
    let proposed = clamp_score(proposed);

    if current.abs_diff(proposed) <= max_delta {
        return proposed;
    }

    if proposed > current {
        current.saturating_add(max_delta).min(MAX_SALIENCE)
    } else {
        current.saturating_sub(max_delta)
    }
}

/// Applies [`bound_delta`] to sanitized updates against each episode's live score.
///
/// Updates for unknown episodes are dropped; the sanitizer already guarantees
/// there are none.
#[must_use]
pub fn bound_salience_updates(
    updates: &[SalienceUpdate],
    episodes: &[Episode],
    max_delta: u8,
) -> Vec<SalienceUpdate> {
    // First occurrence of a duplicated id wins, matching `EpisodeIndex`.
    let mut live_scores: BTreeMap<&str, u8> = BTreeMap::new();
    for episode in episodes {
        live_scores
            .entry(episode.id.as_str())
            .or_insert(episode.salience_score);
    }

    updates
        .iter()
        .filter_map(|update| {
            let current = live_scores.get(update.episode_id.as_str())?;
            let bounded = bound_delta(f64::from(*current), f64::from(update.score), max_delta);
            if bounded != update.score {
                tracing::debug!(
                    episode_id = %update.episode_id,
                    current = *current,
                    proposed = update.score,
                    bounded,
                    "salience update exceeded max delta"
                );
            }
            Some(SalienceUpdate {
                episode_id: update.episode_id.clone(),
                score: bounded,
                reason: update.reason.clone(),
            })
        })
        .collect()
}
