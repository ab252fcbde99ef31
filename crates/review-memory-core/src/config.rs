use serde::{Deserialize, Serialize};

use crate::salience::DEFAULT_MAX_SALIENCE_DELTA;

pub const DEFAULT_MIN_RULE_SUPPORT: usize = 2;
pub const MIN_RULE_SUPPORT_ENV: &str = "REVIEW_MEMORY_MIN_RULE_SUPPORT";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsolidationConfig {
    /// Episodes a category needs before it is promoted to a rule.
    pub min_rule_support: usize,
    pub max_salience_delta: u8,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            min_rule_support: DEFAULT_MIN_RULE_SUPPORT,
            max_salience_delta: DEFAULT_MAX_SALIENCE_DELTA,
        }
    }
}

impl ConsolidationConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an environment-style lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            min_rule_support: parse_min_rule_support(lookup(MIN_RULE_SUPPORT_ENV).as_deref()),
            ..Self::default()
        }
    }

    /// Overrides the threshold from a raw value using the same reset rules
    /// as the environment.
    #[must_use]
    pub fn with_min_rule_support(self, raw: &str) -> Self {
        Self {
            min_rule_support: parse_min_rule_support(Some(raw)),
            ..self
        }
    }

    /// Threshold actually applied; a zero set in code falls back to the default.
    #[must_use]
    pub fn effective_min_rule_support(&self) -> usize {
        if self.min_rule_support == 0 {
            DEFAULT_MIN_RULE_SUPPORT
        } else {
            self.min_rule_support
        }
    }
}

/// Non-positive or non-numeric values silently reset to the default.
#[must_use]
pub fn parse_min_rule_support(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return DEFAULT_MIN_RULE_SUPPORT;
    };

    match raw.trim().parse::<i64>() {
        Ok(value) if value > 0 => usize::try_from(value).unwrap_or(DEFAULT_MIN_RULE_SUPPORT),
        _ => {
            tracing::warn!(
                value = raw,
                default = DEFAULT_MIN_RULE_SUPPORT,
                "ignoring invalid {MIN_RULE_SUPPORT_ENV}"
            );
            DEFAULT_MIN_RULE_SUPPORT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_uses_default() {
        let config = ConsolidationConfig::from_lookup(|_| None);
        assert_eq!(config, ConsolidationConfig::default());
        assert_eq!(config.min_rule_support, 2);
        assert_eq!(config.max_salience_delta, 3);
    }

    #[test]
    fn positive_integer_is_accepted() {
        let config = ConsolidationConfig::from_lookup(|name| {
            (name == MIN_RULE_SUPPORT_ENV).then(|| " 4 ".to_string())
        });
        assert_eq!(config.min_rule_support, 4);
    }

    #[test]
    fn invalid_values_reset_to_default() {
        for raw in ["0", "-3", "abc", "2.5", ""] {
            assert_eq!(parse_min_rule_support(Some(raw)), DEFAULT_MIN_RULE_SUPPORT, "{raw}");
        }
    }

    #[test]
    fn override_follows_the_same_rules() {
        let config = ConsolidationConfig::default().with_min_rule_support("3");
        assert_eq!(config.min_rule_support, 3);
        let config = config.with_min_rule_support("nope");
        assert_eq!(config.min_rule_support, DEFAULT_MIN_RULE_SUPPORT);
    }

    #[test]
    fn zero_set_in_code_is_treated_as_unset() {
        let config = ConsolidationConfig {
            min_rule_support: 0,
            ..ConsolidationConfig::default()
        };
        assert_eq!(config.effective_min_rule_support(), DEFAULT_MIN_RULE_SUPPORT);
    }
}
