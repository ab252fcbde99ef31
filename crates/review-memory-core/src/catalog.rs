//! The closed catalog of pattern keys.
//!
//! Every episode and every promoted rule is keyed by exactly one
//! [`PatternKey`]. The catalog fixes, per key, the human label, the canonical
//! rule text, the presentation group and the salience band that initial
//! calibration clamps into.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKey {
    SecretManagement,
    SensitiveLogging,
    AuthTokenHandling,
    AuthorizationChecks,
    InputValidation,
    DataMigration,
    ConcurrencySafety,
    ErrorHandling,
    TimeoutHandling,
    RetryStrategy,
    ResourceCleanup,
    NullSafety,
    ApiContract,
    QueryPerformance,
    TestCoverage,
    NamingClarity,
    ReviewHygiene,
    GeneralQuality,
}

/// Hand-authored tie-break order for the classifier. Earlier wins.
///
/// Severity first, hygiene last. This is intentionally not the lexical order
/// of the key strings.
pub const PRIORITY_ORDER: &[PatternKey] = &[
    PatternKey::SecretManagement,
    PatternKey::SensitiveLogging,
    PatternKey::AuthTokenHandling,
    PatternKey::AuthorizationChecks,
    PatternKey::InputValidation,
    PatternKey::DataMigration,
    PatternKey::ConcurrencySafety,
    PatternKey::ErrorHandling,
    PatternKey::TimeoutHandling,
    PatternKey::RetryStrategy,
    PatternKey::ResourceCleanup,
    PatternKey::NullSafety,
    PatternKey::ApiContract,
    PatternKey::QueryPerformance,
    PatternKey::TestCoverage,
    PatternKey::NamingClarity,
    PatternKey::ReviewHygiene,
    PatternKey::GeneralQuality,
];

/// Category returned when no keyword matcher fires.
pub const FALLBACK_PATTERN_KEY: PatternKey = PatternKey::GeneralQuality;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuperCategory {
    Security,
    Reliability,
    Correctness,
    Maintainability,
}

impl SuperCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Reliability => "reliability",
            Self::Correctness => "correctness",
            Self::Maintainability => "maintainability",
        }
    }
}

/// Inclusive salience range a category may start in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct SalienceBand {
    pub min: u8,
    pub max: u8,
}

impl SalienceBand {
    #[must_use]
    pub fn clamp(self, score: u8) -> u8 {
        score.clamp(self.min, self.max)
    }
}

impl PatternKey {
    pub const ALL: [Self; 18] = [
        Self::SecretManagement,
        Self::SensitiveLogging,
        Self::AuthTokenHandling,
        Self::AuthorizationChecks,
        Self::InputValidation,
        Self::DataMigration,
        Self::ConcurrencySafety,
        Self::ErrorHandling,
        Self::TimeoutHandling,
        Self::RetryStrategy,
        Self::ResourceCleanup,
        Self::NullSafety,
        Self::ApiContract,
        Self::QueryPerformance,
        Self::TestCoverage,
        Self::NamingClarity,
        Self::ReviewHygiene,
        Self::GeneralQuality,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SecretManagement => "secret-management",
            Self::SensitiveLogging => "sensitive-logging",
            Self::AuthTokenHandling => "auth-token-handling",
            Self::AuthorizationChecks => "authorization-checks",
            Self::InputValidation => "input-validation",
            Self::DataMigration => "data-migration",
            Self::ConcurrencySafety => "concurrency-safety",
            Self::ErrorHandling => "error-handling",
            Self::TimeoutHandling => "timeout-handling",
            Self::RetryStrategy => "retry-strategy",
            Self::ResourceCleanup => "resource-cleanup",
            Self::NullSafety => "null-safety",
            Self::ApiContract => "api-contract",
            Self::QueryPerformance => "query-performance",
            Self::TestCoverage => "test-coverage",
            Self::NamingClarity => "naming-clarity",
            Self::ReviewHygiene => "review-hygiene",
            Self::GeneralQuality => "general-quality",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == value)
    }

    /// Position in [`PRIORITY_ORDER`]; lower wins classifier ties.
    #[must_use]
    pub fn priority(self) -> usize {
        PRIORITY_ORDER
            .iter()
            .position(|key| *key == self)
            .unwrap_or(PRIORITY_ORDER.len())
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::SecretManagement => "Secret management",
            Self::SensitiveLogging => "Sensitive logging",
            Self::AuthTokenHandling => "Auth token handling",
            Self::AuthorizationChecks => "Authorization checks",
            Self::InputValidation => "Input validation",
            Self::DataMigration => "Data migration",
            Self::ConcurrencySafety => "Concurrency safety",
            Self::ErrorHandling => "Error handling",
            Self::TimeoutHandling => "Timeout handling",
            Self::RetryStrategy => "Retry strategy",
            Self::ResourceCleanup => "Resource cleanup",
            Self::NullSafety => "Null safety",
            Self::ApiContract => "API contract",
            Self::QueryPerformance => "Query performance",
            Self::TestCoverage => "Test coverage",
            Self::NamingClarity => "Naming clarity",
            Self::ReviewHygiene => "Review hygiene",
            Self::GeneralQuality => "General quality",
        }
    }

    #[must_use]
    pub fn rule_title(self) -> &'static str {
        match self {
            Self::SecretManagement => "Keep secrets out of source and config files",
            Self::SensitiveLogging => "Never log credentials or personal data",
            Self::AuthTokenHandling => "Handle auth tokens with expiry and rotation",
            Self::AuthorizationChecks => "Check authorization on every protected path",
            Self::InputValidation => "Validate and sanitize untrusted input",
            Self::DataMigration => "Make schema migrations reversible and backfilled",
            Self::ConcurrencySafety => "Guard shared state against races",
            Self::ErrorHandling => "Propagate errors instead of swallowing them",
            Self::TimeoutHandling => "Bound every remote call with a timeout",
            Self::RetryStrategy => "Retry idempotent calls with backoff",
            Self::ResourceCleanup => "Release connections, files and handles",
            Self::NullSafety => "Check for missing values before use",
            Self::ApiContract => "Preserve API contracts across releases",
            Self::QueryPerformance => "Avoid per-row queries on hot paths",
            Self::TestCoverage => "Ship behavior changes with tests",
            Self::NamingClarity => "Name things for what they do",
            Self::ReviewHygiene => "Keep review diffs clean",
            Self::GeneralQuality => "Apply recurring review feedback",
        }
    }

    #[must_use]
    pub fn rule_description(self) -> &'static str {
        match self {
            Self::SecretManagement => {
                "Secrets, API keys and private keys must come from a secret store or the environment, never from committed code or config."
            }
            Self::SensitiveLogging => {
                "Log statements must not emit passwords, tokens, credentials or personal data; redact such fields before they reach any sink."
            }
            Self::AuthTokenHandling => {
                "Access and refresh tokens must be validated, expired and rotated deliberately, and must never outlive the session that issued them."
            }
            Self::AuthorizationChecks => {
                "Every endpoint and action that touches protected data must verify the caller's permissions server-side."
            }
            Self::InputValidation => {
                "Input crossing a trust boundary must be validated and sanitized before it reaches queries, shells or rendered output."
            }
            Self::DataMigration => {
                "Schema changes must ship with a backfill plan and a rollback path, and must be safe to run against live data."
            }
            Self::ConcurrencySafety => {
                "Shared mutable state must be protected against races and deadlocks, with lock scope kept as small as possible."
            }
            Self::ErrorHandling => {
                "Errors must be handled or propagated with context; silently ignored failures and unchecked panics are not acceptable."
            }
            Self::TimeoutHandling => {
                "Network and I/O calls must carry an explicit timeout or deadline so a slow dependency cannot hang the caller."
            }
            Self::RetryStrategy => {
                "Retries must be limited to idempotent operations and use bounded exponential backoff."
            }
            Self::ResourceCleanup => {
                "Connections, file handles and streams must be closed on every path, including error paths, to avoid leaks."
            }
            Self::NullSafety => {
                "Values that may be null or undefined must be checked before they are dereferenced or passed on."
            }
            Self::ApiContract => {
                "Public request and response shapes must stay backwards compatible, or the breaking change must be versioned and announced."
            }
            Self::QueryPerformance => {
                "Queries on hot paths must be batched and indexed; N+1 access patterns must be removed before merge."
            }
            Self::TestCoverage => {
                "Every behavior change and bug fix must land with a test that would have caught the regression."
            }
            Self::NamingClarity => {
                "Identifiers must describe their purpose; unclear or misleading names must be fixed during review."
            }
            Self::ReviewHygiene => {
                "Pull requests must be free of typos, dead code, commented-out code and formatting noise before review."
            }
            Self::GeneralQuality => {
                "Feedback that recurs across reviews must be addressed proactively in new changes."
            }
        }
    }

    #[must_use]
    pub fn super_category(self) -> SuperCategory {
        match self {
            Self::SecretManagement
            | Self::SensitiveLogging
            | Self::AuthTokenHandling
            | Self::AuthorizationChecks
            | Self::InputValidation => SuperCategory::Security,
            Self::ConcurrencySafety
            | Self::ErrorHandling
            | Self::TimeoutHandling
            | Self::RetryStrategy
            | Self::ResourceCleanup
            | Self::QueryPerformance => SuperCategory::Reliability,
            Self::DataMigration | Self::NullSafety | Self::ApiContract => {
                SuperCategory::Correctness
            }
            Self::TestCoverage | Self::NamingClarity | Self::ReviewHygiene | Self::GeneralQuality => {
                SuperCategory::Maintainability
            }
        }
    }

    #[must_use]
    pub fn salience_band(self) -> SalienceBand {
        let (min, max) = match self {
            Self::SecretManagement => (8, 10),
            Self::SensitiveLogging | Self::AuthTokenHandling | Self::AuthorizationChecks => (7, 10),
            Self::InputValidation => (6, 9),
            Self::DataMigration => (5, 8),
            Self::ConcurrencySafety => (5, 9),
            Self::ErrorHandling | Self::TimeoutHandling | Self::RetryStrategy => (4, 8),
            Self::ResourceCleanup | Self::QueryPerformance => (3, 7),
            Self::NullSafety | Self::ApiContract => (4, 7),
            Self::TestCoverage => (2, 6),
            Self::NamingClarity => (1, 4),
            Self::ReviewHygiene => (0, 3),
            Self::GeneralQuality => (0, 5),
        };
        SalienceBand { min, max }
    }
}

impl Display for PatternKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKey {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value.trim()).ok_or_else(|| CoreError::UnknownPatternKey(value.to_string()))
    }
}

/// One catalog row, flattened for listing surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub pattern_key: PatternKey,
    pub label: String,
    pub super_category: SuperCategory,
    pub salience_band: SalienceBand,
    pub priority: usize,
    pub rule_title: String,
    pub rule_description: String,
}

/// Lists the catalog in tie-break priority order.
#[must_use]
pub fn catalog() -> Vec<CatalogEntry> {
    PRIORITY_ORDER
        .iter()
        .map(|key| CatalogEntry {
            pattern_key: *key,
            label: key.label().to_string(),
            super_category: key.super_category(),
            salience_band: key.salience_band(),
            priority: key.priority(),
            rule_title: key.rule_title().to_string(),
            rule_description: key.rule_description().to_string(),
        })
        .collect()
}
