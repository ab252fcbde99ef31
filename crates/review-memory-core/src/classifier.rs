use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::{PatternKey, FALLBACK_PATTERN_KEY, PRIORITY_ORDER};

/// Keyword matchers per category. Each distinct matcher that fires adds one
/// point to its category. Patterns run against the lowercased corpus.
fn matcher_sources(key: PatternKey) -> &'static [&'static str] {
    match key {
        PatternKey::SecretManagement => &[
            r"\bhard-?coded (secrets?|passwords?|keys?|credentials?)\b",
            r"\b(api[ _-]?keys?|private keys?)\b",
            r"(\bsecrets? manager\b|\bvault\b|\.env\b)",
        ],
        PatternKey::SensitiveLogging => &[
            r"\b(log|logs|logged|logging|logger)\b[^\n]{0,60}\b(passwords?|secrets?|tokens?|credentials?|pii|emails?|ssn)\b",
            r"\bredact(ed|ion|s)?\b",
            r"\b(pii|personal data|sensitive (data|fields?|information))\b",
        ],
        PatternKey::AuthTokenHandling => &[
            r"\b(jwts?|oauth2?|bearer)\b",
            r"\b(access|refresh|auth|session) tokens?\b",
            r"\btokens? (expiry|expiration|refresh|rotation|revocation)\b",
        ],
        PatternKey::AuthorizationChecks => &[
            r"\b(authori[sz]ation|authori[sz]ed?|access control|rbac)\b",
            r"\bpermissions?\b",
            r"\bprivilege escalation\b",
        ],
        PatternKey::InputValidation => &[
            r"\b(validate|validates|validated|validating|validation)\b",
            r"(\b(sql|command|html|shell) injection\b|\bxss\b)",
            r"\b(unsanitized|sanitize|sanitized|sanitizing|sanitization|untrusted input)\b",
        ],
        PatternKey::DataMigration => &[
            r"\bmigrations?\b",
            r"\b(schema change|backfill|alter table)\b",
        ],
        PatternKey::ConcurrencySafety => &[
            r"(\brace conditions?\b|\bdata races?\b)",
            r"\b(deadlocks?|mutex|mutexes|lock contention)\b",
            r"\b(thread[- ]safe|thread[- ]safety|concurrent|concurrency)\b",
        ],
        PatternKey::ErrorHandling => &[
            r"\b(unhandled|swallowed|ignored|silent|silently) (errors?|exceptions?)\b",
            r"\b(unwrap|panic|panics|try/catch|catch blocks?)\b",
            r"\berror (handling|handler|propagation)\b",
        ],
        PatternKey::TimeoutHandling => &[
            r"\b(time ?outs?|timed out)\b",
            r"\bdeadlines?\b",
            r"\b(hangs?|hung|hanging) (forever|indefinitely)\b",
        ],
        PatternKey::RetryStrategy => &[
            r"\bretr(y|ies|ied|ying)\b",
            r"\bback-?off\b",
            r"\bidempoten(t|cy)\b",
        ],
        PatternKey::ResourceCleanup => &[
            r"\bleak(s|ed|ing)?\b",
            r"\b(close|closed|closing|dispose|cleanup|clean up)\b[^\n]{0,40}\b(connections?|files?|handles?|streams?|sockets?)\b",
            r"\bfile descriptors?\b",
        ],
        PatternKey::NullSafety => &[
            r"\b(null|nil|undefined)\b",
            r"\b(null (checks?|pointers?|references?)|optional chaining|nullable)\b",
        ],
        PatternKey::ApiContract => &[
            r"\bbreaking changes?\b",
            r"\bbackwards? compat(ible|ibility)\b",
            r"\b(api|response|request) (contracts?|schemas?)\b",
        ],
        PatternKey::QueryPerformance => &[
            r"\bn ?\+ ?1\b",
            r"\b(slow|expensive|inefficient) (query|queries|loops?|requests?|endpoints?)\b",
            r"\b(missing|add|added) (an )?index(es)?\b",
        ],
        PatternKey::TestCoverage => &[
            r"\b(missing|no|without|add|added) (unit |integration |regression )?tests?\b",
            r"\bcoverage\b",
            r"\bflaky\b",
        ],
        PatternKey::NamingClarity => &[
            r"\b(naming|rename|renamed|renaming)\b",
            r"\b(unclear|confusing|misleading|ambiguous) (names?|identifiers?|variables?)\b",
        ],
        PatternKey::ReviewHygiene => &[
            r"\b(typos?|nits?|nitpicks?|whitespace|formatting|lint|linter|linting)\b",
            r"\b(commented[- ]out code|dead code|todo comments?)\b",
            r"\b(pr description|commit messages?)\b",
        ],
        PatternKey::GeneralQuality => &[],
    }
}

struct CompiledCategory {
    key: PatternKey,
    matchers: Vec<Regex>,
}

fn compiled_categories() -> &'static [CompiledCategory] {
    static COMPILED: OnceLock<Vec<CompiledCategory>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PRIORITY_ORDER
            .iter()
            .map(|key| CompiledCategory {
                key: *key,
                matchers: matcher_sources(*key)
                    .iter()
                    .filter_map(|source| match Regex::new(source) {
                        Ok(regex) => Some(regex),
                        Err(err) => {
                            tracing::warn!(pattern_key = %key, %err, "skipping invalid matcher");
                            None
                        }
                    })
                    .collect(),
            })
            .collect()
    })
}

/// Per-category score, reported in priority order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryScore {
    pub pattern_key: PatternKey,
    pub score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Classification {
    pub pattern_key: PatternKey,
    pub matched: bool,
    pub scores: Vec<CategoryScore>,
}

/// Maps free text onto exactly one catalog key.
///
/// Never fails: when nothing matches the fallback key is returned.
#[must_use]
pub fn classify(title: Option<&str>, narrative: Option<&str>, triggers: &[String]) -> PatternKey {
    classify_with_scores(title, narrative, triggers).pattern_key
}

#[must_use]
pub fn classify_with_scores(
    title: Option<&str>,
    narrative: Option<&str>,
    triggers: &[String],
) -> Classification {
    let corpus = build_corpus(title, narrative, triggers);

    let scores: Vec<CategoryScore> = compiled_categories()
        .iter()
        .map(|category| CategoryScore {
            pattern_key: category.key,
            score: u32::try_from(
                category
                    .matchers
                    .iter()
                    .filter(|matcher| matcher.is_match(&corpus))
                    .count(),
            )
            .unwrap_or(u32::MAX),
        })
        .collect();

    // `scores` is in priority order, so keeping the first strict maximum
    // resolves ties toward the earlier entry.
    let mut winner: Option<CategoryScore> = None;
    for entry in &scores {
        if entry.score == 0 {
            continue;
        }
        match winner {
            Some(best) if best.score >= entry.score => {}
            _ => winner = Some(*entry),
        }
    }

    Classification {
        pattern_key: winner.map_or(FALLBACK_PATTERN_KEY, |entry| entry.pattern_key),
        matched: winner.is_some(),
        scores,
    }
}

fn build_corpus(title: Option<&str>, narrative: Option<&str>, triggers: &[String]) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(2 + triggers.len());
    parts.extend(title);
    parts.extend(narrative);
    parts.extend(triggers.iter().map(String::as_str));
    parts.join("\n").to_lowercase()
}
