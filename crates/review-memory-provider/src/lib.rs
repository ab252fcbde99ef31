#![forbid(unsafe_code)]

//! Inference side of consolidation.
//!
//! A [`ConsolidationProvider`] proposes an untrusted candidate for a
//! [`ConsolidationRequest`]; [`run_consolidation`] always routes that
//! candidate through the deterministic sanitizer before anything is returned.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use review_memory_core::{
    bound_salience_updates, sanitize_with_report, ConsolidationConfig, ConsolidationResult,
    Episode, PatternKey, RawConsolidation, Rule, SanitizeReport,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const REQUEST_CONTRACT_VERSION: &str = "review_consolidation_request.v1";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

const PROMPT_HEADER: &str = "You consolidate code review episodes into reusable review rules.
Respond with a single JSON object matching the response schema.
Only use the pattern keys listed below. Only reference episode ids that appear in the input.
Never invent episodes. Salience scores are numbers from 0 to 10.";

pub trait ConsolidationProvider {
    fn provider_name(&self) -> &'static str;

    /// Returns the raw, untrusted candidate for `request`.
    #[allow(clippy::missing_errors_doc)]
    fn propose(&self, request: &ConsolidationRequest) -> Result<Value>;
}

/// Everything the inference step is given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsolidationRequest {
    pub contract_version: String,
    pub prompt: String,
    pub allowed_pattern_keys: Vec<String>,
    pub response_schema: Value,
    pub episodes: Vec<Episode>,
    pub prior_rules: Vec<Rule>,
    pub request_hash: String,
}

impl ConsolidationRequest {
    /// Body sent over the wire; excludes the hash itself.
    #[must_use]
    pub fn wire_json(&self) -> Value {
        wire_json(
            &self.contract_version,
            &self.prompt,
            &self.allowed_pattern_keys,
            &self.response_schema,
            &self.episodes,
            &self.prior_rules,
        )
    }
}

/// Builds the request for one consolidation pass.
///
/// # Errors
/// Returns an error when the request body cannot be serialized for hashing.
pub fn build_request(episodes: &[Episode], prior_rules: &[Rule]) -> Result<ConsolidationRequest> {
    let allowed_pattern_keys: Vec<String> = PatternKey::ALL
        .iter()
        .map(|key| key.as_str().to_string())
        .collect();
    let prompt = build_prompt(&allowed_pattern_keys, prior_rules);
    let response_schema = response_schema(&allowed_pattern_keys);
    let request_hash = hash_json(&wire_json(
        REQUEST_CONTRACT_VERSION,
        &prompt,
        &allowed_pattern_keys,
        &response_schema,
        episodes,
        prior_rules,
    ))?;

    Ok(ConsolidationRequest {
        contract_version: REQUEST_CONTRACT_VERSION.to_string(),
        prompt,
        allowed_pattern_keys,
        response_schema,
        episodes: episodes.to_vec(),
        prior_rules: prior_rules.to_vec(),
        request_hash,
    })
}

fn build_prompt(allowed_pattern_keys: &[String], prior_rules: &[Rule]) -> String {
    let mut prompt = String::from(PROMPT_HEADER);
    prompt.push_str("\n\nAllowed pattern keys:\n");
    for key in allowed_pattern_keys {
        prompt.push_str("- ");
        prompt.push_str(key);
        prompt.push('\n');
    }
    if !prior_rules.is_empty() {
        prompt.push_str("\nRules already promoted:\n");
        for rule in prior_rules {
            prompt.push_str(&format!("- {}: {}\n", rule.rule_key, rule.title));
        }
    }
    prompt
}

fn response_schema(allowed_pattern_keys: &[String]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "patterns": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "pattern_key": {"type": "string", "enum": allowed_pattern_keys},
                        "episode_ids": {"type": "array", "items": {"type": "string"}},
                        "summary": {"type": "string"}
                    }
                }
            },
            "rules_to_promote": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "description": {"type": "string"},
                        "triggers": {"type": "array", "items": {"type": "string"}},
                        "source_episode_ids": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["source_episode_ids"]
                }
            },
            "contradictions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "episode_a": {"type": "string"},
                        "episode_b": {"type": "string"},
                        "reason": {"type": "string"}
                    },
                    "required": ["episode_a", "episode_b", "reason"]
                }
            },
            "salience_updates": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "episode_id": {"type": "string"},
                        "score": {"type": "number", "minimum": 0, "maximum": 10},
                        "reason": {"type": "string"}
                    },
                    "required": ["episode_id", "score", "reason"]
                }
            },
            "prune_candidates": {"type": "array", "items": {"type": "string"}}
        }
    })
}

fn wire_json(
    contract_version: &str,
    prompt: &str,
    allowed_pattern_keys: &[String],
    response_schema: &Value,
    episodes: &[Episode],
    prior_rules: &[Rule],
) -> Value {
    json!({
        "contract_version": contract_version,
        "prompt": prompt,
        "allowed_pattern_keys": allowed_pattern_keys,
        "response_schema": response_schema,
        "episodes": episodes,
        "prior_rules": prior_rules,
    })
}

/// SHA-256 over the compact JSON serialization, prefixed with `sha256:`.
///
/// # Errors
/// Returns an error when `value` cannot be serialized.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value).context("failed to serialize request for hashing")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Replays a captured candidate instead of calling a model.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    body: String,
}

impl FixtureProvider {
    #[must_use]
    pub fn new(candidate: &Value) -> Self {
        Self {
            body: candidate.to_string(),
        }
    }

    #[must_use]
    pub fn from_body(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// # Errors
    /// Returns an error when the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read candidate file {}", path.display()))?;
        Ok(Self::from_body(body))
    }
}

impl ConsolidationProvider for FixtureProvider {
    fn provider_name(&self) -> &'static str {
        "fixture"
    }

    fn propose(&self, _request: &ConsolidationRequest) -> Result<Value> {
        serde_json::from_str(&self.body).context("fixture candidate is not valid JSON")
    }
}

/// Proposes nothing. Consolidation still recomputes patterns and rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyProvider;

impl ConsolidationProvider for EmptyProvider {
    fn provider_name(&self) -> &'static str {
        "empty"
    }

    fn propose(&self, _request: &ConsolidationRequest) -> Result<Value> {
        Ok(json!({}))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProviderConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    /// Name of the environment variable holding the bearer token.
    pub auth_bearer_env: Option<String>,
}

impl HttpProviderConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            headers: BTreeMap::new(),
            auth_bearer_env: None,
        }
    }

    fn resolve_bearer_token(&self) -> Result<Option<String>> {
        match &self.auth_bearer_env {
            Some(env_name) => std::env::var(env_name).map(Some).map_err(|_| {
                anyhow!("missing env var '{env_name}' required by --auth-bearer-env")
            }),
            None => Ok(None),
        }
    }
}

/// POSTs the request as JSON and reads the candidate from the response.
#[derive(Debug, Clone)]
pub struct HttpJsonProvider {
    config: HttpProviderConfig,
}

impl HttpJsonProvider {
    /// # Errors
    /// Returns an error when the URL is blank or the timeout is zero.
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(anyhow!("http provider url MUST be non-empty"));
        }
        if config.timeout_ms == 0 {
            return Err(anyhow!("http provider timeout_ms MUST be positive"));
        }
        Ok(Self { config })
    }
}

impl ConsolidationProvider for HttpJsonProvider {
    fn provider_name(&self) -> &'static str {
        "http_json"
    }

    fn propose(&self, request: &ConsolidationRequest) -> Result<Value> {
        let token = self.config.resolve_bearer_token()?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let body: Value = match req.send_json(request.wire_json()) {
            Ok(response) => response
                .into_json()
                .context("provider response is not valid JSON")?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("provider returned http status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("http transport failure: {err}"));
            }
        };

        Ok(extract_candidate(body))
    }
}

/// Unwraps a `candidate` envelope and JSON carried as a string.
fn extract_candidate(body: Value) -> Value {
    let inner = match body {
        Value::Object(mut object) if object.contains_key("candidate") => {
            object.remove("candidate").unwrap_or(Value::Null)
        }
        other => other,
    };

    match inner {
        Value::String(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
            tracing::warn!(%err, "provider returned a non-JSON string candidate");
            Value::Null
        }),
        other => other,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidationOutcome {
    pub provider_name: String,
    pub request_hash: Option<String>,
    pub fallback_used: bool,
    pub provider_error: Option<String>,
    pub latency_ms: Option<u64>,
    pub episode_count: usize,
    pub result: ConsolidationResult,
    pub report: SanitizeReport,
}

/// Runs one consolidation pass end to end, without persisting anything.
///
/// A failing provider is never fatal: its candidate is treated as empty and
/// the deterministic patterns and rules are still produced.
///
/// # Errors
/// Returns an error only when the request cannot be built.
pub fn run_consolidation(
    provider: &dyn ConsolidationProvider,
    episodes: &[Episode],
    prior_rules: &[Rule],
    config: &ConsolidationConfig,
) -> Result<ConsolidationOutcome> {
    if episodes.is_empty() {
        tracing::info!(provider = provider.provider_name(), "no episodes to consolidate");
        return Ok(ConsolidationOutcome {
            provider_name: provider.provider_name().to_string(),
            request_hash: None,
            fallback_used: false,
            provider_error: None,
            latency_ms: None,
            episode_count: 0,
            result: ConsolidationResult::default(),
            report: SanitizeReport::default(),
        });
    }

    let request = build_request(episodes, prior_rules)?;
    let started_at = OffsetDateTime::now_utc();
    let proposed = provider.propose(&request);
    let latency_ms = {
        let millis = (OffsetDateTime::now_utc() - started_at).whole_milliseconds();
        u64::try_from(millis.max(0)).ok()
    };

    let (raw, provider_error) = match proposed {
        Ok(value) => (RawConsolidation::from_value(&value), None),
        Err(err) => {
            let message = format!("{err:#}");
            tracing::warn!(
                provider = provider.provider_name(),
                error = %message,
                "inference failed; continuing with an empty candidate"
            );
            (RawConsolidation::default(), Some(message))
        }
    };

    let (mut result, report) = sanitize_with_report(&raw, episodes, config);
    result.salience_updates =
        bound_salience_updates(&result.salience_updates, episodes, config.max_salience_delta);

    tracing::info!(
        provider = provider.provider_name(),
        request_hash = %request.request_hash,
        patterns = result.patterns.len(),
        rules = result.rules_to_promote.len(),
        fallback_used = provider_error.is_some(),
        "consolidation pass complete"
    );

    Ok(ConsolidationOutcome {
        provider_name: provider.provider_name().to_string(),
        request_hash: Some(request.request_hash),
        fallback_used: provider_error.is_some(),
        provider_error,
        latency_ms,
        episode_count: episodes.len(),
        result,
        report,
    })
}
