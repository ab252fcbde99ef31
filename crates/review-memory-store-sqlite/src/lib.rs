#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use review_memory_core::{
    ConsolidationResult, Contradiction, Episode, NewEpisode, Pattern, PatternKey, Rule, SourceRef,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

const REVIEW_MEMORY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_REVIEW_MEMORY_V1: &str = r"
CREATE TABLE IF NOT EXISTS episodes (
  episode_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  what_happened TEXT,
  the_pattern TEXT,
  the_fix TEXT,
  why_it_matters TEXT,
  pattern_key TEXT NOT NULL,
  salience_score INTEGER NOT NULL CHECK (salience_score BETWEEN 0 AND 10),
  triggers_json TEXT NOT NULL DEFAULT '[]',
  source_repository TEXT,
  source_pull_request INTEGER,
  source_url TEXT,
  recorded_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_episodes_pattern_key
  ON episodes(pattern_key);

CREATE TABLE IF NOT EXISTS rules (
  rule_key TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  description TEXT NOT NULL,
  triggers_json TEXT NOT NULL,
  source_episode_ids_json TEXT NOT NULL,
  promoted_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  last_run_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS patterns (
  pattern_key TEXT PRIMARY KEY,
  position INTEGER NOT NULL,
  name TEXT NOT NULL,
  episode_ids_json TEXT NOT NULL,
  summary TEXT NOT NULL,
  run_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contradictions (
  episode_low TEXT NOT NULL,
  episode_high TEXT NOT NULL,
  episode_a TEXT NOT NULL,
  episode_b TEXT NOT NULL,
  reason TEXT NOT NULL,
  run_id TEXT NOT NULL,
  detected_at TEXT NOT NULL,
  PRIMARY KEY (episode_low, episode_high),
  CHECK (episode_low < episode_high),
  FOREIGN KEY (episode_a) REFERENCES episodes(episode_id) ON DELETE CASCADE,
  FOREIGN KEY (episode_b) REFERENCES episodes(episode_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS prune_candidates (
  episode_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  flagged_at TEXT NOT NULL,
  FOREIGN KEY (episode_id) REFERENCES episodes(episode_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS salience_history (
  history_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  episode_id TEXT NOT NULL,
  previous_score INTEGER NOT NULL CHECK (previous_score BETWEEN 0 AND 10),
  new_score INTEGER NOT NULL CHECK (new_score BETWEEN 0 AND 10),
  reason TEXT NOT NULL,
  run_id TEXT NOT NULL,
  applied_at TEXT NOT NULL,
  FOREIGN KEY (episode_id) REFERENCES episodes(episode_id) ON DELETE CASCADE
);

CREATE TRIGGER IF NOT EXISTS trg_salience_history_no_update
BEFORE UPDATE ON salience_history
BEGIN
  SELECT RAISE(FAIL, 'salience_history is append-only');
END;

CREATE TABLE IF NOT EXISTS consolidation_runs (
  run_id TEXT PRIMARY KEY,
  provider_name TEXT NOT NULL,
  request_hash TEXT,
  fallback_used INTEGER NOT NULL CHECK (fallback_used IN (0, 1)),
  episode_count INTEGER NOT NULL,
  pattern_count INTEGER NOT NULL,
  rule_count INTEGER NOT NULL,
  contradiction_count INTEGER NOT NULL,
  salience_update_count INTEGER NOT NULL,
  prune_candidate_count INTEGER NOT NULL,
  started_at TEXT NOT NULL,
  completed_at TEXT NOT NULL
);
";

pub struct SqliteReviewStore {
    conn: Connection,
}

/// Metadata for one consolidation pass, captured by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: Ulid,
    pub provider_name: String,
    pub request_hash: Option<String>,
    pub fallback_used: bool,
    pub episode_count: usize,
    pub started_at: OffsetDateTime,
}

impl RunRecord {
    #[must_use]
    pub fn new(
        provider_name: impl Into<String>,
        request_hash: Option<String>,
        fallback_used: bool,
        episode_count: usize,
    ) -> Self {
        Self {
            run_id: Ulid::new(),
            provider_name: provider_name.into(),
            request_hash,
            fallback_used,
            episode_count,
            started_at: now_utc(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyReport {
    pub run_id: String,
    pub patterns_written: usize,
    pub rules_upserted: usize,
    pub contradictions_inserted: usize,
    pub salience_updates_applied: usize,
    pub prune_candidates_flagged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidationRun {
    pub run_id: String,
    pub provider_name: String,
    pub request_hash: Option<String>,
    pub fallback_used: bool,
    pub episode_count: usize,
    pub pattern_count: usize,
    pub rule_count: usize,
    pub contradiction_count: usize,
    pub salience_update_count: usize,
    pub prune_candidate_count: usize,
    pub started_at: String,
    pub completed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SalienceHistoryEntry {
    pub history_seq: i64,
    pub episode_id: String,
    pub previous_score: u8,
    pub new_score: u8,
    pub reason: String,
    pub run_id: String,
    pub applied_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub contract_version: String,
    pub episodes: usize,
    pub rules: usize,
    pub patterns: usize,
    pub contradictions: usize,
    pub prune_candidates: usize,
    pub consolidation_runs: usize,
    pub last_run_at: Option<String>,
}

impl SqliteReviewStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_REVIEW_MEMORY_V1)
            .context("failed to apply review memory schema")?;

        let applied = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![REVIEW_MEMORY_MIGRATION_VERSION, timestamp(now_utc())?],
            )
            .context("failed to register review memory schema migration")?;
        if applied > 0 {
            tracing::info!(
                version = REVIEW_MEMORY_MIGRATION_VERSION,
                "applied review memory schema"
            );
        }

        Ok(())
    }

    /// Classifies, calibrates and stores a newly captured episode.
    pub fn record_episode(&self, input: NewEpisode) -> Result<Episode> {
        let episode = input
            .encode(Ulid::new().to_string())
            .map_err(|err| anyhow!("episode validation failed: {err}"))?;

        if self.get_episode(&episode.id)?.is_some() {
            return Err(anyhow!("episode {} already exists", episode.id));
        }

        let now = timestamp(now_utc())?;
        let source = episode.source.as_ref();
        self.conn
            .execute(
                "INSERT INTO episodes(
                    episode_id, title, what_happened, the_pattern, the_fix, why_it_matters,
                    pattern_key, salience_score, triggers_json,
                    source_repository, source_pull_request, source_url,
                    recorded_at, updated_at
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6,
                    ?7, ?8, ?9,
                    ?10, ?11, ?12,
                    ?13, ?13
                 )",
                params![
                    episode.id,
                    episode.title,
                    episode.what_happened,
                    episode.the_pattern,
                    episode.the_fix,
                    episode.why_it_matters,
                    episode.pattern_key.as_str(),
                    episode.salience_score,
                    serde_json::to_string(&episode.triggers)
                        .context("failed to serialize triggers")?,
                    source.map(|value| value.repository.as_str()),
                    source
                        .and_then(|value| value.pull_request)
                        .map(i64::try_from)
                        .transpose()
                        .context("pull request number out of range")?,
                    source.and_then(|value| value.url.as_deref()),
                    now,
                ],
            )
            .context("failed to insert episode")?;

        tracing::info!(
            episode_id = %episode.id,
            pattern_key = %episode.pattern_key,
            salience_score = episode.salience_score,
            "recorded episode"
        );

        Ok(episode)
    }

    pub fn get_episode(&self, episode_id: &str) -> Result<Option<Episode>> {
        self.conn
            .query_row(
                &format!("{EPISODE_SELECT} WHERE episode_id = ?1"),
                params![episode_id],
                parse_episode_row,
            )
            .optional()
            .context("failed to load episode")
    }

    /// All episodes in recording order.
    pub fn list_episodes(&self) -> Result<Vec<Episode>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{EPISODE_SELECT} ORDER BY rowid ASC"))?;
        let rows = stmt.query_map([], parse_episode_row)?;
        collect_rows(rows)
    }

    pub fn list_rules(&self) -> Result<Vec<Rule>> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_key, title, description, triggers_json, source_episode_ids_json
             FROM rules
             ORDER BY rule_key ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let rule_key_raw: String = row.get(0)?;
            let triggers_json: String = row.get(3)?;
            let source_ids_json: String = row.get(4)?;
            Ok(Rule {
                rule_key: parse_pattern_key(0, &rule_key_raw)?,
                title: row.get(1)?,
                description: row.get(2)?,
                triggers: parse_string_list(3, &triggers_json)?,
                source_episode_ids: parse_string_list(4, &source_ids_json)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Patterns from the most recent applied run, in their reported order.
    pub fn list_patterns(&self) -> Result<Vec<Pattern>> {
        let mut stmt = self.conn.prepare(
            "SELECT pattern_key, name, episode_ids_json, summary
             FROM patterns
             ORDER BY position ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let pattern_key_raw: String = row.get(0)?;
            let episode_ids_json: String = row.get(2)?;
            Ok(Pattern {
                pattern_key: parse_pattern_key(0, &pattern_key_raw)?,
                name: row.get(1)?,
                episode_ids: parse_string_list(2, &episode_ids_json)?,
                summary: row.get(3)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn list_contradictions(&self) -> Result<Vec<Contradiction>> {
        let mut stmt = self.conn.prepare(
            "SELECT episode_a, episode_b, reason
             FROM contradictions
             ORDER BY detected_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Contradiction {
                episode_a: row.get(0)?,
                episode_b: row.get(1)?,
                reason: row.get(2)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn list_prune_candidates(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT episode_id FROM prune_candidates ORDER BY rowid ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }

    pub fn list_salience_history(&self, episode_id: &str) -> Result<Vec<SalienceHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT history_seq, episode_id, previous_score, new_score, reason, run_id, applied_at
             FROM salience_history
             WHERE episode_id = ?1
             ORDER BY history_seq ASC",
        )?;
        let rows = stmt.query_map(params![episode_id], |row| {
            Ok(SalienceHistoryEntry {
                history_seq: row.get(0)?,
                episode_id: row.get(1)?,
                previous_score: row.get(2)?,
                new_score: row.get(3)?,
                reason: row.get(4)?,
                run_id: row.get(5)?,
                applied_at: row.get(6)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Persists a sanitized result in one transaction.
    ///
    /// Patterns are replaced wholesale, rules are upserted by key, and prune
    /// candidates are only flagged; episodes are never deleted here.
    pub fn apply_consolidation(
        &mut self,
        result: &ConsolidationResult,
        run: &RunRecord,
    ) -> Result<ApplyReport> {
        let run_id = run.run_id.to_string();
        let now = timestamp(now_utc())?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start consolidation transaction")?;

        let patterns_written = replace_patterns(&tx, &result.patterns, &run_id)?;
        let rules_upserted = upsert_rules(&tx, &result.rules_to_promote, &run_id, &now)?;

        let mut contradictions_inserted = 0_usize;
        for contradiction in &result.contradictions {
            let (low, high) = ordered_pair(&contradiction.episode_a, &contradiction.episode_b);
            contradictions_inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO contradictions(
                        episode_low, episode_high, episode_a, episode_b, reason, run_id, detected_at
                     )
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
                     WHERE EXISTS (SELECT 1 FROM episodes WHERE episode_id = ?3)
                       AND EXISTS (SELECT 1 FROM episodes WHERE episode_id = ?4)",
                    params![
                        low,
                        high,
                        contradiction.episode_a,
                        contradiction.episode_b,
                        contradiction.reason,
                        run_id,
                        now
                    ],
                )
                .context("failed to insert contradiction")?;
        }

        let mut salience_updates_applied = 0_usize;
        for update in &result.salience_updates {
            let previous: Option<u8> = tx
                .query_row(
                    "SELECT salience_score FROM episodes WHERE episode_id = ?1",
                    params![update.episode_id],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read current salience")?;
            let Some(previous) = previous else {
                tracing::warn!(episode_id = %update.episode_id, "salience update for missing episode");
                continue;
            };

            tx.execute(
                "UPDATE episodes SET salience_score = ?2, updated_at = ?3 WHERE episode_id = ?1",
                params![update.episode_id, update.score, now],
            )
            .context("failed to update salience")?;
            tx.execute(
                "INSERT INTO salience_history(
                    episode_id, previous_score, new_score, reason, run_id, applied_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![update.episode_id, previous, update.score, update.reason, run_id, now],
            )
            .context("failed to append salience history")?;
            salience_updates_applied += 1;
        }

        let mut prune_candidates_flagged = 0_usize;
        for episode_id in &result.prune_candidates {
            prune_candidates_flagged += tx
                .execute(
                    "INSERT OR IGNORE INTO prune_candidates(episode_id, run_id, flagged_at)
                     SELECT ?1, ?2, ?3
                     WHERE EXISTS (SELECT 1 FROM episodes WHERE episode_id = ?1)",
                    params![episode_id, run_id, now],
                )
                .context("failed to flag prune candidate")?;
        }

        tx.execute(
            "INSERT INTO consolidation_runs(
                run_id, provider_name, request_hash, fallback_used, episode_count,
                pattern_count, rule_count, contradiction_count, salience_update_count,
                prune_candidate_count, started_at, completed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run_id,
                run.provider_name,
                run.request_hash,
                i64::from(run.fallback_used),
                to_sql_count(run.episode_count)?,
                to_sql_count(patterns_written)?,
                to_sql_count(rules_upserted)?,
                to_sql_count(contradictions_inserted)?,
                to_sql_count(salience_updates_applied)?,
                to_sql_count(prune_candidates_flagged)?,
                timestamp(run.started_at)?,
                now,
            ],
        )
        .context("failed to record consolidation run")?;

        tx.commit()
            .context("failed to commit consolidation transaction")?;

        let report = ApplyReport {
            run_id,
            patterns_written,
            rules_upserted,
            contradictions_inserted,
            salience_updates_applied,
            prune_candidates_flagged,
        };
        tracing::info!(
            run_id = %report.run_id,
            patterns = report.patterns_written,
            rules = report.rules_upserted,
            contradictions = report.contradictions_inserted,
            salience_updates = report.salience_updates_applied,
            prune_candidates = report.prune_candidates_flagged,
            "applied consolidation"
        );
        Ok(report)
    }

    pub fn list_runs(&self, limit: Option<usize>) -> Result<Vec<ConsolidationRun>> {
        let mut query = "SELECT
                run_id, provider_name, request_hash, fallback_used, episode_count,
                pattern_count, rule_count, contradiction_count, salience_update_count,
                prune_candidate_count, started_at, completed_at
             FROM consolidation_runs
             ORDER BY completed_at DESC, run_id DESC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            Ok(ConsolidationRun {
                run_id: row.get(0)?,
                provider_name: row.get(1)?,
                request_hash: row.get(2)?,
                fallback_used: row.get::<_, i64>(3)? != 0,
                episode_count: row.get(4)?,
                pattern_count: row.get(5)?,
                rule_count: row.get(6)?,
                contradiction_count: row.get(7)?,
                salience_update_count: row.get(8)?,
                prune_candidate_count: row.get(9)?,
                started_at: row.get(10)?,
                completed_at: row.get(11)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let last_run_at: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(completed_at) FROM consolidation_runs",
                [],
                |row| row.get(0),
            )
            .context("failed to read last run timestamp")?;

        Ok(StoreStatus {
            contract_version: "store_status.v1".to_string(),
            episodes: self.count_rows("episodes")?,
            rules: self.count_rows("rules")?,
            patterns: self.count_rows("patterns")?,
            contradictions: self.count_rows("contradictions")?,
            prune_candidates: self.count_rows("prune_candidates")?,
            consolidation_runs: self.count_rows("consolidation_runs")?,
            last_run_at,
        })
    }

    fn count_rows(&self, table_name: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table_name}"), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        usize::try_from(count).with_context(|| format!("invalid row count for {table_name}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

const EPISODE_SELECT: &str = "SELECT
    episode_id, title, what_happened, the_pattern, the_fix, why_it_matters,
    pattern_key, salience_score, triggers_json,
    source_repository, source_pull_request, source_url
 FROM episodes";

fn replace_patterns(tx: &Transaction<'_>, patterns: &[Pattern], run_id: &str) -> Result<usize> {
    tx.execute("DELETE FROM patterns", [])
        .context("failed to clear patterns")?;

    for (position, pattern) in patterns.iter().enumerate() {
        tx.execute(
            "INSERT INTO patterns(pattern_key, position, name, episode_ids_json, summary, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pattern.pattern_key.as_str(),
                to_sql_count(position)?,
                pattern.name,
                serde_json::to_string(&pattern.episode_ids)
                    .context("failed to serialize pattern episode ids")?,
                pattern.summary,
                run_id,
            ],
        )
        .context("failed to insert pattern")?;
    }

    Ok(patterns.len())
}

fn upsert_rules(tx: &Transaction<'_>, rules: &[Rule], run_id: &str, now: &str) -> Result<usize> {
    for rule in rules {
        tx.execute(
            "INSERT INTO rules(
                rule_key, title, description, triggers_json, source_episode_ids_json,
                promoted_at, updated_at, last_run_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
             ON CONFLICT(rule_key) DO UPDATE SET
               title = excluded.title,
               description = excluded.description,
               triggers_json = excluded.triggers_json,
               source_episode_ids_json = excluded.source_episode_ids_json,
               updated_at = excluded.updated_at,
               last_run_id = excluded.last_run_id",
            params![
                rule.rule_key.as_str(),
                rule.title,
                rule.description,
                serde_json::to_string(&rule.triggers).context("failed to serialize rule triggers")?,
                serde_json::to_string(&rule.source_episode_ids)
                    .context("failed to serialize rule source ids")?,
                now,
                run_id,
            ],
        )
        .context("failed to upsert rule")?;
    }

    Ok(rules.len())
}

fn parse_episode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let pattern_key_raw: String = row.get(6)?;
    let triggers_json: String = row.get(8)?;
    let source_repository: Option<String> = row.get(9)?;
    let source_pull_request: Option<i64> = row.get(10)?;
    let source_url: Option<String> = row.get(11)?;

    let pull_request = source_pull_request
        .map(|value| {
            u64::try_from(value).map_err(|_| {
                invalid_data(
                    10,
                    rusqlite::types::Type::Integer,
                    format!("invalid pull request number: {value}"),
                )
            })
        })
        .transpose()?;

    Ok(Episode {
        id: row.get(0)?,
        title: row.get(1)?,
        what_happened: row.get(2)?,
        the_pattern: row.get(3)?,
        the_fix: row.get(4)?,
        why_it_matters: row.get(5)?,
        pattern_key: parse_pattern_key(6, &pattern_key_raw)?,
        salience_score: row.get(7)?,
        triggers: parse_string_list(8, &triggers_json)?,
        source: source_repository.map(|repository| SourceRef {
            repository,
            pull_request,
            url: source_url,
        }),
    })
}

fn parse_pattern_key(column: usize, raw: &str) -> rusqlite::Result<PatternKey> {
    PatternKey::parse(raw).ok_or_else(|| {
        invalid_data(
            column,
            rusqlite::types::Type::Text,
            format!("invalid pattern_key: {raw}"),
        )
    })
}

fn parse_string_list(column: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|err| {
        invalid_data(
            column,
            rusqlite::types::Type::Text,
            format!("invalid JSON string list: {err}"),
        )
    })
}

fn invalid_data(column: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn to_sql_count(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count out of range: {value}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
pub fn timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use review_memory_core::{ConsolidationConfig, RawConsolidation, SalienceUpdate};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn fixture_store() -> SqliteReviewStore {
        let store = must(SqliteReviewStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_input(id: &str, title: &str, raw_salience: f64) -> NewEpisode {
        NewEpisode {
            id: Some(id.to_string()),
            title: title.to_string(),
            what_happened: Some(format!("{title} during review")),
            the_pattern: None,
            the_fix: None,
            why_it_matters: None,
            triggers: vec!["Review".to_string()],
            raw_salience,
            source: Some(SourceRef {
                repository: "acme/payments".to_string(),
                pull_request: Some(17),
                url: Some("https://example.invalid/acme/payments/pull/17".to_string()),
            }),
        }
    }

    fn seeded_store() -> SqliteReviewStore {
        let store = fixture_store();
        must(store.record_episode(fixture_input("e1", "Retry storm without backoff", 6.0)));
        must(store.record_episode(fixture_input("e2", "Retried non-idempotent POST", 5.0)));
        must(store.record_episode(fixture_input("e3", "Typo in error message", 9.0)));
        store
    }

    fn run_record(episode_count: usize) -> RunRecord {
        RunRecord::new("fixture", Some("sha256:abc".to_string()), false, episode_count)
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        let versions: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn recorded_episodes_are_classified_and_calibrated() {
        let store = seeded_store();
        let episodes = must(store.list_episodes());

        assert_eq!(episodes.len(), 3);
        assert_eq!(episodes[0].id, "e1");
        assert_eq!(episodes[0].pattern_key, PatternKey::RetryStrategy);
        assert_eq!(episodes[1].pattern_key, PatternKey::RetryStrategy);
        assert_eq!(episodes[2].pattern_key, PatternKey::ReviewHygiene);
        assert_eq!(episodes[2].salience_score, 3);
        assert_eq!(episodes[0].triggers, vec!["review".to_string()]);

        let loaded = must_some(must(store.get_episode("e1")));
        assert_eq!(loaded, episodes[0]);
        assert_eq!(
            loaded.source.and_then(|source| source.pull_request),
            Some(17)
        );
    }

    #[test]
    fn generated_ids_are_used_when_capture_has_none() {
        let store = fixture_store();
        let mut input = fixture_input("unused", "Deadlock in cache refresh", 5.0);
        input.id = None;
        let episode = must(store.record_episode(input));
        assert!(Ulid::from_string(&episode.id).is_ok());
    }

    #[test]
    fn duplicate_episode_ids_are_rejected() {
        let store = seeded_store();
        let result = store.record_episode(fixture_input("e1", "Another retry", 5.0));
        assert!(result.is_err());
    }

    #[test]
    fn blank_titles_are_rejected() {
        let store = fixture_store();
        let result = store.record_episode(fixture_input("e9", "   ", 5.0));
        assert!(result.is_err());
        assert!(must(store.list_episodes()).is_empty());
    }

    #[test]
    fn apply_consolidation_persists_sanitized_result() {
        let mut store = seeded_store();
        let episodes = must(store.list_episodes());
        let raw = RawConsolidation::from_value(&serde_json::json!({
            "rules_to_promote": [
                {"title": "ignored", "triggers": ["Backoff"], "source_episode_ids": ["e1", "ghost"]}
            ],
            "contradictions": [
                {"episode_a": "e2", "episode_b": "e1", "reason": "retry vs no retry"}
            ],
            "salience_updates": [
                {"episode_id": "e3", "score": 1, "reason": "cosmetic"}
            ],
            "prune_candidates": ["e3"]
        }));
        let result =
            review_memory_core::sanitize(&raw, &episodes, &ConsolidationConfig::default());

        let report = must(store.apply_consolidation(&result, &run_record(episodes.len())));
        assert_eq!(report.patterns_written, 2);
        assert_eq!(report.rules_upserted, 1);
        assert_eq!(report.contradictions_inserted, 1);
        assert_eq!(report.salience_updates_applied, 1);
        assert_eq!(report.prune_candidates_flagged, 1);

        let rules = must(store.list_rules());
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_key, PatternKey::RetryStrategy);
        assert_eq!(rules[0].source_episode_ids, vec!["e1".to_string(), "e2".to_string()]);
        assert_eq!(rules[0].triggers, vec!["backoff".to_string(), "review".to_string()]);

        let patterns = must(store.list_patterns());
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].pattern_key, PatternKey::RetryStrategy);

        let contradictions = must(store.list_contradictions());
        assert_eq!(contradictions.len(), 1);
        assert_eq!(contradictions[0].episode_a, "e2");

        let e3 = must_some(must(store.get_episode("e3")));
        assert_eq!(e3.salience_score, 1);
        let history = must(store.list_salience_history("e3"));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].previous_score, 3);
        assert_eq!(history[0].new_score, 1);

        assert_eq!(must(store.list_prune_candidates()), vec!["e3".to_string()]);
        assert_eq!(must(store.list_episodes()).len(), 3);
    }

    #[test]
    fn reapplying_does_not_duplicate_contradictions_or_flags() {
        let mut store = seeded_store();
        let result = ConsolidationResult {
            contradictions: vec![Contradiction {
                episode_a: "e1".to_string(),
                episode_b: "e2".to_string(),
                reason: "conflict".to_string(),
            }],
            prune_candidates: vec!["e2".to_string()],
            ..ConsolidationResult::default()
        };

        let first = must(store.apply_consolidation(&result, &run_record(3)));
        let second = must(store.apply_consolidation(&result, &run_record(3)));

        assert_eq!(first.contradictions_inserted, 1);
        assert_eq!(second.contradictions_inserted, 0);
        assert_eq!(second.prune_candidates_flagged, 0);
        assert_eq!(must(store.list_contradictions()).len(), 1);
        assert_eq!(must(store.list_runs(None)).len(), 2);
    }

    #[test]
    fn entries_for_missing_episodes_are_skipped() {
        let mut store = seeded_store();
        let result = ConsolidationResult {
            contradictions: vec![Contradiction {
                episode_a: "e1".to_string(),
                episode_b: "gone".to_string(),
                reason: "stale".to_string(),
            }],
            salience_updates: vec![SalienceUpdate {
                episode_id: "gone".to_string(),
                score: 9,
                reason: "stale".to_string(),
            }],
            prune_candidates: vec!["gone".to_string()],
            ..ConsolidationResult::default()
        };

        let report = must(store.apply_consolidation(&result, &run_record(3)));
        assert_eq!(report.contradictions_inserted, 0);
        assert_eq!(report.salience_updates_applied, 0);
        assert_eq!(report.prune_candidates_flagged, 0);
    }

    #[test]
    fn rule_upsert_keeps_original_promotion_time() {
        let mut store = seeded_store();
        let episodes = must(store.list_episodes());
        let result = review_memory_core::sanitize(
            &RawConsolidation::default(),
            &episodes,
            &ConsolidationConfig::default(),
        );

        let _ = must(store.apply_consolidation(&result, &run_record(3)));
        let promoted_first: String = match store.connection().query_row(
            "SELECT promoted_at FROM rules WHERE rule_key = 'retry-strategy'",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };

        let _ = must(store.apply_consolidation(&result, &run_record(3)));
        let (promoted_second, run_count): (String, i64) = match store.connection().query_row(
            "SELECT promoted_at, (SELECT COUNT(*) FROM consolidation_runs) FROM rules WHERE rule_key = 'retry-strategy'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };

        assert_eq!(promoted_first, promoted_second);
        assert_eq!(run_count, 2);
        assert_eq!(must(store.list_rules()).len(), 1);
    }

    #[test]
    fn salience_history_is_append_only() {
        let mut store = seeded_store();
        let result = ConsolidationResult {
            salience_updates: vec![SalienceUpdate {
                episode_id: "e1".to_string(),
                score: 8,
                reason: "escalated".to_string(),
            }],
            ..ConsolidationResult::default()
        };
        let _ = must(store.apply_consolidation(&result, &run_record(3)));

        let update_result = store
            .connection()
            .execute("UPDATE salience_history SET reason = 'mutated'", []);
        assert!(update_result.is_err());
    }

    #[test]
    fn status_counts_rows_and_last_run() {
        let mut store = seeded_store();
        let empty = must(store.status());
        assert_eq!(empty.episodes, 3);
        assert_eq!(empty.consolidation_runs, 0);
        assert_eq!(empty.last_run_at, None);

        let run = run_record(3);
        let _ = must(store.apply_consolidation(&ConsolidationResult::default(), &run));
        let status = must(store.status());
        assert_eq!(status.consolidation_runs, 1);
        assert!(status.last_run_at.is_some());

        let runs = must(store.list_runs(Some(1)));
        assert_eq!(runs[0].run_id, run.run_id.to_string());
        assert_eq!(runs[0].request_hash.as_deref(), Some("sha256:abc"));
        assert!(!runs[0].fallback_used);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_stored_salience_stays_in_band(raw in -20.0_f64..40.0, title_index in 0_usize..4) {
            let titles = [
                "Hardcoded API key in config",
                "Retry without backoff",
                "Typo in docs",
                "Refactored widget",
            ];
            let store = fixture_store();
            let episode = must(store.record_episode(fixture_input("p1", titles[title_index], raw)));
            let band = episode.pattern_key.salience_band();
            prop_assert!(episode.salience_score >= band.min && episode.salience_score <= band.max);

            let stored = must_some(must(store.get_episode("p1")));
            prop_assert_eq!(stored, episode);
        }
    }
}
