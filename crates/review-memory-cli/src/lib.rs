//! `rmk`: command surface over the review memory kernel.
//!
//! Every command prints pretty JSON on stdout, except `catalog` without
//! `--json`. Diagnostics go to stderr through `tracing`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use review_memory_core::{
    calibrate_initial, catalog, classify_with_scores, sanitize_with_report, CategoryScore,
    ConsolidationConfig, ConsolidationResult, Episode, NewEpisode, PatternKey, RawConsolidation,
    SalienceBand, SanitizeReport, SourceRef,
};
use review_memory_provider::{
    run_consolidation, ConsolidationOutcome, ConsolidationProvider, FixtureProvider,
    HttpJsonProvider, HttpProviderConfig, DEFAULT_HTTP_TIMEOUT_MS,
};
use review_memory_store_sqlite::{ApplyReport, RunRecord, SqliteReviewStore};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "rmk")]
#[command(about = "Review Memory Kernel CLI")]
pub struct Cli {
    #[arg(long, default_value = "./review_memory.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Episode {
        #[command(subcommand)]
        command: EpisodeCommand,
    },
    /// Classify text without touching the database.
    Classify(ClassifyArgs),
    /// List the closed pattern catalog.
    Catalog(CatalogArgs),
    /// Sanitize a candidate against an episode file without touching the database.
    Sanitize(SanitizeArgs),
    Consolidate(ConsolidateArgs),
    Rules {
        #[command(subcommand)]
        command: ListCommand,
    },
    Patterns {
        #[command(subcommand)]
        command: ListCommand,
    },
    Contradictions {
        #[command(subcommand)]
        command: ListCommand,
    },
    Prune {
        #[command(subcommand)]
        command: ListCommand,
    },
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    Status,
}

#[derive(Debug, Subcommand)]
pub enum EpisodeCommand {
    Add(EpisodeAddArgs),
    List,
    Show {
        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, Args)]
pub struct EpisodeAddArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    title: String,
    #[arg(long)]
    what_happened: Option<String>,
    #[arg(long)]
    the_pattern: Option<String>,
    #[arg(long)]
    the_fix: Option<String>,
    #[arg(long)]
    why_it_matters: Option<String>,
    #[arg(long = "trigger")]
    triggers: Vec<String>,
    #[arg(long, default_value_t = 5.0)]
    salience: f64,
    #[arg(long)]
    source_repository: Option<String>,
    #[arg(long, requires = "source_repository")]
    source_pull_request: Option<u64>,
    #[arg(long, requires = "source_repository")]
    source_url: Option<String>,
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    narrative: Option<String>,
    #[arg(long = "trigger")]
    triggers: Vec<String>,
    #[arg(long, default_value_t = 5.0)]
    salience: f64,
}

#[derive(Debug, Args)]
pub struct CatalogArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SanitizeArgs {
    /// JSON array of episodes.
    #[arg(long)]
    episodes: PathBuf,
    /// Raw candidate JSON as returned by the inference step.
    #[arg(long)]
    candidate: PathBuf,
    #[arg(long)]
    min_rule_support: Option<String>,
}

#[derive(Debug, Args)]
#[command(group(
    ArgGroup::new("candidate_source")
        .required(true)
        .args(["candidate_file", "provider_url"])
))]
pub struct ConsolidateArgs {
    #[arg(long)]
    candidate_file: Option<PathBuf>,
    #[arg(long)]
    provider_url: Option<String>,
    /// Environment variable holding the provider bearer token.
    #[arg(long, requires = "provider_url")]
    auth_bearer_env: Option<String>,
    #[arg(long, default_value_t = DEFAULT_HTTP_TIMEOUT_MS)]
    timeout_ms: u64,
    /// Extra provider header as `name=value`. Repeatable.
    #[arg(long = "header", requires = "provider_url")]
    headers: Vec<String>,
    #[arg(long)]
    min_rule_support: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
pub enum ListCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Debug, Serialize)]
struct ClassifyOutput {
    pattern_key: PatternKey,
    label: &'static str,
    super_category: &'static str,
    salience_band: SalienceBand,
    salience_score: u8,
    matched: bool,
    scores: Vec<CategoryScore>,
}

#[derive(Debug, Serialize)]
struct SanitizeOutput {
    result: ConsolidationResult,
    report: SanitizeReport,
}

#[derive(Debug, Serialize)]
struct ConsolidateOutput {
    dry_run: bool,
    outcome: ConsolidationOutcome,
    applied: Option<ApplyReport>,
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when input files cannot be read, the store cannot be
/// opened or migrated, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Classify(args) => run_classify(&args),
        Command::Catalog(args) => run_catalog(&args),
        Command::Sanitize(args) => run_sanitize(&args),
        command => {
            let mut store = SqliteReviewStore::open(&cli.db)?;
            store.migrate()?;
            run_with_store(command, &mut store)
        }
    }
}

/// Executes a store-backed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or consolidation fails.
pub fn run_with_store(command: Command, store: &mut SqliteReviewStore) -> Result<()> {
    match command {
        Command::Episode { command } => run_episode(command, store),
        Command::Consolidate(args) => run_consolidate(&args, store),
        Command::Rules {
            command: ListCommand::List,
        } => print_json(&store.list_rules()?),
        Command::Patterns {
            command: ListCommand::List,
        } => print_json(&store.list_patterns()?),
        Command::Contradictions {
            command: ListCommand::List,
        } => print_json(&store.list_contradictions()?),
        Command::Prune {
            command: ListCommand::List,
        } => print_json(&store.list_prune_candidates()?),
        Command::Runs {
            command: RunsCommand::List { limit },
        } => print_json(&store.list_runs(limit)?),
        Command::Status => print_json(&store.status()?),
        Command::Classify(args) => run_classify(&args),
        Command::Catalog(args) => run_catalog(&args),
        Command::Sanitize(args) => run_sanitize(&args),
    }
}

fn run_episode(command: EpisodeCommand, store: &SqliteReviewStore) -> Result<()> {
    match command {
        EpisodeCommand::Add(args) => {
            let source = args.source_repository.map(|repository| SourceRef {
                repository,
                pull_request: args.source_pull_request,
                url: args.source_url,
            });
            let episode = store.record_episode(NewEpisode {
                id: args.id,
                title: args.title,
                what_happened: args.what_happened,
                the_pattern: args.the_pattern,
                the_fix: args.the_fix,
                why_it_matters: args.why_it_matters,
                triggers: args.triggers,
                raw_salience: args.salience,
                source,
            })?;
            print_json(&episode)
        }
        EpisodeCommand::List => print_json(&store.list_episodes()?),
        EpisodeCommand::Show { id } => {
            let episode = store
                .get_episode(&id)?
                .ok_or_else(|| anyhow!("episode {id} not found"))?;
            print_json(&episode)
        }
    }
}

fn run_classify(args: &ClassifyArgs) -> Result<()> {
    let classification = classify_with_scores(
        Some(args.title.as_str()),
        args.narrative.as_deref(),
        &args.triggers,
    );
    let pattern_key = classification.pattern_key;
    print_json(&ClassifyOutput {
        pattern_key,
        label: pattern_key.label(),
        super_category: pattern_key.super_category().as_str(),
        salience_band: pattern_key.salience_band(),
        salience_score: calibrate_initial(args.salience, pattern_key),
        matched: classification.matched,
        scores: classification.scores,
    })
}

fn run_catalog(args: &CatalogArgs) -> Result<()> {
    let entries = catalog();
    if args.json {
        return print_json(&entries);
    }

    for entry in entries {
        println!(
            "{:>2}  {:<22} {:<16} {:>2}-{:<2}  {}",
            entry.priority,
            entry.pattern_key.as_str(),
            entry.super_category.as_str(),
            entry.salience_band.min,
            entry.salience_band.max,
            entry.label
        );
    }
    Ok(())
}

fn run_sanitize(args: &SanitizeArgs) -> Result<()> {
    let episodes = read_episodes(&args.episodes)?;
    let candidate = std::fs::read_to_string(&args.candidate)
        .with_context(|| format!("failed to read candidate file {}", args.candidate.display()))?;
    let config = resolve_config(args.min_rule_support.as_deref());

    let raw = RawConsolidation::from_json_str(&candidate);
    let (result, report) = sanitize_with_report(&raw, &episodes, &config);
    print_json(&SanitizeOutput { result, report })
}

fn run_consolidate(args: &ConsolidateArgs, store: &mut SqliteReviewStore) -> Result<()> {
    let config = resolve_config(args.min_rule_support.as_deref());
    let provider = build_provider(args)?;

    let episodes = store.list_episodes()?;
    let prior_rules = store.list_rules()?;
    let outcome = run_consolidation(provider.as_ref(), &episodes, &prior_rules, &config)?;

    let applied = if args.dry_run {
        tracing::info!(
            request_hash = outcome.request_hash.as_deref().unwrap_or_default(),
            "dry run; consolidation result not persisted"
        );
        None
    } else if outcome.episode_count == 0 {
        tracing::info!("no episodes recorded; nothing to persist");
        None
    } else {
        let run = RunRecord::new(
            outcome.provider_name.clone(),
            outcome.request_hash.clone(),
            outcome.fallback_used,
            outcome.episode_count,
        );
        Some(store.apply_consolidation(&outcome.result, &run)?)
    };

    print_json(&ConsolidateOutput {
        dry_run: args.dry_run,
        outcome,
        applied,
    })
}

fn build_provider(args: &ConsolidateArgs) -> Result<Box<dyn ConsolidationProvider>> {
    if let Some(path) = &args.candidate_file {
        return Ok(Box::new(FixtureProvider::from_path(path)?));
    }

    let url = args
        .provider_url
        .clone()
        .ok_or_else(|| anyhow!("either --candidate-file or --provider-url is required"))?;
    let config = HttpProviderConfig {
        url,
        timeout_ms: args.timeout_ms,
        headers: parse_headers(&args.headers)?,
        auth_bearer_env: args.auth_bearer_env.clone(),
    };
    Ok(Box::new(HttpJsonProvider::new(config)?))
}

fn parse_headers(raw_headers: &[String]) -> Result<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();
    for raw in raw_headers {
        let (name, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("--header must be name=value, got '{raw}'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("--header name MUST be non-empty, got '{raw}'"));
        }
        headers.insert(name.to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(headers)
}

fn resolve_config(min_rule_support: Option<&str>) -> ConsolidationConfig {
    let config = ConsolidationConfig::from_env();
    match min_rule_support {
        Some(raw) => config.with_min_rule_support(raw),
        None => config,
    }
}

fn read_episodes(path: &Path) -> Result<Vec<Episode>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read episodes file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("episodes file {} is not a JSON episode array", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
