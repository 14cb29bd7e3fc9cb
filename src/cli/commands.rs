//! CLI command definitions for lesson-forge.
//!
//! Every command except `run --in-memory` works against the Postgres
//! database named by `DATABASE_URL` (or `database_url` in the config file).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheFilter, CacheStats};
use crate::config::EngineConfig;
use crate::engine::{ContentStatus, Engine, LookupOutcome, MissPolicy};
use crate::identity::{ContentIdentity, DEFAULT_CONTAINER, DEFAULT_TENANT};
use crate::metrics::{export_metrics, init_metrics};
use crate::producer::{ContentProducer, HttpProducer};
use crate::queue::QueueStats;
use crate::storage::{Database, MigrationRunner};

/// Pre-generation queue and content cache engine.
#[derive(Parser)]
#[command(name = "lesson-forge")]
#[command(about = "Pre-generate and cache AI-produced learning content")]
#[command(version)]
#[command(
    long_about = "lesson-forge keeps generated learning content ready before learners ask for it.\n\nA worker pool drains the generation queue into the content cache while the scheduler\nwarms configured dimensions and follows learner navigation.\n\nExample usage:\n  lesson-forge migrate\n  lesson-forge run --workers 8\n  lesson-forge lookup 5 Math fractions --on-miss enqueue"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. Environment variables override its values.
    #[arg(short, long, env = "LESSON_FORGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply the database schema.
    Migrate(MigrateArgs),

    /// Run the worker pool and maintenance loops until interrupted.
    Run(RunArgs),

    /// Submit an identity for production.
    Enqueue(EnqueueArgs),

    /// Look up an identity in the cache.
    Lookup(LookupArgs),

    /// Report whether an identity is available, in progress, or failed.
    Status(StatusArgs),

    /// Run one eviction sweep.
    Evict(EvictArgs),

    /// Invalidate cache entries by identity fields.
    Invalidate(InvalidateArgs),

    /// Cancel a pending queue item.
    Cancel(CancelArgs),

    /// Run one warming pass over the configured rules.
    Warm(OutputArgs),

    /// List registered workers.
    Workers(OutputArgs),

    /// Show queue and cache statistics.
    Stats(OutputArgs),

    /// Print Prometheus metrics.
    Metrics,
}

/// Fields naming one piece of content.
#[derive(Args, Debug, Clone)]
pub struct IdentityArgs {
    /// Learner grade (e.g. 5, K).
    pub grade: String,

    /// Subject (e.g. Math).
    pub subject: String,

    /// Skill within the subject.
    pub skill: String,

    #[arg(long, default_value = DEFAULT_TENANT)]
    pub tenant: String,

    /// Career context the content is framed in.
    #[arg(long)]
    pub career: Option<String>,

    /// Container type (lesson, quiz, practice, ...).
    #[arg(long, default_value = DEFAULT_CONTAINER)]
    pub container: String,

    #[arg(long)]
    pub variant: Option<String>,
}

impl IdentityArgs {
    fn identity(&self) -> ContentIdentity {
        let mut identity = ContentIdentity::new(&self.grade, &self.subject, &self.skill)
            .with_tenant(&self.tenant)
            .with_container(&self.container);
        if let Some(career) = &self.career {
            identity = identity.with_career(career);
        }
        if let Some(variant) = &self.variant {
            identity = identity.with_variant(variant);
        }
        identity
    }
}

/// Shared output flag.
#[derive(Args, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `lesson-forge migrate`.
#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// List known migrations and when they were applied, without applying any.
    #[arg(long)]
    pub status: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// Arguments for `lesson-forge run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Keep all state in process memory instead of Postgres.
    #[arg(long)]
    pub in_memory: bool,

    /// Override the configured number of workers.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Producer endpoint; overrides the configured one.
    #[arg(long, env = "LESSON_FORGE_PRODUCER_ENDPOINT")]
    pub producer_endpoint: Option<String>,

    /// Bearer token sent to the producer endpoint.
    #[arg(long, env = "LESSON_FORGE_PRODUCER_API_KEY", hide_env_values = true)]
    pub producer_api_key: Option<String>,
}

/// Arguments for `lesson-forge enqueue`.
#[derive(Args, Debug)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Priority; lower is served first. Defaults to the user priority.
    #[arg(short, long)]
    pub priority: Option<i32>,

    /// Retries after the first failed attempt.
    #[arg(long)]
    pub max_retries: Option<u32>,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// What `lookup` does on a miss.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMiss {
    None,
    Enqueue,
    Produce,
}

impl From<OnMiss> for MissPolicy {
    fn from(value: OnMiss) -> Self {
        match value {
            OnMiss::None => MissPolicy::None,
            OnMiss::Enqueue => MissPolicy::Enqueue,
            OnMiss::Produce => MissPolicy::Produce,
        }
    }
}

/// Arguments for `lesson-forge lookup`.
#[derive(Args, Debug)]
pub struct LookupArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Action on a cache miss.
    #[arg(long, value_enum, default_value = "none")]
    pub on_miss: OnMiss,

    /// Producer endpoint used with `--on-miss produce`.
    #[arg(long, env = "LESSON_FORGE_PRODUCER_ENDPOINT")]
    pub producer_endpoint: Option<String>,

    /// Print the artifact instead of a summary.
    #[arg(long)]
    pub raw: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// Arguments for `lesson-forge status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// Arguments for `lesson-forge evict`.
#[derive(Args, Debug)]
pub struct EvictArgs {
    /// Grace period in seconds; overrides the configured one.
    #[arg(long)]
    pub grace_secs: Option<u64>,
}

/// Arguments for `lesson-forge invalidate`.
#[derive(Args, Debug)]
pub struct InvalidateArgs {
    #[arg(long)]
    pub tenant: Option<String>,
    #[arg(long)]
    pub grade: Option<String>,
    #[arg(long)]
    pub subject: Option<String>,
    #[arg(long)]
    pub skill: Option<String>,
    #[arg(long)]
    pub career: Option<String>,
    #[arg(long)]
    pub container: Option<String>,

    /// Required when no field is given; invalidates every entry.
    #[arg(long)]
    pub all: bool,
}

impl InvalidateArgs {
    fn filter(&self) -> CacheFilter {
        CacheFilter {
            tenant: self.tenant.clone(),
            grade: self.grade.clone(),
            subject: self.subject.clone(),
            skill: self.skill.clone(),
            career: self.career.clone(),
            container: self.container.clone(),
        }
    }
}

/// Arguments for `lesson-forge cancel`.
#[derive(Args, Debug)]
pub struct CancelArgs {
    /// Queue item id.
    pub item_id: Uuid,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Migrate(args) => run_migrate_command(args, &config).await,
        Commands::Run(args) => {
            if let Some(workers) = args.workers {
                config = config.with_num_workers(workers);
                config.validate()?;
            }
            run_engine_command(args, config).await
        }
        Commands::Enqueue(args) => run_enqueue_command(args, config).await,
        Commands::Lookup(args) => run_lookup_command(args, config).await,
        Commands::Status(args) => run_status_command(args, config).await,
        Commands::Evict(args) => {
            if let Some(secs) = args.grace_secs {
                config = config.with_eviction_grace(Duration::from_secs(secs));
            }
            run_evict_command(config).await
        }
        Commands::Invalidate(args) => run_invalidate_command(args, config).await,
        Commands::Cancel(args) => run_cancel_command(args, config).await,
        Commands::Warm(args) => run_warm_command(args, config).await,
        Commands::Workers(args) => run_workers_command(args, config).await,
        Commands::Stats(args) => run_stats_command(args, config).await,
        Commands::Metrics => run_metrics_command(config).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

fn build_producer(
    endpoint: Option<String>,
    api_key: Option<String>,
    config: &EngineConfig,
) -> anyhow::Result<Option<Arc<dyn ContentProducer>>> {
    let Some(endpoint) = endpoint.or_else(|| config.producer_endpoint.clone()) else {
        return Ok(None);
    };
    let mut producer = HttpProducer::with_timeout(endpoint, config.producer_timeout)?;
    if let Some(key) = api_key {
        producer = producer.with_api_key(key);
    }
    info!(endpoint = %producer.endpoint(), "Using HTTP producer");
    Ok(Some(Arc::new(producer)))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_migrate_command(args: MigrateArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let db = Database::connect(config.require_database_url()?).await?;

    if args.status {
        let states = MigrationRunner::new(db.pool().clone()).status().await?;
        if args.output.json {
            return print_json(&states);
        }
        for state in &states {
            match state.applied_at {
                Some(at) => println!("  {:>3}  {:<28} applied {}", state.version, state.name, at),
                None => println!("  {:>3}  {:<28} pending", state.version, state.name),
            }
        }
        return Ok(());
    }

    let applied = db.run_migrations().await?;
    println!("✓ Schema up to date ({} migrations applied)", applied);
    Ok(())
}

async fn run_engine_command(args: RunArgs, config: EngineConfig) -> anyhow::Result<()> {
    init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;

    let producer = build_producer(args.producer_endpoint, args.producer_api_key, &config)?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "A producer endpoint is required.\n\
                 Provide it via --producer-endpoint <URL> or set LESSON_FORGE_PRODUCER_ENDPOINT."
            )
        })?;

    let engine = if args.in_memory {
        warn!("Running with in-memory stores; state is lost on exit");
        Engine::in_memory(config)
    } else {
        Engine::connect(config).await?
    };
    let engine = Arc::new(engine.with_producer(producer));

    let mut pool = engine.start_workers().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let loops = engine.spawn_maintenance(&shutdown_tx);

    info!(
        workers = pool.num_workers(),
        rules = engine.scheduler().rules().len(),
        "lesson-forge running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(());
    let pool_result = pool.shutdown().await;
    for handle in loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "Maintenance loop ended abnormally");
        }
    }

    let stats = pool.stats();
    println!("✓ lesson-forge stopped");
    println!(
        "  Items: {} completed, {} failed",
        stats.items_completed, stats.items_failed
    );
    pool_result?;
    Ok(())
}

async fn run_enqueue_command(args: EnqueueArgs, config: EngineConfig) -> anyhow::Result<()> {
    let priority = args.priority.unwrap_or(config.user_priority);
    let max_retries = args.max_retries.unwrap_or(config.default_max_retries);
    let engine = Engine::connect(config).await?;

    let identity = args.identity.identity();
    let enqueued = engine.enqueue(&identity, priority, max_retries).await?;

    if args.output.json {
        return print_json(&enqueued);
    }
    if enqueued.coalesced {
        println!("✓ Already queued as {}", enqueued.item_id);
    } else {
        println!("✓ Queued {} as {}", identity, enqueued.item_id);
    }
    Ok(())
}

async fn run_lookup_command(args: LookupArgs, config: EngineConfig) -> anyhow::Result<()> {
    let producer = build_producer(args.producer_endpoint, None, &config)?;
    let mut engine = Engine::connect(config).await?;
    if let Some(producer) = producer {
        engine = engine.with_producer(producer);
    }

    let outcome = engine
        .lookup(&args.identity.identity(), args.on_miss.into())
        .await?;

    if args.raw {
        match outcome.entry() {
            Some(entry) => println!("{}", entry.artifact),
            None => anyhow::bail!("Content is not available"),
        }
        return Ok(());
    }
    if args.output.json {
        return print_json(&outcome);
    }

    match outcome {
        LookupOutcome::Hit(entry) | LookupOutcome::Produced(entry) => {
            println!("✓ {} ({} bytes)", entry.identity_key, entry.artifact.len());
            println!("  Expires: {}", entry.expires_at);
            println!("  Hits: {}", entry.hit_count);
        }
        LookupOutcome::Pending { item_id, coalesced } => {
            let note = if coalesced { " (already queued)" } else { "" };
            println!("… Not yet available, queue item {}{}", item_id, note);
        }
        LookupOutcome::Failed { item_id, error } => {
            println!("✗ Generation failed for queue item {}", item_id);
            if let Some(error) = error {
                println!("  Error: {}", error);
            }
        }
        LookupOutcome::Miss { reason } => {
            println!("✗ Miss ({:?})", reason);
        }
    }
    Ok(())
}

async fn run_status_command(args: StatusArgs, config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::connect(config).await?;
    let status = engine.content_status(&args.identity.identity()).await?;

    if args.output.json {
        return print_json(&status);
    }
    match status {
        ContentStatus::Available {
            entry_id,
            expires_at,
        } => println!("✓ Available (entry {}, expires {})", entry_id, expires_at),
        ContentStatus::NotYetAvailable {
            item_id,
            queue_status,
            retry_count,
        } => println!(
            "… Not yet available (item {}, {}, {} retries)",
            item_id, queue_status, retry_count
        ),
        ContentStatus::GenerationFailed { item_id, error } => println!(
            "✗ Generation failed (item {}): {}",
            item_id,
            error.unwrap_or_default()
        ),
        ContentStatus::Unknown => println!("? Unknown"),
    }
    Ok(())
}

async fn run_evict_command(config: EngineConfig) -> anyhow::Result<()> {
    let grace = config.eviction_grace;
    let engine = Engine::connect(config).await?;
    let removed = engine.evict_expired().await?;
    println!("✓ Evicted {} entries (grace {:?})", removed, grace);
    Ok(())
}

async fn run_invalidate_command(args: InvalidateArgs, config: EngineConfig) -> anyhow::Result<()> {
    let filter = args.filter();
    if filter.is_empty() && !args.all {
        anyhow::bail!("Refusing to invalidate every entry without --all");
    }
    let engine = Engine::connect(config).await?;
    let count = engine.invalidate_where(&filter).await?;
    println!("✓ Invalidated {} entries", count);
    Ok(())
}

async fn run_cancel_command(args: CancelArgs, config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::connect(config).await?;
    let item = engine.cancel(args.item_id).await?;
    println!("✓ Cancelled {} ({})", item.id, item.identity_key);
    Ok(())
}

async fn run_warm_command(args: OutputArgs, config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::connect(config).await?;
    let report = engine.scheduler().warm().await?;

    if args.json {
        return print_json(&report);
    }
    println!("✓ Warming pass complete");
    println!(
        "  Identities: {} ({} satisfied, {} already queued, {} failed)",
        report.identities, report.satisfied, report.already_queued, report.failed
    );
    println!("  Enqueued: {}", report.enqueued.len());
    Ok(())
}

async fn run_workers_command(args: OutputArgs, config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::connect(config).await?;
    let workers = engine.coordinator().workers().await?;

    if args.json {
        return print_json(&workers);
    }
    if workers.is_empty() {
        println!("No workers registered");
        return Ok(());
    }
    for worker in workers {
        let item = worker
            .current_item
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<8} heartbeat {}  item {}  processed {}  failed {}",
            worker.name,
            worker.status,
            worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S"),
            item,
            worker.processed_count,
            worker.failed_count
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    queue: QueueStats,
    cache: CacheStats,
}

async fn run_stats_command(args: OutputArgs, config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::connect(config).await?;
    let output = StatsOutput {
        queue: engine.queue().stats().await?,
        cache: engine.cache().stats(chrono::Utc::now()).await?,
    };

    if args.json {
        return print_json(&output);
    }
    let queue = &output.queue;
    println!("Queue");
    println!(
        "  pending {}  leased {}  completed {}  failed {}  cancelled {}",
        queue.pending, queue.leased, queue.completed, queue.failed, queue.cancelled
    );
    println!("Cache");
    println!(
        "  entries {}  valid {}",
        output.cache.entries, output.cache.valid_entries
    );
    Ok(())
}

async fn run_metrics_command(config: EngineConfig) -> anyhow::Result<()> {
    init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    let engine = Engine::connect(config).await?;
    engine.refresh_gauges().await?;
    print!("{}", export_metrics());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_lookup() {
        let cli = Cli::try_parse_from([
            "lesson-forge",
            "lookup",
            "5",
            "Math",
            "fractions",
            "--career",
            "nursing",
            "--on-miss",
            "enqueue",
        ])
        .unwrap();

        let Commands::Lookup(args) = cli.command else {
            panic!("expected lookup");
        };
        assert_eq!(args.on_miss, OnMiss::Enqueue);
        let identity = args.identity.identity();
        assert_eq!(identity.career.as_deref(), Some("nursing"));
        assert_eq!(identity.container, DEFAULT_CONTAINER);
        assert_eq!(identity.tenant, DEFAULT_TENANT);
    }

    #[test]
    fn test_parse_run_with_global_flags() {
        let cli = Cli::try_parse_from([
            "lesson-forge",
            "run",
            "--in-memory",
            "-w",
            "2",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.in_memory);
        assert_eq!(args.workers, Some(2));
    }

    #[test]
    fn test_parse_migrate_status() {
        let cli = Cli::try_parse_from(["lesson-forge", "migrate", "--status", "--json"]).unwrap();
        let Commands::Migrate(args) = cli.command else {
            panic!("expected migrate");
        };
        assert!(args.status);
        assert!(args.output.json);
    }

    #[test]
    fn test_invalidate_filter() {
        let cli = Cli::try_parse_from([
            "lesson-forge",
            "invalidate",
            "--grade",
            "5",
            "--subject",
            "Math",
        ])
        .unwrap();

        let Commands::Invalidate(args) = cli.command else {
            panic!("expected invalidate");
        };
        let filter = args.filter();
        assert_eq!(filter.grade.as_deref(), Some("5"));
        assert!(filter.skill.is_none());
        assert!(!filter.is_empty());
    }
}
