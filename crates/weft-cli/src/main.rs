//! Weft CLI - dependency-aware task orchestration
//!
//! Usage:
//!   weft init                     Write .weft/config.toml and example plans
//!   weft run <plan.json>          Run a plan to completion
//!   weft resume <tasks.json>      Continue a run from its task list
//!   weft graph <plan.json>        Validate a plan and show its batches
//!   weft memory list|rebuild|stats
//!   weft stats                    Dispatcher statistics from the last run

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use weft_core::{CategoryConfig, PlanResult, RecordType, WeftConfig};
use weft_memory::{MemoryStore, RecordFilter};
use weft_orchestrator::{
    CategoryStats, ErrorClassifier, HandlerRegistry, Scheduler, TaskList, DISPATCHER_STATS_TAG,
};
use weft_planning::{command_plan, example_plan, load_plan, save_plan, PlanGraph};

#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about = "Dependency-aware task orchestration")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Repository root holding .weft/
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize Weft in the repository
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Run a plan
    Run {
        /// Plan file (JSON)
        plan: PathBuf,

        /// Stop after the first batch with a failed task
        #[arg(long)]
        fail_fast: bool,

        /// Report success even if some tasks failed
        #[arg(long)]
        allow_partial: bool,

        /// Write a resumable task list here
        #[arg(long, value_name = "FILE")]
        task_list: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resume a run from its task list
    Resume {
        /// Task list file written by `weft run --task-list`
        tasks: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a plan and print its batches
    Graph {
        /// Plan file (JSON)
        plan: PathBuf,
    },

    /// Memory store management
    Memory {
        #[command(subcommand)]
        action: MemoryCommands,
    },

    /// Show dispatcher statistics recorded by the last run
    Stats,
}

#[derive(Subcommand)]
enum MemoryCommands {
    /// List records of one type
    List {
        /// episodic, semantic or procedural
        #[arg(long, short = 't', default_value = "episodic")]
        record_type: RecordType,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        tag: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Rebuild indexes by scanning record files
    Rebuild {
        /// Only this type (defaults to all)
        #[arg(long, short = 't')]
        record_type: Option<RecordType>,
    },

    /// Record counts and cache occupancy
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let repo = cli.repo;
    match cli.command {
        Commands::Init { force } => cmd_init(&repo, force).await,
        Commands::Run {
            plan,
            fail_fast,
            allow_partial,
            task_list,
            json,
        } => cmd_run(&repo, plan, fail_fast, allow_partial, task_list, json).await,
        Commands::Resume { tasks, json } => cmd_resume(&repo, tasks, json).await,
        Commands::Graph { plan } => cmd_graph(plan),
        Commands::Memory { action } => cmd_memory(&repo, action).await,
        Commands::Stats => cmd_stats(&repo).await,
    }
}

async fn cmd_init(repo: &Path, force: bool) -> Result<()> {
    info!("Initializing Weft in {:?}", repo);

    let config_path = repo.join(".weft/config.toml");
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = WeftConfig::default();
    config.resources.categories.push(CategoryConfig {
        name: "shell".to_string(),
        max_concurrency: Some(1),
        handler: "command".to_string(),
    });
    let config_path = config.write(repo)?;

    let plans_dir = repo.join(".weft/plans");
    std::fs::create_dir_all(&plans_dir)?;
    save_plan(&example_plan(), &plans_dir.join("example.json"))?;
    save_plan(&command_plan(), &plans_dir.join("shell.json"))?;

    MemoryStore::from_config(&config.memory, repo)
        .await
        .context("Failed to create memory store")?;

    println!("Initialized Weft in {:?}", repo);
    println!("Created:");
    println!("  {}", config_path.display());
    println!("  .weft/plans/example.json");
    println!("  .weft/plans/shell.json");
    println!("  {}", config.memory_root(repo).display());
    println!("\nNext steps:");
    println!("  weft graph .weft/plans/example.json");
    println!("  weft run .weft/plans/example.json --task-list .weft/tasks.json");

    Ok(())
}

/// Config, handlers, classifier rules and memory wired into a scheduler
async fn build_scheduler(repo: &Path, config: WeftConfig) -> Result<Scheduler> {
    let registry = HandlerRegistry::from_config(&config.resources, repo)?;
    let classifier =
        ErrorClassifier::from_config(&config.retry).context("Invalid [[retry.rules]] entry")?;
    let memory = MemoryStore::from_config(&config.memory, repo)
        .await
        .context("Failed to open memory store")?;
    Ok(Scheduler::new(config, Arc::new(registry))
        .with_classifier(classifier)
        .with_memory(memory))
}

async fn cmd_run(
    repo: &Path,
    plan_path: PathBuf,
    fail_fast: bool,
    allow_partial: bool,
    task_list: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let plan = load_plan(&plan_path)
        .with_context(|| format!("Failed to load plan {}", plan_path.display()))?;

    let mut config = WeftConfig::load_or_default(repo)?;
    config.scheduler.fail_fast |= fail_fast;
    config.scheduler.allow_partial_success |= allow_partial;

    let mut scheduler = build_scheduler(repo, config).await?;
    if let Some(path) = task_list {
        scheduler = scheduler.with_task_list(path);
    }

    info!("Running plan {} ({} steps)", plan.id, plan.len());
    let result = scheduler.submit_plan(&plan).await?;
    report(&result, json)
}

async fn cmd_resume(repo: &Path, tasks: PathBuf, json: bool) -> Result<()> {
    let list = TaskList::load(&tasks).await?;
    if list.is_finished() {
        println!(
            "Plan {} already finished ({}/{} completed)",
            list.plan_id, list.metadata.completed_tasks, list.metadata.total_tasks
        );
    }

    let config = WeftConfig::load_or_default(repo)?;
    let scheduler = build_scheduler(repo, config).await?;
    let result = scheduler.resume_plan(&tasks).await?;
    report(&result, json)
}

fn report(result: &PlanResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", result);
    }
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_graph(plan_path: PathBuf) -> Result<()> {
    let plan = load_plan(&plan_path)?;
    let graph = PlanGraph::compile(&plan)?;

    println!("Plan {} ({}): {} steps", plan.id, plan.name, graph.len());
    for (i, batch) in graph.batches().iter().enumerate() {
        println!("Batch {}:", i + 1);
        for id in batch {
            let Some(step) = graph.step(id) else {
                continue;
            };
            let deps: Vec<&str> = step.dependencies.iter().map(String::as_str).collect();
            print!("  {} [{}, {}]", step.id, step.resource_category, step.priority);
            if !deps.is_empty() {
                print!(" <- {}", deps.join(", "));
            }
            println!();
        }
    }
    Ok(())
}

async fn open_memory(repo: &Path) -> Result<MemoryStore> {
    let config = WeftConfig::load_or_default(repo)?;
    MemoryStore::from_config(&config.memory, repo)
        .await
        .context("Failed to open memory store")
}

async fn cmd_memory(repo: &Path, action: MemoryCommands) -> Result<()> {
    let memory = open_memory(repo).await?;

    match action {
        MemoryCommands::List {
            record_type,
            category,
            tag,
            limit,
        } => {
            let mut filter = RecordFilter::new().newest_first().limit(limit);
            if let Some(category) = category {
                filter = filter.category(category);
            }
            if let Some(tag) = tag {
                filter = filter.tag(tag);
            }

            let records = memory.query(record_type, filter).await.collect().await;
            if records.is_empty() {
                println!("No {} records", record_type);
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {}  {:<10} [{}]",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.id,
                    record.category,
                    record.tags.join(", ")
                );
                println!("    {}", record.content);
            }
        }

        MemoryCommands::Rebuild { record_type } => {
            let types = match record_type {
                Some(t) => vec![t],
                None => RecordType::ALL.to_vec(),
            };
            for t in types {
                let count = memory.rebuild_index(t).await?;
                println!("Rebuilt {} index: {} records", t, count);
            }
        }

        MemoryCommands::Stats => {
            println!("Memory Store");
            println!("============");
            println!("Root: {}", memory.root().display());
            for (record_type, count) in memory.counts() {
                println!("\n{}: {} records", record_type, count);
                for (category, n) in memory.category_counts(record_type) {
                    println!("  {:<16} {}", category, n);
                }
            }
            let cache = memory.cache_stats();
            println!(
                "\nCache: {}/{} entries, {} hits, {} misses",
                cache.len, cache.capacity, cache.hits, cache.misses
            );
        }
    }

    Ok(())
}

async fn cmd_stats(repo: &Path) -> Result<()> {
    let memory = open_memory(repo).await?;
    let mut query = memory
        .query(
            RecordType::Semantic,
            RecordFilter::new()
                .tag(DISPATCHER_STATS_TAG)
                .newest_first()
                .limit(1),
        )
        .await;

    let Some(record) = query.next().await else {
        println!("No dispatcher statistics recorded yet; run a plan first");
        return Ok(());
    };
    let stats: Vec<CategoryStats> = serde_json::from_value(record.content["categories"].clone())
        .context("Malformed dispatcher statistics record")?;

    println!(
        "Dispatcher statistics for plan {} ({})",
        record.content["plan_id"].as_str().unwrap_or("unknown"),
        record.timestamp.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "{:<16} {:>5} {:>5} {:>6} {:>6} {:>6} {:>8}",
        "category", "max", "peak", "runs", "ok", "fail", "avg(s)"
    );
    for s in stats {
        println!(
            "{:<16} {:>5} {:>5} {:>6} {:>6} {:>6} {:>8.2}",
            s.category,
            s.max,
            s.peak_load,
            s.total_executions,
            s.success_count,
            s.failure_count,
            s.avg_duration_seconds
        );
    }
    Ok(())
}
