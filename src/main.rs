//! crawlq: operator commands for the crawl queue.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crawlqueue::config::{Config, Settings};
use crawlqueue::connectors::simulated::SimulatedConnector;
use crawlqueue::connectors::{ChildReference, ConnectorRegistry};
use crawlqueue::jobs::now_ms;
use crawlqueue::models::{DocumentOutcome, JobDescription, JobType, RepositoryConnection};
use crawlqueue::scheduler::SchedulerContext;
use crawlqueue::store::{init_schema, EntryQuery, MemoryStore, QueueStore, SqliteStore, StoreTxn};
use crawlqueue::QueueManager;

#[derive(Parser, Debug)]
#[command(name = "crawlq")]
#[command(about = "Fair, throttle-aware crawl queue scheduler", version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Data directory holding the queue database
    #[arg(long, global = true, value_name = "DIR", env = "CRAWLQUEUE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the queue database
    Init,
    /// Show queue counts per status
    Status {
        #[arg(long)]
        job: Option<i64>,
    },
    /// Recover the work of a dead process
    Cleanup {
        #[arg(long)]
        process: String,
    },
    /// Reset every process after a full cluster stop
    RestartCluster,
    /// Run the two-host throttling scenario in memory
    Simulate {
        /// Fetch completions, alternating between the hosts
        #[arg(long, default_value_t = 100)]
        fetches: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "crawlqueue=debug" } else { "crawlqueue=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    if let Some(path) = &cli.config {
        std::env::set_var("CRAWLQUEUE_CONFIG", path);
    }
    let config = Config::load().await;
    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings);
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }

    match cli.command {
        Command::Init => {
            settings
                .ensure_directories()
                .with_context(|| format!("creating {}", settings.data_dir.display()))?;
            init_schema(&settings.database_path())?;
            println!("Initialized {}", settings.database_path().display());
        }
        Command::Status { job } => {
            let manager = open_manager(settings, &config)?;
            for record in manager.list_jobs()? {
                if job.is_some_and(|id| id != record.id()) {
                    continue;
                }
                println!(
                    "job {:>4}  {:<24} {:?}{}",
                    record.id(),
                    record.description.name,
                    record.status,
                    record
                        .error
                        .as_ref()
                        .map(|e| format!("  ({})", e.message))
                        .unwrap_or_default()
                );
            }
            for (status, count) in manager.queue_counts(job)? {
                println!("  {:<22} {}", status.label(), count);
            }
        }
        Command::Cleanup { process } => {
            let manager = open_manager(settings, &config)?;
            let summary = manager.cleanup_process_data(&process, now_ms())?;
            println!(
                "Process {}: {} entries reset, {} seeds restored, {} seeding passes released",
                process, summary.entries_reset, summary.seeds_restored, summary.seeding_released
            );
        }
        Command::RestartCluster => {
            let manager = open_manager(settings, &config)?;
            let summary = manager.restart_cluster(now_ms())?;
            println!(
                "Cluster reset: {} entries reset, {} seeds restored, {} seeding passes released",
                summary.entries_reset, summary.seeds_restored, summary.seeding_released
            );
        }
        Command::Simulate { fetches } => {
            let averages = simulate(settings, fetches)?;
            for (host, average) in averages {
                println!("{:<8} average priority {:.4}", host, average);
            }
        }
    }
    Ok(())
}

fn open_manager(settings: Settings, config: &Config) -> Result<QueueManager<SqliteStore>> {
    let db_path = settings.database_path();
    settings.ensure_directories()?;
    let store = SqliteStore::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    let ctx = SchedulerContext::new(settings, ConnectorRegistry::new());
    for connection in &config.connections {
        ctx.add_connection(connection.clone());
    }
    let manager = QueueManager::new(Arc::new(store), Arc::new(ctx));
    let created = manager.register_jobs(&config.jobs)?;
    if created > 0 {
        info!("Registered {} configured jobs", created);
    }
    Ok(manager)
}

/// Fetch alternately on a throttled and an unthrottled host, each fetch
/// discovering one more page on its host, and report the average priority
/// each host's pages received.
fn simulate(settings: Settings, fetches: usize) -> Result<BTreeMap<String, f64>> {
    let mut registry = ConnectorRegistry::new();
    registry.register_repository(Arc::new(SimulatedConnector::new("sim")));
    let ctx = SchedulerContext::new(settings, registry);
    ctx.add_connection(RepositoryConnection::new("web", "sim").with_throttle("^host-a$", 1.0));
    let manager = QueueManager::new(Arc::new(MemoryStore::new()), Arc::new(ctx));

    manager.create_job(JobDescription::new(1, "simulation", "web", JobType::Specified))?;
    let mut clock = now_ms();
    manager.start_job(1, clock)?;
    manager.add_seeds(1, &["http://host-a/0".to_string(), "http://host-b/0".to_string()], clock)?;

    let hosts = ["host-a", "host-b"];
    let mut fetched = 0usize;
    let mut idle_rounds = 0usize;
    while fetched < fetches && idle_rounds < 10 {
        // One throttled fetch per simulated minute.
        clock += 61_000;
        let wanted = hosts[fetched % 2];
        let mut results = Vec::new();
        let mut done = false;
        for batch in manager.get_next_documents(10, clock)? {
            for document in batch.documents {
                if !done && host_of(&document.document_identifier) == wanted {
                    let child = ChildReference::new(&format!("http://{wanted}/{}", fetched + 1));
                    manager.add_document_references(1, &document.document_identifier, &[child], clock)?;
                    results.push((document.doc_hash, DocumentOutcome::processed("v1")));
                    done = true;
                } else {
                    results.push((document.doc_hash, DocumentOutcome::Abandoned));
                }
            }
        }
        manager.complete_documents(1, &results, clock)?;
        if done {
            fetched += 1;
            idle_rounds = 0;
        } else {
            idle_rounds += 1;
        }
    }
    info!("Simulated {} fetches", fetched);

    let entries = manager
        .store()
        .transaction(&mut |txn: &mut dyn StoreTxn| txn.query_entries(&EntryQuery::for_job(1)))?;
    let mut totals: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for entry in entries {
        let Some(priority) = entry.priority else { continue };
        let total = totals.entry(host_of(&entry.doc_id).to_string()).or_default();
        total.0 += priority;
        total.1 += 1;
    }
    Ok(totals
        .into_iter()
        .map(|(host, (sum, count))| (host, sum / count.max(1) as f64))
        .collect())
}

fn host_of(identifier: &str) -> &str {
    identifier
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default()
}
