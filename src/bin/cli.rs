//! edition-sync CLI
//!
//! Local entry point for imports, scheduled syncing, manual triggers,
//! snapshot review and AI-drafted extraction rules.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use edition_sync::{
    error::{AppError, Result},
    models::{Config, EditionFields, Registry, RuleTemplate, SnapshotStatus},
    pipeline::{LinkSyncer, PassReport, Scheduler, SyncEngine},
    services::{Correction, HttpFetcher, OpenAiRuleProvider, ReviewQueue, RuleGenerator},
    storage::{FileLock, LocalStore, SyncStore},
    utils::http,
};

/// edition-sync - race edition crawler and reconciler
#[derive(Parser, Debug)]
#[command(
    name = "edition-sync",
    version,
    about = "Scheduled crawl and field-level merge of race editions"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Storage directory (overrides storage.dir from config)
    #[arg(short, long)]
    storage_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration (and a registry file, if given)
    Validate {
        #[arg(long)]
        registry: Option<PathBuf>,
    },

    /// Import sources, series and links from a registry file
    Import { registry: PathBuf },

    /// Run the scheduler until Ctrl-C
    Serve,

    /// Sync now: one link, or every due link
    Sync {
        #[arg(long)]
        link: Option<u64>,
    },

    /// Inspect and resolve archived snapshots
    #[command(subcommand)]
    Review(ReviewCommand),

    /// Draft, preview and apply selector rules
    #[command(subcommand)]
    Rules(RulesCommand),
}

#[derive(Subcommand, Debug)]
enum ReviewCommand {
    /// List snapshots in a status
    List {
        #[arg(long, default_value = "needs_review")]
        status: SnapshotStatus,
    },

    /// Write corrected values as a manual source
    Correct(CorrectArgs),

    /// Close a snapshot without merging
    Ignore {
        snapshot: u64,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Re-extract a snapshot with the current rules of its source
    Reprocess { snapshot: u64 },
}

#[derive(Args, Debug)]
struct CorrectArgs {
    snapshot: u64,

    /// Edition year; defaults to the year of --race-date
    #[arg(long)]
    year: Option<i32>,

    #[arg(long)]
    race_date: Option<String>,

    #[arg(long)]
    registration_status: Option<String>,

    #[arg(long)]
    registration_url: Option<String>,

    /// Name recorded as the manual source
    #[arg(long, default_value = "operator")]
    operator: String,
}

#[derive(Subcommand, Debug)]
enum RulesCommand {
    /// Ask the AI provider for a draft template for a snapshot
    Generate {
        snapshot: u64,
        /// Write the draft here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Show what a template extracts from a snapshot
    Preview { snapshot: u64, template: PathBuf },

    /// Merge a template into a source's selector rules
    Apply {
        source: String,
        template: PathBuf,
        /// Sync this link right after applying
        #[arg(long)]
        verify_link: Option<u64>,
    },
}

/// Initialize logging based on verbosity flag and configured level.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn build_engine(config: &Config, store: Arc<dyn SyncStore>, storage_dir: &Path) -> Result<SyncEngine> {
    let client = http::create_async_client(&config.sync)?;
    let fetcher = Arc::new(HttpFetcher::new(client, config.sync.max_body_bytes));
    let lock = Arc::new(FileLock::new(storage_dir.join("sync.lock")));
    Ok(SyncEngine::new(LinkSyncer::new(store, fetcher), lock))
}

fn build_generator(config: &Config) -> Result<RuleGenerator> {
    let client = http::create_ai_client(&config.ai)?;
    let provider = Arc::new(OpenAiRuleProvider::new(client, config.ai.clone()));
    Ok(RuleGenerator::new(config.ai.clone(), provider))
}

fn load_template(path: &Path) -> Result<RuleTemplate> {
    let content = std::fs::read_to_string(path)?;
    let template: RuleTemplate = serde_json::from_str(&content)?;
    template.validate()?;
    Ok(template)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_pass(report: &PassReport) {
    match report.skipped {
        Some(reason) => log::warn!("Pass skipped: {:?}", reason),
        None => log::info!(
            "{} run(s): {} succeeded, {} failed",
            report.runs.len(),
            report.succeeded(),
            report.failed()
        ),
    }
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    init_logging(cli.verbose, &config.logging.level);
    if !cli.config.exists() {
        log::warn!("{} not found, using defaults", cli.config.display());
    }
    config.validate()?;

    let storage_dir = cli.storage_dir.clone().unwrap_or_else(|| config.storage.dir.clone());
    log::debug!("Storage directory: {}", storage_dir.display());
    let store: Arc<dyn SyncStore> = Arc::new(
        LocalStore::new(&storage_dir).with_run_retention(config.storage.runs_per_link),
    );

    match cli.command {
        Command::Validate { registry } => {
            log::info!("✓ Config OK");
            if let Some(path) = registry {
                let registry = Registry::load(&path)?;
                registry.validate()?;
                log::info!(
                    "✓ Registry OK: {} source(s), {} series, {} link(s)",
                    registry.sources.len(),
                    registry.series.len(),
                    registry.links.len()
                );
            }
        }

        Command::Import { registry } => {
            let registry = Registry::load(&registry)?;
            registry.import(store.as_ref()).await?;
        }

        Command::Serve => {
            let engine = Arc::new(build_engine(&config, store, &storage_dir)?);
            let mut scheduler = Scheduler::new(engine, config.sync.interval());
            scheduler.start()?;

            tokio::signal::ctrl_c().await?;
            log::info!("Shutdown requested, waiting for the current pass");
            scheduler.stop().await;
        }

        Command::Sync { link } => {
            let engine = build_engine(&config, store, &storage_dir)?;
            match link {
                Some(link_id) => {
                    let run = engine.trigger_link(link_id).await?;
                    log::info!("Run {} for link {}: {}", run.id, link_id, run.status);
                    print_json(&run)?;
                }
                None => report_pass(&engine.trigger_all().await?),
            }
        }

        Command::Review(review) => {
            let queue = ReviewQueue::new(Arc::clone(&store));
            match review {
                ReviewCommand::List { status } => {
                    let snapshots = queue.list(status).await?;
                    log::info!("{} snapshot(s) {}", snapshots.len(), status);
                    print_json(&snapshots)?;
                }
                ReviewCommand::Correct(args) => {
                    let correction = Correction {
                        year: args.year,
                        fields: EditionFields {
                            race_date: args.race_date,
                            registration_status: args.registration_status,
                            registration_url: args.registration_url,
                        },
                        operator: args.operator,
                    };
                    let result = queue.correct(args.snapshot, correction).await?;
                    if let Some(edition) = &result.edition {
                        print_json(edition)?;
                    }
                }
                ReviewCommand::Ignore { snapshot, reason } => {
                    queue.ignore(snapshot, reason).await?;
                }
                ReviewCommand::Reprocess { snapshot } => {
                    let engine = build_engine(&config, store, &storage_dir)?;
                    let outcome = engine.syncer().reprocess_snapshot(snapshot).await?;
                    log::info!("Snapshot {}: {:?}", snapshot, outcome);
                }
            }
        }

        Command::Rules(rules) => match rules {
            RulesCommand::Generate { snapshot, out } => {
                let snapshot = store
                    .get_snapshot(snapshot)
                    .await?
                    .ok_or_else(|| AppError::not_found("snapshot", snapshot))?;
                let draft = build_generator(&config)?.generate(&snapshot).await?;
                let json = serde_json::to_string_pretty(&draft)?;
                match out {
                    Some(path) => {
                        std::fs::write(&path, json)?;
                        log::info!("Draft written to {}", path.display());
                    }
                    None => println!("{json}"),
                }
            }
            RulesCommand::Preview { snapshot, template } => {
                let snapshot = store
                    .get_snapshot(snapshot)
                    .await?
                    .ok_or_else(|| AppError::not_found("snapshot", snapshot))?;
                let template = load_template(&template)?;
                let fields = build_generator(&config)?.preview(&template, &snapshot)?;
                print_json(&fields)?;
            }
            RulesCommand::Apply {
                source,
                template,
                verify_link,
            } => {
                let template = load_template(&template)?;
                let generator = build_generator(&config)?;
                generator.apply(store.as_ref(), &source, &template).await?;

                if let Some(link_id) = verify_link {
                    let engine = build_engine(&config, store, &storage_dir)?;
                    let run = engine.trigger_link(link_id).await?;
                    log::info!("Verification run {}: {}", run.id, run.status);
                    print_json(&run)?;
                }
            }
        },
    }

    Ok(())
}
