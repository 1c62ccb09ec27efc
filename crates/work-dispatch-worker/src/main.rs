use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use work_dispatch_coord::{DistributedLockService, InMemoryCoordinator};
use work_dispatch_core::{Priority, WorkItem};
use work_dispatch_worker::units::{build_registry, StagingSweeper};
use work_dispatch_worker::{
    DispatchError, DispatchLoop, HttpStatusReporter, MemoryElementStore, MemoryWorkSource,
    ResourceStager, WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "wd-worker")]
#[command(about = "Work dispatch worker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long, global = true)]
    worker_id: Option<String>,

    /// Directory for staged content
    #[arg(long, global = true)]
    staging_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dispatch items from a JSON-lines seed file until stopped
    Run {
        /// One work item per line
        #[arg(long)]
        seed: Option<PathBuf>,

        /// File whose content is attached to every item's property
        #[arg(long)]
        attach: Option<PathBuf>,

        /// Exit once every seeded item has been settled
        #[arg(long)]
        exit_when_drained: bool,

        /// Serve /status and /metrics regardless of the config file
        #[arg(long)]
        status: bool,
    },

    /// Dispatch a single item and print what ran
    RunOne {
        /// Item JSON file, or "-" for stdin
        item: String,

        #[arg(long)]
        attach: Option<PathBuf>,
    },

    /// Run every configured unit's self-check
    Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }
    if let Some(staging_dir) = args.staging_dir {
        config.staging_dir = Some(staging_dir);
    }

    match args.command {
        Commands::Run {
            seed,
            attach,
            exit_when_drained,
            status,
        } => run(config, seed, attach, exit_when_drained, status).await,
        Commands::RunOne { item, attach } => run_one(config, &item, attach).await,
        Commands::Verify => verify(&config).await,
    }
}

/// Content attached to seeded properties, with its file name
struct Attachment {
    bytes: Bytes,
    file_name: Option<String>,
}

fn load_attachment(path: Option<&Path>) -> anyhow::Result<Option<Attachment>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Some(Attachment {
        bytes: Bytes::from(bytes),
        file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
    }))
}

/// Make every element and property `item` refers to exist in `store`
fn seed_store(store: &MemoryElementStore, item: &WorkItem, attachment: Option<&Attachment>) {
    // A key without a name matches no property, so none is created for it
    let property = item.property_ref().filter(|p| !p.name.is_empty());
    for element in item.element_refs.iter() {
        store.add_element(element.clone());
        if let Some(property) = property.clone() {
            match attachment {
                Some(a) => store.add_content(
                    element,
                    property,
                    a.bytes.clone(),
                    a.file_name.as_deref(),
                ),
                None => store.add_property(element, property),
            }
        }
    }
}

fn load_seed(
    source: &MemoryWorkSource,
    store: &MemoryElementStore,
    path: &Path,
    attachment: Option<&Attachment>,
) -> anyhow::Result<usize> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut count = 0;

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match WorkItem::from_json(line.as_bytes()) {
            Ok(item) => {
                seed_store(store, &item, attachment);
                source.push(&item)?;
            }
            Err(e) => {
                // Queued anyway so the loop fails it like any bad delivery
                warn!("Seed line {} is not a valid item: {}", index + 1, e);
                source.push_raw(
                    Priority::Normal,
                    format!("seed-line-{}", index + 1),
                    Bytes::from(line.to_string()),
                );
            }
        }
        count += 1;
    }
    Ok(count)
}

fn lock_service(config: &WorkerConfig) -> DistributedLockService {
    DistributedLockService::new(Arc::new(InMemoryCoordinator::new()), config.locks.clone())
}

async fn run(
    config: WorkerConfig,
    seed: Option<PathBuf>,
    attach: Option<PathBuf>,
    exit_when_drained: bool,
    status: bool,
) -> anyhow::Result<()> {
    let source = Arc::new(MemoryWorkSource::new(config.queue_name.clone()));
    let store = Arc::new(MemoryElementStore::new());
    let attachment = load_attachment(attach.as_deref())?;

    if let Some(seed) = &seed {
        let count = load_seed(&source, &store, seed, attachment.as_ref())?;
        let (high, normal, low) = source.count_by_priority();
        info!(
            "Seeded {} item(s) from {} ({} high, {} normal, {} low)",
            count,
            seed.display(),
            high,
            normal,
            low
        );
    }
    if exit_when_drained {
        source.close();
    }

    let locks = lock_service(&config);
    let stager = ResourceStager::new(
        config
            .staging_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir),
    );
    let mut builder = DispatchLoop::builder(source.clone(), store)
        .config(&config)
        .registry(build_registry(&config.units))
        .stager(stager.clone())
        .lock_service(locks.clone());
    if status || config.status.enabled {
        builder = builder.status_reporter(Arc::new(HttpStatusReporter::new(&config.status)?));
    }
    let mut dispatch = builder.build()?;

    let election = match &config.sweeper {
        Some(sweeper) => {
            let duty = StagingSweeper::new(stager, sweeper.interval(), sweeper.max_age());
            Some(locks.elect("staging-sweeper", Arc::new(duty))?)
        }
        None => None,
    };

    // Handle shutdown signals
    let handle = dispatch.handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        handle.stop();
    });

    let result = dispatch.run().await;

    if let Some(election) = election {
        election.leave().await;
    }
    info!(
        "Settled {} acked, {} failed",
        source.acked().len(),
        source.failed().len()
    );

    match result {
        Ok(()) => Ok(()),
        Err(DispatchError::Interrupted) if exit_when_drained => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn run_one(config: WorkerConfig, path: &str, attach: Option<PathBuf>) -> anyhow::Result<()> {
    let body = if path == "-" {
        let mut buffer = Vec::new();
        std::io::stdin().read_to_end(&mut buffer)?;
        buffer
    } else {
        std::fs::read(path).with_context(|| format!("reading {}", path))?
    };
    let item = WorkItem::from_json(&body)?;

    let store = Arc::new(MemoryElementStore::new());
    let attachment = load_attachment(attach.as_deref())?;
    seed_store(&store, &item, attachment.as_ref());

    let locks = lock_service(&config);
    let source = Arc::new(MemoryWorkSource::new(config.queue_name.clone()));
    let mut dispatch = DispatchLoop::builder(source, store)
        .config(&config)
        .registry(build_registry(&config.units))
        .lock_service(locks.clone())
        .build()?;

    let prepared = dispatch.prepare().await;
    let result = match prepared {
        Ok(()) => dispatch.dispatch_one(&item).await,
        Err(e) => Err(e),
    };
    locks.close().await;

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => bail!("item {} failed: {}", item.message_id, e),
    }
}

async fn verify(config: &WorkerConfig) -> anyhow::Result<()> {
    let registry = build_registry(&config.units);
    let mut failed = 0;

    for (name, results) in registry.verify_all().await {
        if results.is_ok() {
            println!("{}: ok", name);
        } else {
            failed += 1;
            for failure in results.failures() {
                println!("{}: {}", name, failure);
            }
        }
    }

    if failed > 0 {
        bail!("{} unit(s) failed verification", failed);
    }
    Ok(())
}
