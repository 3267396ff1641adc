use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;
use vulscan_orchestration::{
    HttpStageClient, InMemoryJobQueue, JobDispatcher, JobQueue, PipelineWorker, RetryingStageClient,
    StageClient, StageId, WorkerConfig, WorkerPool,
};
use vulscan_storage::{ScanOptions, ScanStore, SqliteScanStore, Upload};

#[derive(Parser, Debug)]
#[command(name = "vulscan", version, about = "Run vulnerability scans over C/C++ sources")]
struct Cli {
    /// YAML worker configuration (schema version 1)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config and VULSCAN_DATABASE)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit files and run the scan to a terminal status
    Scan(ScanArgs),
    /// Print a scan and its findings grouped by file
    Results { scan_id: Uuid },
    /// Cancel a pending or processing scan
    Cancel { scan_id: Uuid },
    /// List an owner's scans, newest first
    List {
        #[arg(long)]
        owner: String,
    },
    /// Check the four stage services
    Health,
}

#[derive(Args, Debug)]
struct ScanArgs {
    #[arg(long)]
    project: String,

    #[arg(long, default_value = "local")]
    owner: String,

    /// Scan option as key=value (value parsed as JSON when possible)
    #[arg(long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.json, cli.verbose);
    debug!("Arguments: {:?}", cli);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let level = if verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "vulscan={level},vulscan_orchestration={level},vulscan_storage={level},h2=warn,hyper=warn,reqwest=warn"
            ))
        });

        let registry = tracing_subscriber::registry().with(filter);
        if json {
            registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        } else {
            registry
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .init();
        }
    });
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = WorkerConfig::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    match cli.command {
        Command::Scan(args) => scan(&config, args).await,
        Command::Results { scan_id } => {
            let store = open_store(&config)?;
            let results = store.get_results(scan_id).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Cancel { scan_id } => {
            let store = open_store(&config)?;
            let dispatcher = JobDispatcher::new(store, Arc::new(InMemoryJobQueue::new()));
            let scan = dispatcher.cancel(scan_id).await?;
            println!("{}", serde_json::to_string_pretty(&scan)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::List { owner } => {
            let store = open_store(&config)?;
            let scans = store.list_scans(&owner).await?;
            println!("{}", serde_json::to_string_pretty(&scans)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Health => health(&config).await,
    }
}

fn open_store(config: &WorkerConfig) -> anyhow::Result<Arc<SqliteScanStore>> {
    let store = SqliteScanStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(Arc::new(store))
}

/// The worker applies retries and per-attempt timeouts itself
fn stage_client(config: &WorkerConfig) -> anyhow::Result<HttpStageClient> {
    Ok(HttpStageClient::new(
        config.stages.clone(),
        config.stage_timeout(),
    )?)
}

async fn scan(config: &WorkerConfig, args: ScanArgs) -> anyhow::Result<ExitCode> {
    let store = open_store(config)?;
    let queue = Arc::new(InMemoryJobQueue::new());
    let dispatcher = JobDispatcher::new(store.clone(), queue.clone());

    let uploads = args
        .files
        .iter()
        .map(|path| upload_for(path))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let options = parse_options(&args.options)?;

    let submission = dispatcher
        .submit(&args.project, &args.owner, uploads, options)
        .await?;
    let scan_id = submission.scan.id;
    info!(scan_id = %scan_id, "Submitted {} file(s)", submission.files.len());

    // Single job: the pool drains it and stops
    queue.close();

    let worker = Arc::new(PipelineWorker::new(
        store.clone(),
        store.clone(),
        Arc::new(stage_client(config)?),
        config.worker_settings(),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = WorkerPool::new(worker, queue, config.max_concurrent_scans).with_outcomes(tx);

    let run = pool.run();
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => {}
        _ = tokio::signal::ctrl_c() => {
            warn!(scan_id = %scan_id, "Interrupted, cancelling scan");
            if let Err(e) = dispatcher.cancel(scan_id).await {
                warn!(scan_id = %scan_id, "Cancel not applied: {}", e);
            }
            run.await;
        }
    }

    let outcome = rx.try_recv().ok();
    let succeeded = matches!(&outcome, Some(o) if o.error.is_none());
    let results = store.get_results(scan_id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "outcome": outcome, "results": results }))?
    );

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn health(config: &WorkerConfig) -> anyhow::Result<ExitCode> {
    let client = RetryingStageClient::new(stage_client(config)?, config.retry_policy())
        .with_attempt_timeout(config.stage_timeout());
    let mut healthy = true;

    for stage in StageId::CHAIN {
        let url = config.stages.base_url(stage);
        match client.health(stage).await {
            Ok(()) => println!("{:<14} ok    {}", stage.as_str(), url),
            Err(failure) => {
                healthy = false;
                println!(
                    "{:<14} {:<5} {} ({})",
                    stage.as_str(),
                    "down",
                    url,
                    failure.message
                );
            }
        }
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn upload_for(path: &Path) -> anyhow::Result<Upload> {
    let metadata =
        std::fs::metadata(path).with_context(|| format!("reading {}", path.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a file", path.display());
    }

    let storage_path = std::fs::canonicalize(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Upload::new(
        filename,
        storage_path,
        metadata.len(),
        content_type(path),
    ))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("c") | Some("h") => "text/x-c",
        Some("cpp") | Some("cc") | Some("cxx") | Some("hpp") => "text/x-c++",
        _ => "application/octet-stream",
    }
}

fn parse_options(raw: &[String]) -> anyhow::Result<ScanOptions> {
    let mut options = ScanOptions::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("Invalid option '{}', expected KEY=VALUE", entry);
        };
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        options.insert(key.trim().to_string(), value);
    }
    Ok(options)
}
