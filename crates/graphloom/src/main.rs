//! Graphloom unified launcher.
//!
//! One binary, one role per invocation: workers, the delayed-queue
//! scheduler, the orphan reaper, and the operator commands (submit,
//! cancel, delete, requeue-kg, doctor). The service container is
//! built exactly once from the environment and injected everywhere.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use graphloom_conductor::{
    requeue_failed_kg_jobs, run_checks, DelayedScheduler, DeletionCoordinator, OrphanReaper,
    PipelineCoordinator, SubmitRequest,
};
use graphloom_db::PipelineStore;
use graphloom_extract::{DeepgramClient, ExtractionService};
use graphloom_graph::{GraphClient, GraphIngestor, HttpGraphClient};
use graphloom_kv::{Clock, Kv, MemoryKv, QueueBroker, RateGovernor, RedisKv, SystemClock};
use graphloom_logging::LogConfig;
use graphloom_protocol::defaults::{PROVIDER_ANTHROPIC, PROVIDER_OPENAI};
use graphloom_protocol::{AppConfig, QueueName};
use graphloom_storage::StorageGateway;
use graphloom_worker::{ClaudeProvider, ContextualChunker, GoogleDriveOrigin, Services, Worker};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "graphloom", about = "Multi-tenant document ingestion pipeline")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Use an in-process KV store instead of Redis. Single-process
    /// development mode: queues and rate windows are not shared with
    /// other processes
    #[arg(long, global = true)]
    memory_kv: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull and process queue items
    Worker {
        /// Queues to serve (default: all)
        #[arg(long, value_delimiter = ',')]
        queue: Vec<String>,
    },
    /// Promote delayed queue items on a 5-second cadence
    Scheduler,
    /// Sweep orphaned phases every 5 minutes
    Reaper,
    /// Submit a document for ingestion
    Submit {
        #[arg(long)]
        document_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        source_name: String,
        #[arg(long, default_value = "manual_upload")]
        source_platform: String,
        #[arg(long)]
        file_type: String,
        /// Object-store path for local uploads
        #[arg(long)]
        raw_location: Option<String>,
        /// Origin URI (gdrive://<id>) for external sources
        #[arg(long)]
        source_location: Option<String>,
        /// Preserve the raw origin file in the object store
        #[arg(long)]
        store_raw: bool,
        /// User for origin OAuth lookup (external sources)
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Cancel in-flight pipeline jobs for a document
    Cancel {
        #[arg(long)]
        document_id: String,
        #[arg(long)]
        tenant: String,
    },
    /// Delete documents, their chunks, and their graph entities
    Delete {
        #[arg(long, required = true)]
        document_id: Vec<String>,
        #[arg(long)]
        tenant: String,
    },
    /// Re-enqueue jobs that failed during graph ingest
    RequeueKg,
    /// Check connectivity to the backing services
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let app_name = match &cli.command {
        Commands::Worker { .. } => "worker",
        Commands::Scheduler => "scheduler",
        Commands::Reaper => "reaper",
        _ => "graphloom",
    };
    graphloom_logging::init_logging(LogConfig {
        app_name,
        verbose: cli.verbose,
    })?;

    let config = AppConfig::from_env().context("invalid configuration")?;
    let runtime = Runtime::build(&config, cli.memory_kv).await?;

    match cli.command {
        Commands::Worker { queue } => {
            let queues = parse_queues(&queue)?;
            let services = runtime.services()?;
            let worker = Worker::new(services.clone(), queues);
            tokio::select! {
                _ = worker.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
            }
            drop(worker);
            if let Ok(services) = Arc::try_unwrap(services) {
                services.shutdown().await;
            }
        }
        Commands::Scheduler => {
            let scheduler = DelayedScheduler::new(runtime.broker.clone());
            tokio::select! {
                _ = scheduler.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
            }
        }
        Commands::Reaper => {
            let reaper = OrphanReaper::new(runtime.store.clone());
            tokio::select! {
                _ = reaper.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
            }
        }
        Commands::Submit {
            document_id,
            tenant,
            source_name,
            source_platform,
            file_type,
            raw_location,
            source_location,
            store_raw,
            user_id,
        } => {
            let coordinator =
                PipelineCoordinator::new(runtime.store.clone(), runtime.broker.clone());
            let receipt = coordinator
                .submit(SubmitRequest {
                    document_id,
                    tenant_id: tenant,
                    source_name,
                    source_platform,
                    file_type,
                    raw_location,
                    source_location,
                    store_raw,
                    user_id,
                })
                .await?;
            println!(
                "{}",
                serde_json::json!({
                    "pipeline_job_id": receipt.pipeline_job_id,
                    "queue_job_id": receipt.queue_job_id,
                })
            );
        }
        Commands::Cancel {
            document_id,
            tenant,
        } => {
            let coordinator =
                PipelineCoordinator::new(runtime.store.clone(), runtime.broker.clone());
            let cancelled = coordinator.cancel_for_document(&document_id, &tenant).await?;
            println!("cancelled {cancelled} job(s)");
        }
        Commands::Delete {
            document_id,
            tenant,
        } => {
            let deleter =
                DeletionCoordinator::new(runtime.store.clone(), runtime.graph.clone());
            if document_id.len() == 1 {
                deleter.delete(&document_id[0], &tenant).await?;
                println!("deleted {}", document_id[0]);
            } else {
                let (deleted, errors) = deleter.delete_batch(&document_id, &tenant).await?;
                println!("deleted {deleted} document(s), {} error(s)", errors.len());
            }
        }
        Commands::RequeueKg => {
            let requeued = requeue_failed_kg_jobs(&runtime.store, &runtime.broker).await?;
            println!("requeued {requeued} job(s)");
        }
        Commands::Doctor => {
            let report = run_checks(&runtime.store, &runtime.broker, &runtime.graph).await;
            println!(
                "database: {}\nkv store: {}\ngraph engine: {}",
                status(report.database_ok),
                status(report.kv_ok),
                status(report.graph_ok)
            );
            if !report.healthy() {
                bail!("one or more services are unreachable");
            }
        }
    }

    Ok(())
}

/// Shared clients plus everything needed to assemble the worker
/// service container.
struct Runtime {
    config: AppConfig,
    store: PipelineStore,
    broker: QueueBroker,
    kv: Arc<dyn Kv>,
    clock: Arc<dyn Clock>,
    graph: Arc<dyn GraphClient>,
}

impl Runtime {
    async fn build(config: &AppConfig, memory_kv: bool) -> Result<Self> {
        let store = PipelineStore::connect(&config.database_url)
            .await
            .context("failed to open pipeline store")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let kv: Arc<dyn Kv> = if memory_kv {
            info!("using in-process coordination store");
            Arc::new(MemoryKv::new(clock.clone()))
        } else {
            let redis_url = config.require_redis_url()?;
            Arc::new(
                RedisKv::connect(redis_url)
                    .await
                    .context("failed to connect to coordination store")?,
            )
        };
        let broker = QueueBroker::new(kv.clone(), clock.clone());
        let graph: Arc<dyn GraphClient> = Arc::new(
            HttpGraphClient::new(&config.graph_engine_url)
                .context("failed to build graph engine client")?,
        );

        Ok(Self {
            config: config.clone(),
            store,
            broker,
            kv,
            clock,
            graph,
        })
    }

    /// Full worker service container. Only workers need the LLM,
    /// transcription, and origin clients.
    fn services(&self) -> Result<Arc<Services>> {
        let storage = StorageGateway::local(Path::new(&self.config.storage_root))
            .context("failed to open storage root")?;

        let transcriber = DeepgramClient::new(&self.config.deepgram_api_key)
            .map_err(|e| anyhow::anyhow!("transcription client: {e}"))?;
        let extractor = ExtractionService::new(Arc::new(transcriber));

        let anthropic_governor = Arc::new(RateGovernor::new(
            self.kv.clone(),
            self.clock.clone(),
            PROVIDER_ANTHROPIC,
            None,
            Some(self.config.anthropic_tpm_limit),
        ));
        let model = ClaudeProvider::new(&self.config.anthropic_api_key)
            .map_err(|e| anyhow::anyhow!("llm client: {e}"))?;
        let chunker = ContextualChunker::new(
            Arc::new(model),
            anthropic_governor,
            self.config.chunking_max_concurrent,
        );

        let openai_governor = Arc::new(RateGovernor::new(
            self.kv.clone(),
            self.clock.clone(),
            PROVIDER_OPENAI,
            Some(self.config.openai_rpm_limit),
            Some(self.config.openai_tpm_limit),
        ));
        let ingestor = GraphIngestor::new(
            self.graph.clone(),
            self.store.clone(),
            openai_governor,
            self.config.kg_max_concurrent,
        );

        let origin = Arc::new(
            GoogleDriveOrigin::new(self.store.clone())
                .map_err(|e| anyhow::anyhow!("origin adapter: {e}"))?,
        );

        Ok(Arc::new(Services::new(
            self.store.clone(),
            self.broker.clone(),
            storage,
            extractor,
            chunker,
            ingestor,
            origin,
        )))
    }
}

fn parse_queues(names: &[String]) -> Result<Vec<QueueName>> {
    names
        .iter()
        .map(|name| {
            name.parse::<QueueName>()
                .map_err(|err| anyhow::anyhow!(err))
        })
        .collect()
}

fn status(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "UNREACHABLE"
    }
}
