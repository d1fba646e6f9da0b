use clap::Parser;
use mnemo_core::models::DistillationSettings;
use mnemo_core::{EmbeddingBackend, MnemoConfig, PgGraphConnector, PgGraphStore, PgVectorStore};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use mnemo_server::router::AppState;
use mnemo_server::server;
use mnemo_server::subsystems::pipeline::{DistillationJob, MemoryPipeline};
use mnemo_server::subsystems::pool::WorkerPool;
use mnemo_server::subsystems::queue::JobQueue;
use mnemo_server::subsystems::worker::DistillationWorker;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "mnemo.toml")]
    config: String,

    /// Check PostgreSQL and pgvector, then exit
    #[arg(long)]
    health: bool,

    /// Create tables and indexes, then exit
    #[arg(long)]
    init_schema: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match MnemoConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    if args.health {
        let pool = match mnemo_core::db::create_pool(&config.database).await {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Failed to connect to database: {}", e);
                std::process::exit(1);
            }
        };

        match mnemo_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match mnemo_core::db::check_pgvector(&pool).await {
            Ok(v) => println!("✅ pgvector version: {}", v),
            Err(e) => {
                println!("❌ pgvector check failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("✅ Mnemo DB health check passed");
        return Ok(());
    }

    let dimensions = config.embedding.dimensions as usize;

    let pool = match mnemo_core::db::bootstrap(&config).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to prepare database: {}", e);
            std::process::exit(1);
        }
    };

    if args.init_schema {
        println!("✅ Mnemo schema ready ({} dimensions)", dimensions);
        return Ok(());
    }

    let embedder: Arc<dyn EmbeddingBackend> =
        Arc::from(mnemo_core::create_embedder(&config.embedding, &config.llm.api_key)?);

    match &config.graph_database {
        None => {
            tracing::warn!("No [graph_database] configured, distillation will not write the knowledge graph");
        }
        Some(graph_db) if !PgGraphConnector::new(graph_db.clone()).same_database(&config.database.url) => {
            tracing::warn!(
                graph_host = %graph_db.host,
                graph_database = %graph_db.database,
                "[graph_database] differs from database.url, traverse will not see ingested nodes"
            );
        }
        Some(_) => {}
    }

    let workers = Arc::new(WorkerPool::new(
        &config.pool,
        Arc::new(DistillationWorker::default()),
    ));

    let pipeline = Arc::new(MemoryPipeline::new(
        workers.clone(),
        embedder,
        Arc::new(PgVectorStore::new(pool.clone(), dimensions)),
        Arc::new(PgGraphStore::new(pool.clone())),
        DistillationSettings {
            llm: config.llm.clone(),
            graph_database: config.graph_database.clone(),
        },
        config.recall.clone(),
    ));

    let queue = Arc::new(JobQueue::<DistillationJob>::new("distillation"));
    let handler_pipeline = pipeline.clone();
    queue.process(move |job: DistillationJob| {
        let pipeline = handler_pipeline.clone();
        async move { pipeline.handle(job).await }
    })?;

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let state = Arc::new(AppState {
        pipeline,
        queue: queue.clone(),
        db: Some(pool),
    });

    let socket_path = shellexpand::tilde(&config.service.socket_path).into_owned();
    server::run_unix_server(&socket_path, state, tx.subscribe()).await?;

    let backlog = queue.shutdown();
    if backlog.pending > 0 {
        tracing::warn!(pending = backlog.pending, "Dropping queued distillation jobs");
    }
    workers.shutdown();

    Ok(())
}
