//! mcphub CLI
//!
//! Entry point for the aggregation server. Modes:
//! - serve: run the HTTP server (MCP endpoint + REST surfaces)
//! - validate: check configuration and print the effective tunables
//!
//! Exit codes: 0 on normal shutdown, 1 on unrecoverable store failure at
//! startup, 2 on fatal configuration errors.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mcphub::aggregator::{HealthMonitor, RequestRouter, ServerRegistry, SessionManager};
use mcphub::auth::Authenticator;
use mcphub::config::AppConfig;
use mcphub::core::AssignmentSource;
use mcphub::embed::{
    ClassifierClient, Embedder, HashEmbedder, HttpClassifier, HttpEmbedder, KeywordClassifier,
};
use mcphub::hil::HilService;
use mcphub::http::{build_router, AppState};
use mcphub::internal::{register_builtin_modules, LocalRegistry};
use mcphub::progress::ProgressService;
use mcphub::search::SearchService;
use mcphub::skills::{ClassificationService, SkillCatalog};
use mcphub::store::{
    FsObjectStore, LayerCache, MemoryVectorStore, ObjectStore, RegistryStore, VectorIndex,
};
use mcphub::sync::SyncPipeline;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mcphub")]
#[command(about = "Unified MCP aggregation and discovery server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "mcphub.yaml")]
    config: String,

    /// Bind address (overrides config)
    #[arg(long, env = "MCPHUB_BIND")]
    bind: Option<String>,

    /// Database path (overrides config)
    #[arg(long, env = "MCPHUB_DATABASE_PATH")]
    database: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve,

    /// Validate configuration and print effective settings
    Validate,
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}={}", env!("CARGO_CRATE_NAME"), level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = match AppConfig::load(&PathBuf::from(&cli.config)) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    config.apply_env();
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(database) = cli.database {
        config.database.path = database;
    }

    if let Err(e) = config.validate() {
        error!("configuration error: {e}");
        std::process::exit(2);
    }

    match cli.command {
        Commands::Validate => {
            eprintln!("Configuration is valid.\n");
            eprintln!("  bind:                {}", config.server.bind);
            eprintln!("  database:            {}", config.database.path);
            eprintln!("  objects:             {}", config.objects.path);
            eprintln!(
                "  embedding:           {} ({} dims)",
                config
                    .embedding
                    .endpoint
                    .as_deref()
                    .unwrap_or("local deterministic"),
                config.embedding.dim
            );
            eprintln!(
                "  classifier:          {}",
                config
                    .classifier
                    .endpoint
                    .as_deref()
                    .unwrap_or("keyword heuristic")
            );
            eprintln!("  skill threshold:     {}", config.search.skill_threshold);
            eprintln!(
                "  score threshold:     {}",
                config.search.tool_score_threshold
            );
            eprintln!(
                "  connection timeout:  {}s",
                config.aggregator.connection_timeout_s
            );
            eprintln!(
                "  request timeout:     {}s",
                config.aggregator.request_timeout_s
            );
            eprintln!(
                "  health interval:     {}s",
                config.aggregator.health_interval_s
            );
            eprintln!("  drain timeout:       {}s", config.aggregator.drain_timeout_s);
            eprintln!("  cache version:       {}", config.cache.version);
            eprintln!("  configured servers:  {}", config.servers.len());
            eprintln!("  internal modules:    {}", config.internal_modules.join(", "));
            Ok(())
        }
        Commands::Serve => serve(config).await,
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    let state = match bootstrap(&config, &shutdown).await {
        Ok(state) => state,
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!("listening on http://{}", config.server.bind);
    info!("MCP endpoint at http://{}/mcp", config.server.bind);

    let app = build_router(state.app.clone());
    let shutdown_signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            shutdown_signal.cancel();
        })
        .await?;

    // Drain sessions before exiting so in-flight requests finish cleanly.
    state.servers_shutdown().await;
    info!("shutdown complete");
    Ok(())
}

struct ServeState {
    app: AppState,
    sessions: Arc<SessionManager>,
}

impl ServeState {
    async fn servers_shutdown(&self) {
        self.sessions.disconnect_all().await;
    }
}

async fn bootstrap(config: &AppConfig, shutdown: &CancellationToken) -> Result<ServeState> {
    // System of record first; nothing else matters if it is unavailable.
    let db = Arc::new(RegistryStore::open(&config.database.path).await?);

    let cache = Arc::new(LayerCache::new(
        config.cache.version,
        Duration::from_secs(config.cache.ttl_s),
    ));

    let vector_store = Arc::new(MemoryVectorStore::new());
    let vectors = VectorIndex::new(vector_store, &config.vector);
    vectors.ensure_collections(config.embedding.dim).await?;

    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.objects.path.clone())?);

    let embedder: Arc<dyn Embedder> = match &config.embedding.endpoint {
        Some(endpoint) => Arc::new(HttpEmbedder::new(
            endpoint.clone(),
            config.embedding.model.clone(),
            config.embedding.dim,
        )),
        None => {
            info!("no embedding endpoint configured; using deterministic local embedder");
            Arc::new(HashEmbedder::new(config.embedding.dim))
        }
    };

    let (classifier_client, classifier_source): (Arc<dyn ClassifierClient>, AssignmentSource) =
        match &config.classifier.endpoint {
            Some(endpoint) => (
                Arc::new(HttpClassifier::new(
                    endpoint.clone(),
                    config.classifier.model.clone(),
                )),
                AssignmentSource::Llm,
            ),
            None => {
                info!("no classifier endpoint configured; using keyword heuristic");
                (Arc::new(KeywordClassifier), AssignmentSource::Heuristic)
            }
        };

    let classifier = Arc::new(ClassificationService::new(
        Arc::clone(&db),
        vectors.clone(),
        classifier_client,
        classifier_source,
        config.classifier.clone(),
    ));

    let (sync, jobs_rx) = SyncPipeline::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::clone(&cache),
        Arc::clone(&embedder),
        Arc::clone(&classifier),
        Arc::clone(&objects),
    );
    tokio::spawn(Arc::clone(&sync).run_worker(jobs_rx, shutdown.clone()));

    let hil = Arc::new(HilService::new(Duration::from_secs(config.hil.expiry_s)));
    tokio::spawn(Arc::clone(&hil).run_sweeper(shutdown.clone()));

    let sessions = Arc::new(SessionManager::new(config.aggregator.clone()));
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&db),
        Arc::clone(&sessions),
        config.aggregator.clone(),
    ));

    let progress = Arc::new(ProgressService::new());
    let servers = Arc::new(ServerRegistry::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::clone(&cache),
        Arc::clone(&sessions),
        Arc::clone(&sync),
        Arc::clone(&health),
        Arc::clone(&progress),
        shutdown.clone(),
    ));

    // In-process capability modules, then the reconciling scan.
    let local = Arc::new(LocalRegistry::new());
    register_builtin_modules(&local, &config.internal_modules);
    let report = sync.sync_internal(&local).await?;
    info!(
        tools = report.tools_upserted,
        prompts = report.prompts_upserted,
        resources = report.resources_upserted,
        "internal capabilities registered"
    );

    let catalog = Arc::new(SkillCatalog::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::clone(&embedder),
        Arc::clone(&cache),
    ));

    let search = Arc::new(SearchService::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::clone(&embedder),
        Arc::clone(&cache),
        config.search.clone(),
    ));

    let router = Arc::new(RequestRouter::new(
        Arc::clone(&db),
        Arc::clone(&local),
        Arc::clone(&sessions),
        Arc::clone(&hil),
        Arc::clone(&objects),
        config.aggregator.clone(),
    ));

    let auth = Arc::new(Authenticator::from_config(&config.auth));

    // Servers declared in config: register and connect, tolerating failures.
    for spec in &config.servers {
        let server = match db.get_server_by_name(&spec.name).await? {
            Some(existing) => existing,
            None => servers.register(spec.clone()).await?,
        };
        if let Err(e) = servers.connect(server.id).await {
            warn!(server = %server.name, error = %e, "initial connection failed");
        }
    }

    let app = AppState {
        config: Arc::new(config.clone()),
        db,
        cache,
        search,
        catalog,
        servers,
        router,
        hil,
        progress,
        auth,
    };

    Ok(ServeState {
        app,
        sessions,
    })
}
