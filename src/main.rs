use clap::Parser;
use ottoflow::adapters::AdapterRegistry;
use ottoflow::config::{self, DEFAULT_CONFIG_PATH};
use ottoflow::connection::ConnectionManager;
use ottoflow::orchestrator::{Orchestrator, OrchestratorParts};
use ottoflow::ottoeject::MoonrakerOttoeject;
use ottoflow::rack_cache::RackCache;
use ottoflow::repository::InMemoryStore;
use ottoflow::shared::ottoeject::OttoejectClient;
use ottoflow::web::api::create_router;
use ottoflow_simulator::SimulatedOttoeject;
use std::path::PathBuf;
use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Print-farm orchestrator
#[derive(Parser, Debug)]
#[command(name = "ottoflow", about = "Dispatches print jobs and clears finished parts onto rack shelves.")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Address for the HTTP API (overrides [server].bind)
    #[arg(long)]
    bind: Option<String>,

    /// Maximum log level
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Drive simulated printers and a simulated ottoeject instead of real devices
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    tracing::info!("Starting ottoflow {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loading configuration from: {}", args.config.display());

    let config = config::load_config(&args.config).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", args.config.display(), e);
        Box::new(e) as BoxError
    })?;

    let store = Arc::new(InMemoryStore::from_config(&config));
    let (registry, ottoeject): (AdapterRegistry, Arc<dyn OttoejectClient>) = if args.simulate {
        tracing::info!("Simulation mode: no real devices will be contacted");
        (AdapterRegistry::simulated(), Arc::new(SimulatedOttoeject::new()))
    } else {
        let client = MoonrakerOttoeject::new(&config.ottoejects, &config.moonraker).map_err(|e| {
            tracing::error!("Failed to set up ottoeject clients: {}", e);
            Box::new(e) as BoxError
        })?;
        (AdapterRegistry::with_defaults(&config.moonraker), Arc::new(client))
    };

    let connections = Arc::new(ConnectionManager::new(
        registry,
        config.connection.clone(),
        config.orchestrator.command_timeout(),
    ));
    let rack_cache = Arc::new(RackCache::new(store.clone(), config.cache.ttl()));
    let orchestrator = Orchestrator::new(OrchestratorParts {
        config: config.orchestrator.clone(),
        connections,
        rack_cache,
        jobs: store.clone(),
        printers: store.clone(),
        racks: store,
        ottoeject,
    });

    let report = orchestrator.initialize().await.map_err(|e| {
        tracing::error!("Failed to initialize orchestrator: {}", e);
        Box::new(e) as BoxError
    })?;
    if !report.offline.is_empty() {
        tracing::warn!("Printers offline at startup: {:?}", report.offline);
    }
    orchestrator.start()?;

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let app = create_router(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("Orchestrator API listening on {}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}
