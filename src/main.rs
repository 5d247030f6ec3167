use anyhow::Result;
use clap::Parser;
use codegraphd::socket_path::default_socket_path;
use codegraphd::{
    AnalysisConfig, AnalysisDaemon, JobRegistry, LanguageDetector, LanguageRegistry,
    MemoryGraphStore, Project, ServerPool, SourceType, SubscriptionBroker,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Streaming code knowledge-graph analysis daemon"
)]
struct Args {
    /// Path to the IPC socket the daemon listens on
    #[clap(short, long, default_value_t = default_socket_path())]
    socket: String,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short, long, default_value = "info")]
    log_level: String,

    /// Register a project root at startup and log its id
    #[clap(short, long)]
    project: Option<PathBuf>,

    /// Override worker parallelism
    #[clap(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting codegraphd v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AnalysisConfig::from_env();
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }
    let config = Arc::new(config);

    // Process-wide singletons, wired here and injected everywhere else.
    let detector = Arc::new(LanguageDetector::new());
    let languages = Arc::new(LanguageRegistry::with_builtins());
    let pool = Arc::new(ServerPool::new(languages, &config));
    let store = Arc::new(MemoryGraphStore::new());
    let broker = Arc::new(SubscriptionBroker::new(
        config.broker_ring,
        config.subscriber_buffer,
    ));
    let registry = Arc::new(JobRegistry::new(
        config.clone(),
        store.clone(),
        broker,
        pool,
        detector,
    ));

    if let Some(root) = args.project {
        let root = root.canonicalize()?;
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project")
            .to_string();
        let project = Project::new(name, root, SourceType::Git);
        info!("Registered project {}", project.project_id);
        registry.register_project(project);
    }

    let daemon = Arc::new(AnalysisDaemon::new(args.socket, registry, store));
    if let Err(e) = daemon.run().await {
        error!("Daemon error: {}", e);
        return Err(e);
    }

    info!("Daemon shutdown complete");
    Ok(())
}
