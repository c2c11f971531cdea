use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cluster_reconciler::cluster::{Inventory, MemoryInventory};
use cluster_reconciler::kubernetes::{KubeconfigClientProvider, ProgressConfig};
use cluster_reconciler::scheduler::{
    Dispatcher, DispatcherConfig, InventoryWatchConfig, InventoryWatcher,
    MemoryOperationsRegistry, OperationsRegistry, ReconcilersConfig, RemoteInvoker,
};
use cluster_reconciler::{telemetry, Error};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation mothership
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Port of the REST API
    #[arg(long, env = "MOTHERSHIP_PORT", default_value_t = 8080)]
    port: u16,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, env = "MOTHERSHIP_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key of --tls-cert
    #[arg(long, env = "MOTHERSHIP_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// How often the inventory is checked for clusters to reconcile (0s selects the default)
    #[arg(long, env = "WATCH_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    watch_interval: Duration,

    /// Minimum time between two reconciliations of a ready cluster (0s selects the default)
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "15m", value_parser = humantime::parse_duration)]
    reconcile_interval: Duration,

    /// Clusters reconciled concurrently
    #[arg(long, env = "WORKERS", default_value_t = 10)]
    workers: usize,

    /// Capacity of the queue between inventory watcher and dispatcher
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 100)]
    queue_capacity: usize,

    /// How long a scheduling run waits for reconciler callbacks
    #[arg(long, env = "OPERATION_TIMEOUT", default_value = "10m", value_parser = humantime::parse_duration)]
    operation_timeout: Duration,

    #[arg(long, env = "OPERATION_POLL_INTERVAL", default_value = "5s", value_parser = humantime::parse_duration)]
    operation_poll_interval: Duration,

    #[arg(long, env = "PROGRESS_INTERVAL", default_value = "5s", value_parser = humantime::parse_duration)]
    progress_interval: Duration,

    #[arg(long, env = "PROGRESS_TIMEOUT", default_value = "5m", value_parser = humantime::parse_duration)]
    progress_timeout: Duration,

    /// Base URL component reconcilers use to reach the callback endpoint
    #[arg(long, env = "CALLBACK_URL", default_value = "http://localhost:8080")]
    callback_url: String,

    /// YAML file mapping component names to reconciler URLs
    #[arg(long, env = "RECONCILERS_FILE")]
    reconcilers_file: Option<PathBuf>,

    /// Reconciler URL for components missing in --reconcilers-file
    #[arg(long, env = "DEFAULT_RECONCILER_URL")]
    default_reconciler_url: Option<String>,

    /// Verify declared component resources with the progress tracker before marking a cluster ready
    #[arg(long, env = "VERIFY_CONVERGENCE")]
    verify_convergence: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Reconciler mothership v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Run(run_args) => run_mothership(run_args).await,
    }
}

fn init_tracing() -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let fmt_layer = fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if let Some(endpoint) = telemetry::otlp_endpoint() {
        let otel_layer = telemetry::init_telemetry(&endpoint)?;
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized ({})", endpoint);
    } else {
        registry.init();
        info!(
            "OpenTelemetry tracing disabled ({} not set)",
            telemetry::OTLP_ENDPOINT_ENV
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_mothership(args: RunArgs) -> Result<(), Error> {
    init_tracing()?;
    info!("Starting reconciler mothership v{}", env!("CARGO_PKG_VERSION"));

    if args.queue_capacity == 0 {
        return Err(Error::ConfigError(
            "queue capacity must be greater than zero".to_string(),
        ));
    }

    let inventory: Arc<dyn Inventory> = Arc::new(MemoryInventory::new());
    let operations: Arc<dyn OperationsRegistry> = Arc::new(MemoryOperationsRegistry::new());

    let reconcilers = match &args.reconcilers_file {
        Some(path) => ReconcilersConfig::from_file(path)?,
        None => ReconcilersConfig::default(),
    };
    info!(
        "Loaded {} component reconciler endpoint(s), default endpoint: {}",
        reconcilers.len(),
        args.default_reconciler_url.as_deref().unwrap_or("none")
    );
    let invoker = Arc::new(RemoteInvoker::new(
        reconcilers,
        args.default_reconciler_url.clone(),
    )?);

    let dispatcher_config = DispatcherConfig {
        workers: args.workers,
        operation_poll_interval: args.operation_poll_interval,
        operation_timeout: args.operation_timeout,
        callback_base_url: args.callback_url.clone(),
        progress: args.verify_convergence.then_some(ProgressConfig {
            interval: args.progress_interval,
            timeout: args.progress_timeout,
        }),
    };
    let mut dispatcher = Dispatcher::new(
        inventory.clone(),
        operations.clone(),
        invoker,
        dispatcher_config,
    )?;
    if args.verify_convergence {
        dispatcher = dispatcher.with_client_provider(Arc::new(KubeconfigClientProvider));
    }
    let dispatcher = Arc::new(dispatcher);

    let watcher = InventoryWatcher::new(
        inventory.clone(),
        InventoryWatchConfig::new(args.watch_interval, args.reconcile_interval)?,
    )?;

    let cancel = CancellationToken::new();
    let (queue_tx, queue_rx) = mpsc::channel(args.queue_capacity);

    let watcher_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(cancel, queue_tx).await })
    };
    let dispatcher_task = tokio::spawn(dispatcher.run(cancel.clone(), queue_rx));

    #[cfg(feature = "rest-api")]
    let server_task = {
        use cluster_reconciler::rest_api::{run_server, ApiState, ServerConfig, TlsConfig};

        let tls = match (args.tls_cert.clone(), args.tls_key.clone()) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path,
                key_path,
            }),
            _ => None,
        };
        let state = Arc::new(ApiState::new(inventory.clone(), operations.clone()));
        let config = ServerConfig {
            port: args.port,
            tls,
        };
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_server(state, config, cancel.clone()).await {
                error!("REST API server error: {}", e);
                // without the callback endpoint no run can finish
                cancel.cancel();
            }
        })
    };

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    match watcher_task.await {
        Ok(Err(e)) => error!("Inventory watcher stopped with error: {}", e),
        Err(e) => error!("Inventory watcher task failed: {}", e),
        Ok(Ok(())) => {}
    }
    match dispatcher_task.await {
        Ok(Err(e)) => error!("Dispatcher stopped with error: {}", e),
        Err(e) => error!("Dispatcher task failed: {}", e),
        Ok(Ok(())) => {}
    }
    #[cfg(feature = "rest-api")]
    if let Err(e) = server_task.await {
        error!("REST API server task failed: {}", e);
    }

    info!("Reconciler mothership stopped");
    telemetry::shutdown_telemetry();
    Ok(())
}
