use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use httptap::capture::{
    CaptureObserver, CapturePipeline, MetricsObserver, PersistenceSink, TransactionCorrelator,
};
use httptap::commands;
use httptap::config::{self, CliOverrides, Config};
use httptap::error::Result;
use httptap::proxy::{ProxyServer, TlsHandler, Upstream};
use httptap::storage::{SqliteStore, TransactionStore};

#[derive(Parser, Debug)]
#[command(name = "httptap")]
#[command(about = "Forward HTTP/HTTPS proxy that records every exchange to SQLite", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log every proxied request
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Proxy listen address
    #[arg(long, value_name = "ADDR", global = true)]
    addr: Option<String>,

    /// SQLite database file
    #[arg(long, value_name = "FILE", global = true)]
    database: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the proxy (default)
    Run,
    /// Print the most recent captured transactions as JSON lines
    Recent {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the root CA certificate to install in client trust stores
    Ca,
    /// Validate configuration, database and CA
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.log_format);

    let overrides = CliOverrides {
        listen: args.addr.clone(),
        database: args.database.clone(),
        verbose: args.verbose.then_some(true),
    };
    let config = match config::load(args.config.as_deref(), &overrides) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return Err(e);
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Recent { limit } => {
            commands::print_recent(&config, limit, &mut std::io::stdout().lock()).await
        }
        Command::Ca => commands::print_ca(&config, &mut std::io::stdout().lock()),
        Command::Check => commands::run_config_check(&config).await,
    }
}

fn init_tracing(debug: bool, format: LogFormat) {
    let log_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("httptap={log_level}")));

    // Logs go to stderr so `recent` and `ca` output stays clean on stdout
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config: Config) -> Result<()> {
    let listen = config.listen_addr()?;
    info!(
        %listen,
        database = %config.database,
        mitm = config.tls.mitm,
        record_static = config.capture.record_static,
        "Starting httptap"
    );

    let store = SqliteStore::open(&config.database)?
        .with_busy_timeout(config.persistence.write_timeout());
    let store: Arc<dyn TransactionStore> = Arc::new(store);
    let metrics = Arc::new(MetricsObserver::new());
    let observer: Arc<dyn CaptureObserver> = metrics.clone();

    let sink = Arc::new(PersistenceSink::start(
        &config.persistence,
        config.capture.record_static,
        store,
        observer.clone(),
    ));
    let correlator = Arc::new(TransactionCorrelator::new());
    let pipeline = Arc::new(CapturePipeline::new(
        &config.capture,
        correlator.clone(),
        sink.clone(),
        observer,
    ));

    let sweeper_cancel = CancellationToken::new();
    let sweeper = correlator.spawn_sweeper(
        config.capture.pending_ttl(),
        config.capture.sweep_interval(),
        sweeper_cancel.clone(),
    );

    let tls = if config.tls.mitm {
        let tls = TlsHandler::new(config.tls.ca_dir.clone())?;
        info!(
            ca_cert = %tls.ca_cert_path().display(),
            "HTTPS interception enabled; install the CA certificate in your client"
        );
        Some(Arc::new(tls))
    } else {
        None
    };

    let upstream = Upstream::new(config.upstream_timeout())?;
    let server = Arc::new(ProxyServer::new(pipeline, upstream, tls, config.verbose));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut proxy_handle = tokio::spawn(server.run(listen, shutdown_rx));

    let proxy_result = tokio::select! {
        result = &mut proxy_handle => Some(result),
        _ = shutdown_signal() => None,
    };

    info!("Shutting down httptap");
    let proxy_result = match proxy_result {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(());
            proxy_handle.await
        }
    };

    sweeper_cancel.cancel();
    let _ = sweeper.await;
    sink.shutdown().await;

    let stats = metrics.snapshot();
    info!(
        captured = stats.captured,
        persisted = stats.persisted,
        skipped = stats.skipped,
        dropped = stats.dropped,
        correlation_misses = stats.correlation_misses,
        "Capture totals"
    );
    debug!("Final metrics:\n{}", metrics.gather());

    match proxy_result {
        Ok(result) => result,
        Err(e) => Err(httptap::error::ProxyError::Server(e.to_string())),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
