use clap::Parser;
use pg_ingest::{Config, Error, EventBus, Ingester, ReplicationConnection, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-ingest")]
#[command(about = "PostgreSQL logical replication CDC ingester", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-ingest v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("\nRequired environment variables:");
            eprintln!("  REPLICATION_DB_URL          - PostgreSQL connection URL");
            eprintln!("  REPLICATION_DB_USERNAME     - replication user");
            eprintln!("  REPLICATION_DB_PASSWORD     - replication password");
            eprintln!("  REPLICATION_DB_SLOT         - existing logical replication slot");
            eprintln!("  REPLICATION_DB_PUBLICATION  - existing publication");
            std::process::exit(1);
        }
    };

    info!(
        slot = %config.db.slot,
        publication = %config.db.publication,
        poll_interval_ms = config.replication.poll_interval_ms,
        status_interval_secs = config.replication.status_interval_secs,
        "Configuration summary"
    );

    let mut bus = EventBus::new(config.replication.bus_capacity);
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("Received CDC event - {event}");
        }
    });

    let source = ReplicationConnection::new(config.clone());
    let ingester = Ingester::new(source, bus, &config.replication);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    match ingester.run(shutdown).await {
        Err(Error::Shutdown) => {
            info!("Replication stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!("Replication failed: {}", e);
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_ingest=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_ingest=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
