//! Broker process entry point (component J): wires config, the matching
//! engine, the HTTP/SQS transports, and the admin surface together, then
//! runs until a shutdown signal arrives.

use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use snowflake_broker::config::Config;
use snowflake_broker::scrub::ScrubbingWriter;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_args();
    init_logging(config.unsafe_logging);

    let state = match snowflake_broker::build(&config) {
        Ok(state) => state,
        Err(err) => {
            log::error!("failed to build broker: {err}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    snowflake_broker::admin::spawn_sighup_reload(state.geoip.clone());

    let metrics_sink = metrics_sink(&config);
    snowflake_broker::spawn_metrics_reporter(state.metrics.clone(), config.metrics_interval, metrics_sink);

    let sqs_handles = match spawn_sqs(&config, state.clone(), shutdown_rx.clone()).await {
        Ok(handles) => handles,
        Err(err) => {
            log::error!("failed to start SQS transport: {err}");
            Vec::new()
        }
    };

    let app = Router::new()
        .merge(snowflake_broker::http::router(state.clone()))
        .merge(snowflake_broker::admin::router(state.clone()))
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let listener = match tokio::net::TcpListener::bind(&config.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("failed to bind {}: {err}", config.addr);
            return ExitCode::FAILURE;
        }
    };

    log::info!("snowflake-broker listening on {}", config.addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await;

    for handle in sqs_handles {
        handle.abort();
    }

    match serve_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("server error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn spawn_sqs(
    config: &Config,
    state: snowflake_broker::AppState,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let Some(queue_name) = &config.broker_sqs_name else {
        return Ok(Vec::new());
    };

    let transport = snowflake_broker::sqs::SqsTransport::connect(
        queue_name,
        config.broker_sqs_region.clone(),
        state,
        config.sqs_wait_time,
    )
    .await?;

    Ok(snowflake_broker::sqs::spawn(Arc::new(transport), shutdown_rx))
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);
}

fn init_logging(unsafe_logging: bool) {
    let writer = ScrubbingWriter::new(std::io::stderr(), !unsafe_logging);
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(writer)))
        .init();
}

fn metrics_sink(config: &Config) -> Box<dyn std::io::Write + Send> {
    match &config.metrics_log {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Box::new(ScrubbingWriter::new(file, !config.unsafe_logging)),
            Err(err) => {
                log::error!("failed to open metrics log {}: {err}, falling back to stderr", path.display());
                Box::new(ScrubbingWriter::new(std::io::stderr(), !config.unsafe_logging))
            }
        },
        None => Box::new(ScrubbingWriter::new(std::io::stderr(), !config.unsafe_logging)),
    }
}
