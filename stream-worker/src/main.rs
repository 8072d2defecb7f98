//! Consume Redis streams as a member of a consumer group.
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use redis_streams::RedisStreamClient;
use stream_worker::config::Config;
use stream_worker::error::WorkerError;
use stream_worker::worker::{ensure_groups, StreamWorker};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let client = Arc::new(
        RedisStreamClient::with_config(
            config.redis_url.clone(),
            config.response_timeout_ms.map(|d| d.0),
            Some(config.connection_timeout_ms.0),
        )
        .await
        .map_err(WorkerError::ConnectionError)?,
    );

    if config.create_groups {
        ensure_groups(
            client.as_ref(),
            &config.streams.0,
            config.group_name.as_str(),
        )
        .await?;
    }

    let worker = StreamWorker::new(client, &config)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown.cancel();
    });

    info!(streams = ?config.streams.0, "starting stream worker");
    worker.run(&cancel).await?;
    info!("stream worker stopped");

    Ok(())
}
