use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use herald::gateway::FcmGateway;
use herald::persistence::RedisStore;
use herald::{DispatchRuntimeBuilder, HeraldConfig, LogConfig};

fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HeraldConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log);

    #[cfg(feature = "metrics")]
    herald::metrics::init_metrics()?;

    let keys = config.queue.key_space();
    let store = Arc::new(
        RedisStore::from_config(&config.store, keys)
            .await
            .with_context(|| {
                format!("could not connect to redis at {}", config.store.display_addr())
            })?,
    );
    store.ping().await?;
    tracing::info!(addr = %config.store.display_addr(), "connected to redis");

    let gateway = Arc::new(
        FcmGateway::from_config(&config.gateway)
            .context("could not initialise push gateway")?,
    );
    tracing::info!(project_id = %gateway.project_id(), "push gateway ready");

    let runtime = DispatchRuntimeBuilder::from_config(&config)
        .with_queue(Arc::clone(&store))
        .with_store(store)
        .with_gateway(gateway)
        .build()?;

    let shutdown = runtime.shutdown_token();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {err}");
            return;
        }
        tracing::info!("interrupt received, stopping");
        shutdown.cancel();
    });

    runtime.run().await
}
