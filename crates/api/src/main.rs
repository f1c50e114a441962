use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;

use courier_api::app::{
    build_app,
    services::{self, Capabilities},
};
use courier_infra::{
    Config, DeliveryMode, Gateway, ReceiptsClient, RedisStreamTransport, SpreadsheetsClient,
};

// Workers and the blocking gateway clients live on plain threads; only the
// HTTP server runs inside the tokio runtime.
fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;
    courier_observability::init(config.log_format);

    let gateway = Gateway::new(&config.gateway_addr, config.http_timeout)?;
    let capabilities = Capabilities {
        receipts: Arc::new(ReceiptsClient::new(gateway.clone())),
        sheets: Arc::new(SpreadsheetsClient::new(gateway)),
    };

    let wiring = match config.mode {
        DeliveryMode::Queue => services::queue_mode(
            config.queue_capacity,
            config.queue_retry_policy(),
            capabilities,
        )?,
        DeliveryMode::Stream => {
            let addr = config
                .redis_addr
                .as_deref()
                .context("REDIS_ADDR is required in stream mode")?;
            let transport = RedisStreamTransport::new(addr)?.with_claim_idle(config.claim_idle);
            let consumer = format!("courier-{}", std::process::id());
            services::stream_mode(
                Arc::new(transport),
                &consumer,
                config.stream_retry_policy(),
                capabilities,
            )?
        }
    };
    tracing::info!(mode = %config.mode, "delivery started");

    let app = build_app(wiring.services.clone());
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let served = runtime.block_on(serve(config.bind_addr, app));
    drop(runtime);

    wiring.shutdown()?;
    served
}

async fn serve(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown requested");
    }
}
