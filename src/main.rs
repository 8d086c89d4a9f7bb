use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use stars_lottery::bridge::{BridgeHandler, stdio};
use stars_lottery::config::{self, Config};
use stars_lottery::demo::DemoGateway;
use stars_lottery::use_cases::{AdminUseCase, PlayerUseCase};
use stars_lottery::{HostIdentity, HttpGateway, LotteryGateway, LotteryListCache};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("⭐ Stars lottery bridge starting against {}", config.api_url);

    if config.uses_demo_backend() {
        run(DemoGateway::seeded(), config).await
    } else {
        run(HttpGateway::new(config.api_url.clone()), config).await
    }
}

async fn run<G: LotteryGateway>(gateway: G, config: Config) -> Result<()> {
    let gateway = Arc::new(gateway);
    let cache = Arc::new(LotteryListCache::new(Arc::clone(&gateway)));
    if let Err(e) = cache.refresh().await {
        tracing::warn!("initial lottery list unavailable: {:#}", e);
    }
    let list_poller = cache.start_polling(config.poll_interval);

    let identity = config
        .init_data
        .as_deref()
        .context("authorization error: TELEGRAM_INIT_DATA is not set")
        .and_then(HostIdentity::from_init_data);
    if let Err(e) = &identity {
        tracing::warn!("player tools disabled: {:#}", e);
    }

    let player = PlayerUseCase::new(Arc::clone(&gateway), Arc::clone(&cache), identity);
    player.refresh_context().await;
    let context_poller = player.start_context_polling(config.context_poll_interval);
    let admin = AdminUseCase::new(gateway, cache);

    let handler = BridgeHandler::new(Arc::new(player), Arc::new(admin));
    let (reader, writer) = stdio();

    let served = handler.serve(reader, writer).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    });

    list_poller.stop().await;
    if let Some(poller) = context_poller {
        poller.stop().await;
    }
    served
}
