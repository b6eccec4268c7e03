use std::sync::Arc;
use tokio::net::TcpListener;
use log::{info, warn, error};
use tower_http::cors::CorsLayer;

use quote_feed::api::{ApiState, create_api_router};
use quote_feed::config::Config;
use quote_feed::feed::{FeedClient, ReconnectPolicy, WsTransport};
use quote_feed::model::Quote;
use quote_feed::volume::{HttpVolumeFetcher, VolumeCache, VolumeRefresher};

fn log_quote(quote: Quote) {
    match (quote.volume, quote.trading_value) {
        (Some(volume), Some(value)) => info!(
            "{} {:.2} ({:+.2}) vol={} value={} @ {}",
            quote.code, quote.price, quote.change, volume, value, quote.timestamp
        ),
        _ => info!(
            "{} {:.2} ({:+.2}) @ {}",
            quote.code, quote.price, quote.change, quote.timestamp
        ),
    }
}

/// Connects (retrying with the reconnect policy) and subscribes the watch list.
async fn connect_and_watch(client: FeedClient, codes: Vec<String>, policy: ReconnectPolicy) {
    let mut attempt = 0;
    loop {
        match client.connect().await {
            Ok(()) => break,
            Err(e) if policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                warn!("Initial feed connection failed: {} (retrying in {:?})", e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("Giving up on initial feed connection: {}", e);
                return;
            }
        }
    }

    for code in &codes {
        if let Err(e) = client.subscribe(code, log_quote).await {
            warn!("Could not subscribe to {}: {}", code, e);
        }
    }
    info!("Subscribed to {}/{} watch codes", client.subscription_count(), codes.len());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    // Log configuration
    config.log_config();

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    // Shared cache, feed client and refresher
    let cache = Arc::new(VolumeCache::default());
    let transport = Arc::new(WsTransport::new(&config.feed_url));
    let client = FeedClient::new(transport, cache.clone(), config.client_settings());

    let refresher_settings = config.refresher_settings();
    let fetcher = Arc::new(HttpVolumeFetcher::new(&config.volume_api_url, refresher_settings.fetch_timeout)?);
    let supplier_client = client.clone();
    let refresher = Arc::new(VolumeRefresher::new(
        fetcher,
        cache.clone(),
        Arc::new(move || supplier_client.subscribed_codes()),
        refresher_settings,
    ));

    let startup = tokio::spawn(connect_and_watch(client.clone(), config.watch_codes.clone(), config.client_settings().reconnect));

    refresher.start();

    // Start API server
    let api_state = ApiState {
        client: client.clone(),
        cache: cache.clone(),
        refresher: refresher.clone(),
    };

    let api_router = create_api_router(api_state)
        .layer(CorsLayer::permissive()); // Enable CORS for web clients

    let api_listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("Status API running at http://{}", config.api_bind_address);

    let api_server = axum::serve(api_listener, api_router);

    tokio::select! {
        result = api_server => {
            error!("API server stopped: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    startup.abort();
    refresher.stop().await;
    client.close().await;
    info!("Quote feed stopped");

    Ok(())
}
