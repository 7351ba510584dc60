use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use semgate::{
    AppState, Config, HttpEmbedder, ProxyConfig, RedisStore, SqliteStore, SystemClock,
    TokenService, UpstreamProxy,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::from_env()?;

    let store = SqliteStore::new(&config.database_url);
    store.init().await?;

    let redis = RedisStore::new(&config.redis_url)?;
    redis.ping().await?;

    let embedder = Arc::new(HttpEmbedder::new(config.embedding_service_url.as_str())?);
    let proxy = UpstreamProxy::new(ProxyConfig::default())?;
    let clock = Arc::new(SystemClock);
    let tokens = TokenService::new(&config.jwt_secret, clock.clone());

    let mut state = AppState::new(store, Arc::new(redis), embedder, proxy, tokens, clock);
    if let Some(token) = config.admin_token.clone() {
        state = state.with_admin_token(token);
    }

    let app = semgate::http::router(state);
    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.server_port)).await?;
    tracing::info!(port = config.server_port, "semgate listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
