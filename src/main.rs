use std::{net::SocketAddr, sync::Arc, time::Duration};

use nexusforge::{
    app::{build_app, serve},
    cache::RedisCache,
    config::AppConfig,
    db, metrics,
    state::AppState,
    users::PgUserRepository,
};

fn init_tracing(config: &AppConfig) {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!(
            "nexusforge={},axum=info,tower_http=info,sqlx=warn",
            config.log.level
        )
    });

    if config.log.json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(&config);
    config.validate()?;
    let config = Arc::new(config);

    let pool = db::connect(&config.database).await?;
    db::run_migrations(&pool).await;

    let redis = RedisCache::new(&config.redis)?;

    if config.features.enable_metrics {
        metrics::init_metrics();
    }

    let state = AppState::from_parts(
        config.clone(),
        Arc::new(PgUserRepository::new(pool.clone())),
        Arc::new(redis.clone()),
    );
    let sweeper = state.limiter.clone().spawn_sweeper();

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let result = serve(build_app(state), addr, grace).await;

    sweeper.abort();
    pool.close().await;
    redis.close();
    tracing::info!("shutdown complete");

    result
}
