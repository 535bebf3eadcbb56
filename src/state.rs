use std::{sync::Arc, time::Instant};

use crate::{
    auth::JwtKeys,
    cache::{CacheManager, CacheStore},
    config::AppConfig,
    rate_limit::RateLimiter,
    users::{repo::UserRepository, UserService},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: UserService,
    pub jwt: Arc<JwtKeys>,
    pub limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn from_parts(
        config: Arc<AppConfig>,
        repo: Arc<dyn UserRepository>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        let cache = CacheManager::new(cache, config.features.enable_cache);
        Self {
            users: UserService::new(repo, cache),
            jwt: Arc::new(JwtKeys::from_config(&config.jwt)),
            limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            started_at: Instant::now(),
            config,
        }
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        crate::testing::TestApp::new().state
    }
}
