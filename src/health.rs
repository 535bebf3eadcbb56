use std::{future::Future, time::Duration};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use crate::{extract::AppJson, state::AppState};

const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveResponse {
    status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ReadyChecks {
    database: &'static str,
    redis: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    checks: ReadyChecks,
}

pub async fn health() -> AppJson<HealthResponse> {
    AppJson(HealthResponse {
        status: "healthy",
        timestamp: OffsetDateTime::now_utc(),
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn live(State(state): State<AppState>) -> AppJson<LiveResponse> {
    AppJson(LiveResponse {
        status: "alive",
        timestamp: OffsetDateTime::now_utc(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// 503 unless both Postgres and the cache answer within the check timeout.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let (database, redis) = tokio::join!(
        probe("database", state.users.check_database()),
        probe("redis", state.users.check_cache()),
    );
    let is_ready = database && redis;
    let body = ReadyResponse {
        status: if is_ready { "ready" } else { "not ready" },
        timestamp: OffsetDateTime::now_utc(),
        checks: ReadyChecks {
            database: up_down(database),
            redis: up_down(redis),
        },
    };
    let status = if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, AppJson(body))
}

async fn probe(name: &'static str, check: impl Future<Output = anyhow::Result<()>>) -> bool {
    match tokio::time::timeout(CHECK_TIMEOUT, check).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(dependency = name, error = %e, "readiness check failed");
            false
        }
        Err(_) => {
            warn!(dependency = name, "readiness check timed out");
            false
        }
    }
}

fn up_down(ok: bool) -> &'static str {
    if ok {
        "up"
    } else {
        "down"
    }
}
