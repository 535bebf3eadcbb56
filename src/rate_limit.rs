//! Per-client fixed-window rate limiting.
//!
//! One record per client IP holds the start of its current window and a
//! request count. The read-check-increment sequence runs under the map's
//! shard lock for that key, so two concurrent requests can never both slip in
//! under the limit. A background sweep drops records idle for longer than a
//! window.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{config::RateLimitConfig, error::AppError, metrics};

#[derive(Debug, Clone, Copy)]
struct Visitor {
    window_start: Instant,
    last_seen: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    trust_proxy: bool,
    visitors: DashMap<IpAddr, Visitor>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            limit: cfg.requests,
            window: cfg.window(),
            trust_proxy: cfg.trust_proxy,
            visitors: DashMap::new(),
        }
    }

    /// Admits or rejects one request from `ip` at `now`.
    /// On rejection returns the whole seconds left in the current window.
    pub fn check(&self, ip: IpAddr, now: Instant) -> Result<(), u64> {
        let mut entry = self.visitors.entry(ip).or_insert(Visitor {
            window_start: now,
            last_seen: now,
            count: 0,
        });
        let visitor = entry.value_mut();
        visitor.last_seen = now;

        if now.duration_since(visitor.window_start) > self.window {
            visitor.window_start = now;
            visitor.count = 0;
        }

        if visitor.count >= self.limit {
            let left = self
                .window
                .saturating_sub(now.duration_since(visitor.window_start));
            return Err(ceil_secs(left));
        }

        visitor.count += 1;
        Ok(())
    }

    /// Removes records whose last request is older than one window.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.visitors.len();
        self.visitors
            .retain(|_, v| now.duration_since(v.last_seen) <= self.window);
        before.saturating_sub(self.visitors.len())
    }

    pub fn tracked(&self) -> usize {
        self.visitors.len()
    }

    /// Runs [`sweep`](Self::sweep) once per window until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.window);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep(Instant::now());
                if removed > 0 {
                    debug!(removed, remaining = self.tracked(), "rate limiter sweep");
                }
            }
        })
    }

    /// Peer address, or the proxy-reported client when proxies are trusted.
    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> IpAddr {
        if self.trust_proxy {
            if let Some(ip) = forwarded_ip(headers) {
                return ip;
            }
        }
        peer.map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let first_hop = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());
    first_hop.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = limiter.client_ip(req.headers(), peer);

    if let Err(retry_after_secs) = limiter.check(ip, Instant::now()) {
        warn!(%ip, path = %req.uri().path(), "rate limit exceeded");
        metrics::record_rate_limited();
        return Err(AppError::TooManyRequests { retry_after_secs });
    }
    Ok(next.run(req).await)
}
