//! Fixed-window request limiter.
//!
//! Keys are the authenticated user id when available, otherwise the client
//! address. Redis backs the counters when configured so limits hold across
//! instances; a local map takes over if Redis is unreachable.

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use metrics::counter;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::auth::AuthUser;
use crate::errors::ServiceError;

fn num_to_header_value<T: ToString>(n: T) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 10,
            window_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Default)]
pub enum RateLimitBackend {
    #[default]
    InMemory,
    Redis {
        client: Arc<redis::Client>,
        namespace: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: Duration,
}

#[derive(Clone)]
pub struct RateLimiter {
    backend: RateLimitBackend,
    local: Arc<DashMap<String, RateLimitEntry>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, backend: RateLimitBackend) -> Self {
        Self {
            backend,
            local: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::new(config, RateLimitBackend::InMemory)
    }

    pub async fn check_rate_limit(&self, key: &str) -> RateLimitResult {
        match &self.backend {
            RateLimitBackend::InMemory => self.check_in_memory(key),
            RateLimitBackend::Redis { client, namespace } => {
                match client.get_async_connection().await {
                    Ok(mut conn) => match self.check_with_redis(&mut conn, namespace, key).await {
                        Ok(result) => result,
                        Err(err) => {
                            warn!("Redis rate limit error: {}", err);
                            self.check_in_memory(key)
                        }
                    },
                    Err(err) => {
                        warn!("Failed to connect to Redis for rate limiting, using fallback: {}", err);
                        self.check_in_memory(key)
                    }
                }
            }
        }
    }

    fn check_in_memory(&self, key: &str) -> RateLimitResult {
        let window = self.config.window_duration;
        let limit = self.config.requests_per_window;
        let now = Instant::now();

        let mut entry = self
            .local
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                window_start: now,
            });
        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }

        let reset_time = window.saturating_sub(now.duration_since(entry.window_start));
        if entry.count >= limit {
            return RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_time,
            };
        }
        entry.count += 1;
        RateLimitResult {
            allowed: true,
            limit,
            remaining: limit - entry.count,
            reset_time,
        }
    }

    async fn check_with_redis<C>(
        &self,
        conn: &mut C,
        namespace: &str,
        key: &str,
    ) -> Result<RateLimitResult, redis::RedisError>
    where
        C: redis::aio::ConnectionLike + Send,
    {
        let redis_key = format!("{}:{}", namespace, key);
        let limit = self.config.requests_per_window;
        let window_secs = self.config.window_duration.as_secs().max(1);

        let count: i64 = conn.incr(&redis_key, 1).await?;
        if count == 1 {
            conn.expire::<_, ()>(&redis_key, window_secs as usize).await?;
        }
        let ttl_secs = match conn.ttl::<_, i64>(&redis_key).await {
            Ok(ttl) if ttl > 0 => ttl as u64,
            _ => window_secs,
        };

        let allowed = count <= i64::from(limit);
        Ok(RateLimitResult {
            allowed,
            limit,
            remaining: if allowed {
                limit.saturating_sub(count.max(0) as u32)
            } else {
                0
            },
            reset_time: Duration::from_secs(ttl_secs),
        })
    }
}

fn rate_limit_key(req: &Request) -> String {
    if let Some(user) = req.extensions().get::<AuthUser>() {
        return format!("user:{}", user.user_id);
    }
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| format!("ip:{}", ip.trim()))
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Must be layered inside the auth middleware so the user id is visible.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = rate_limit_key(&request);
    let result = limiter.check_rate_limit(&key).await;

    let mut response = if result.allowed {
        next.run(request).await
    } else {
        debug!(%key, "rate limit exceeded");
        counter!("rate_limit.rejected", 1);
        ServiceError::RateLimitExceeded.into_response()
    };

    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", num_to_header_value(result.limit));
    headers.insert("x-ratelimit-remaining", num_to_header_value(result.remaining));
    headers.insert(
        "x-ratelimit-reset",
        num_to_header_value(result.reset_time.as_secs()),
    );
    response
}
