// src/rate_limit/mod.rs (C1 RateLimiter)
//
// Distributed-first, in-memory-fallback sliding/fixed window limiter. The
// distributed tier is a Redis `INCR`+`EXPIRE` pipeline (fail-open on any
// Redis error); the fallback is a keyed governor rate limiter, the same
// crate the corpus already reaches for, generalized from its single
// (`NotKeyed`) outbound-throttle use to a keyed, bounded-memory inbound
// limiter via `retain_recent`.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovRateLimiter};
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub retry_after_seconds: u64,
}

impl RateLimitResult {
    fn allow() -> Self {
        Self { allowed: true, retry_after_seconds: 0 }
    }
}

/// One rate-limit tier (e.g. "global chat, per minute" or "private chat,
/// burst"). Each surface composes one or two of these (minute + burst).
pub struct RateLimiter {
    name: &'static str,
    limit: u32,
    window: Duration,
    redis: Option<ConnectionManager>,
    fallback: Arc<GovRateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>>,
    clock: DefaultClock,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: u32, window: Duration, redis: Option<ConnectionManager>) -> Self {
        let per_key = NonZeroU32::new(limit.max(1)).unwrap();
        let quota = Quota::with_period(window / per_key.get())
            .unwrap_or_else(|| Quota::per_second(per_key))
            .allow_burst(per_key);

        Self {
            name,
            limit,
            window,
            redis,
            fallback: Arc::new(GovRateLimiter::keyed(quota)),
            clock: DefaultClock::default(),
        }
    }

    /// `key` identifies the bucket — e.g. `chat:rl:global:{user_id}` or
    /// `chat:rl:private:burst:{conversation_id}:{user_id}`.
    pub async fn check(&self, key: &str) -> RateLimitResult {
        if let Some(mut conn) = self.redis.clone() {
            match self.check_redis(&mut conn, key).await {
                Ok(result) => return result,
                Err(err) => {
                    warn!(limiter = self.name, key, error = %err, "rate limiter falling back to local state");
                }
            }
        }
        self.check_local(key)
    }

    async fn check_redis(&self, conn: &mut ConnectionManager, key: &str) -> anyhow::Result<RateLimitResult> {
        let window_secs = self.window.as_secs().max(1) as i64;

        let (count, ttl): (i64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .ttl(key)
            .query_async(conn)
            .await?;

        if ttl == -1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs)
                .query_async(conn)
                .await?;
        }

        if count <= self.limit as i64 {
            return Ok(RateLimitResult::allow());
        }

        let retry_after = if ttl > 0 { ttl as u64 } else { window_secs as u64 };
        Ok(RateLimitResult { allowed: false, retry_after_seconds: retry_after.max(1) })
    }

    fn check_local(&self, key: &str) -> RateLimitResult {
        // Bound the key set so a flood of distinct keys (e.g. spoofed ids)
        // can't grow this map without limit.
        self.fallback.retain_recent();

        match self.fallback.check_key(&key.to_string()) {
            Ok(_) => RateLimitResult::allow(),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                debug!(limiter = self.name, key, wait_ms = wait.as_millis() as u64, "local rate limit hit");
                RateLimitResult {
                    allowed: false,
                    retry_after_seconds: wait.as_secs().max(1),
                }
            }
        }
    }
}

/// Composes the two tiers a surface needs: a fixed per-minute counter and a
/// short burst window. Both must allow for the send to proceed.
pub struct TieredRateLimiter {
    pub burst: RateLimiter,
    pub per_minute: RateLimiter,
}

impl TieredRateLimiter {
    pub fn new(
        surface: &'static str,
        per_minute_limit: u32,
        burst_limit: u32,
        burst_window: Duration,
        redis: Option<ConnectionManager>,
    ) -> Self {
        Self {
            burst: RateLimiter::new(surface, burst_limit, burst_window, redis.clone()),
            per_minute: RateLimiter::new(surface, per_minute_limit, Duration::from_secs(60), redis),
        }
    }

    /// Burst check first (the spec's ingest order is burst -> minute), short
    /// circuiting on the first denial.
    pub async fn check(&self, key: &str) -> RateLimitResult {
        let burst = self.burst.check(key).await;
        if !burst.allowed {
            return burst;
        }
        self.per_minute.check(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_fallback_allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new("test", 3, Duration::from_secs(60), None);
        for _ in 0..3 {
            assert!(limiter.check("user:1").await.allowed);
        }
        let denied = limiter.check("user:1").await;
        assert!(!denied.allowed);
        assert!(denied.retry_after_seconds >= 1);
    }

    #[tokio::test]
    async fn local_fallback_is_keyed_independently() {
        let limiter = RateLimiter::new("test", 1, Duration::from_secs(60), None);
        assert!(limiter.check("user:1").await.allowed);
        assert!(limiter.check("user:2").await.allowed);
        assert!(!limiter.check("user:1").await.allowed);
    }
}
