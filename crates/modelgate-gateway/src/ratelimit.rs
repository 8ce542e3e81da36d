use std::time::{SystemTime, UNIX_EPOCH};

use redis::AsyncCommands;
use tracing::warn;

use crate::kv::Kv;

const WINDOW_SECS: i64 = 60;
const KEY_TTL_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: i64,
}

/// Sliding-window request limiter over two fixed 60 s windows in the KV store.
///
/// The previous window's count is weighted by the fraction of the current window
/// still ahead, which bounds state to O(1) per account and one round trip per
/// admission. Infrastructure errors fail open: an unreachable KV store admits the
/// request with a warning, never a 429.
#[derive(Clone)]
pub struct RateLimiter {
    kv: Kv,
    default_rpm: i64,
}

impl RateLimiter {
    pub fn new(kv: Kv, default_rpm: i64) -> Self {
        Self { kv, default_rpm }
    }

    pub fn default_rpm(&self) -> i64 {
        self.default_rpm
    }

    pub async fn check_and_increment(&self, account_id: i64, limit: i64) -> RateDecision {
        let now = now_seconds();
        match self.try_check(account_id, limit, now).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(account_id, error = %err, "rate limiter unavailable, admitting");
                RateDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at: (now / WINDOW_SECS + 1) * WINDOW_SECS,
                }
            }
        }
    }

    async fn try_check(
        &self,
        account_id: i64,
        limit: i64,
        now: i64,
    ) -> Result<RateDecision, redis::RedisError> {
        let window = now / WINDOW_SECS;
        let curr_key = window_key(account_id, window);
        let prev_key = window_key(account_id, window - 1);

        let mut conn = self.kv.connection().await?;
        let (prev, curr, _): (Option<i64>, i64, i64) = redis::pipe()
            .get(&prev_key)
            .incr(&curr_key, 1i64)
            .expire(&curr_key, KEY_TTL_SECS)
            .query_async(&mut conn)
            .await?;

        let estimated = estimate(prev.unwrap_or(0), curr, now);
        let reset_at = (window + 1) * WINDOW_SECS;

        if estimated > limit {
            // Roll back the increment we just made; a failed rollback still rejects.
            if let Err(err) = conn.decr::<_, _, i64>(&curr_key, 1i64).await {
                warn!(account_id, error = %err, "rate limit rollback failed");
            }
            Ok(RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
            })
        } else {
            Ok(RateDecision {
                allowed: true,
                limit,
                remaining: (limit - estimated).max(0),
                reset_at,
            })
        }
    }
}

/// `⌊prev·(1−progress) + curr⌋` where `progress` is the fraction of the current
/// window already elapsed.
fn estimate(prev: i64, curr: i64, now: i64) -> i64 {
    let progress = (now % WINDOW_SECS) as f64 / WINDOW_SECS as f64;
    (prev as f64 * (1.0 - progress) + curr as f64).floor() as i64
}

fn window_key(account_id: i64, window: i64) -> String {
    format!("ratelimit:{account_id}:{window}")
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_at_window_start_counts_full_previous() {
        // progress = 0 → whole previous window counts.
        assert_eq!(estimate(10, 1, 600), 11);
    }

    #[test]
    fn estimate_at_window_end_ignores_previous() {
        // progress = 59/60 → only a sliver of the previous window remains.
        assert_eq!(estimate(60, 1, 659), 2);
    }

    #[test]
    fn estimate_midwindow_interpolates() {
        // t = 630 → progress 0.5, half of prev=10 plus curr=3.
        assert_eq!(estimate(10, 3, 630), 8);
    }

    #[test]
    fn estimate_with_no_previous_window() {
        assert_eq!(estimate(0, 7, 615), 7);
    }

    #[test]
    fn window_key_layout() {
        assert_eq!(window_key(42, 28333335), "ratelimit:42:28333335");
    }

    #[test]
    fn scenario_eleventh_request_at_ten_seconds() {
        // 10 requests landed at t=0s of the window; the 11th arrives at t=10s.
        // prev window is empty, so estimated == curr == 11 > limit 10.
        let now = 28333335 * 60 + 10;
        let estimated = estimate(0, 11, now);
        assert!(estimated > 10);
        let reset_at = (now / 60 + 1) * 60;
        let retry_after = reset_at - now;
        assert_eq!(retry_after, 50);
    }
}
