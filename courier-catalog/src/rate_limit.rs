//! Process-wide token bucket shared by every session calling the catalog.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    refill_per_second: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(refill_per_second: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            refill_per_second: refill_per_second.max(0.001),
            burst,
        }
    }

    /// Waits until one call may proceed.
    pub async fn acquire(&self) {
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.burst);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    if !waited.is_zero() {
                        tracing::debug!(
                            waited_ms = waited.as_millis() as u64,
                            "rate limiter granted token after wait"
                        );
                    }
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_second)
            };
            waited += wait;
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn available(&self) -> f64 {
        let state = self.state.lock().await;
        let elapsed = Instant::now()
            .duration_since(state.last_refill)
            .as_secs_f64();
        (state.tokens + elapsed * self.refill_per_second).min(self.burst)
    }
}

#[cfg(test)]
mod tests {
    use super::RateLimiter;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn burst_is_granted_immediately() {
        let limiter = RateLimiter::new(1.0, 3);
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn calls_beyond_burst_are_spaced_out() {
        let limiter = RateLimiter::new(2.0, 1);
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(1.0, 1));
        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        for handle in handles {
            handle.await.expect("task joins");
        }
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
