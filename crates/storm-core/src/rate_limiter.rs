use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Fixed-point scale: one token is `SCALE` units, so fractional refills
/// accumulate exactly between calls.
const SCALE: i128 = 1_000_000;
/// Rates are held in milli-requests per second.
const MILLI: i128 = 1_000;

/// Result of asking the limiter for permission to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was available (or the limiter is unlimited).
    Immediate,
    /// A token was reserved that becomes valid after this wait.
    Delayed(Duration),
}

struct Bucket {
    /// Scaled token count. Goes negative while reservations are outstanding.
    tokens: i128,
    last_refill: Instant,
}

/// Shared token bucket with continuous, time-based refill.
///
/// Callers reserve tokens in call order: when the bucket is empty the token
/// is taken on credit and the caller sleeps until the refill covers it, so
/// waiting workers are served first-come first-served and the admitted count
/// over any window `T` never exceeds `rate * T + burst`.
pub struct RateLimiter {
    /// Target rate in milli-tokens per second, 0 = unlimited
    rate_milli: u64,
    /// Scaled bucket capacity
    capacity: i128,
    state: Mutex<Bucket>,
}

impl RateLimiter {
    /// Limiter that admits everything immediately.
    pub fn unlimited() -> Self {
        Self::with_burst(0.0, 1)
    }

    pub fn with_burst(rps: f64, burst: u64) -> Self {
        let rate_milli = if rps.is_finite() && rps > 0.0 {
            ((rps * 1000.0).round() as u64).max(1)
        } else {
            0
        };
        let capacity = (burst.max(1) as i128) * SCALE;
        Self {
            rate_milli,
            capacity,
            state: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_milli == 0
    }

    /// Target rate in requests per second (0.0 when unlimited).
    pub fn rate(&self) -> f64 {
        self.rate_milli as f64 / 1000.0
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed_micros = now.saturating_duration_since(bucket.last_refill).as_micros() as i128;
        if elapsed_micros == 0 {
            return;
        }

        // rate_milli / 1000 tokens per second == rate_milli / 1000 scaled units per microsecond
        let to_add = (self.rate_milli as i128) * elapsed_micros / MILLI;
        bucket.tokens = bucket.tokens.saturating_add(to_add).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take one token without ever going into debt.
    pub fn try_acquire(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }

        let mut bucket = self.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= SCALE {
            bucket.tokens -= SCALE;
            true
        } else {
            false
        }
    }

    /// Reserve one token and report how long the caller must wait before
    /// using it. Never blocks.
    pub fn reserve(&self) -> Admission {
        if self.is_unlimited() {
            return Admission::Immediate;
        }

        let mut bucket = self.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens -= SCALE;
        if bucket.tokens >= 0 {
            return Admission::Immediate;
        }

        // deficit units / (rate_milli / 1000 units per micro), rounded up
        let deficit = -bucket.tokens;
        let rate = self.rate_milli as i128;
        let wait_micros = (deficit * MILLI + rate - 1) / rate;
        Admission::Delayed(Duration::from_micros(wait_micros as u64))
    }

    /// Wait until a token is available and acquire it.
    pub async fn admit(&self) -> Admission {
        let admission = self.reserve();
        if let Admission::Delayed(wait) = admission {
            sleep(wait).await;
        }
        admission
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        // The bucket holds plain integers, so a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
