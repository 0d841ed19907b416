use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Spaces calls evenly so at most `per_minute` start in any minute.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(per_minute: u32) -> Self {
        let interval = if per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / per_minute
        };
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Blocks until the caller may issue its request.
    pub fn acquire(&self) {
        let wait = self.reserve(Instant::now());
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }

    fn reserve(&self, now: Instant) -> Duration {
        let mut next = self.next_slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = match *next {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        *next = Some(slot + self.interval);
        slot - now
    }
}
