//! Per-token sliding-window rate limiting, fixed-window variant.
//!
//! One counter per (token jti, endpoint class). A window resets wholesale
//! once it's older than 60s rather than sliding continuously — cheap and
//! matches the per-minute caps in the design closely enough in practice.

use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

const WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy)]
pub enum EndpointClass {
    SubmitFlash,
    SubmitOther,
    Read,
}

struct Bucket {
    count: u32,
    window_start_ms: u64,
}

pub struct RateLimiter {
    flash: DashMap<String, Bucket>,
    other: DashMap<String, Bucket>,
    reads: DashMap<String, Bucket>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            flash: DashMap::new(),
            other: DashMap::new(),
            reads: DashMap::new(),
        }
    }

    /// Returns `true` if the request is within the per-key limit for
    /// `class`, recording the attempt either way.
    pub fn check(&self, class: EndpointClass, key: &str, max: u32) -> bool {
        let table = match class {
            EndpointClass::SubmitFlash => &self.flash,
            EndpointClass::SubmitOther => &self.other,
            EndpointClass::Read => &self.reads,
        };
        let now = now_ms();
        let mut entry = table.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_start_ms: now,
        });

        if now - entry.window_start_ms > WINDOW_MS {
            entry.count = 1;
            entry.window_start_ms = now;
            true
        } else if entry.count < max {
            entry.count += 1;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_blocks() {
        let rl = RateLimiter::new();
        for _ in 0..3 {
            assert!(rl.check(EndpointClass::Read, "tok-1", 3));
        }
        assert!(!rl.check(EndpointClass::Read, "tok-1", 3));
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimiter::new();
        assert!(rl.check(EndpointClass::SubmitFlash, "tok-a", 1));
        assert!(rl.check(EndpointClass::SubmitFlash, "tok-b", 1));
        assert!(!rl.check(EndpointClass::SubmitFlash, "tok-a", 1));
    }
}
