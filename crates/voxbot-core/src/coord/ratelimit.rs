use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

const WINDOW_MS: u64 = 3_600_000;
const MIN_RETRY_AFTER_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitReason {
    BotCap,
    GlobalCap,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::BotCap => "BOT_CAP",
            RateLimitReason::GlobalCap => "GLOBAL_CAP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<RateLimitReason>,
    pub retry_after_ms: Option<u64>,
}

impl RateDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_ms: None,
        }
    }

    fn denied(reason: RateLimitReason, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_ms: Some(retry_after_ms.max(MIN_RETRY_AFTER_MS)),
        }
    }
}

/// Rolling-hour sliding windows: one per bot plus a global one.
///
/// Admission is atomic: the per-bot cap is evaluated first, then the global
/// cap, and no timestamp is recorded on denial. Pruning is lazy on every
/// consume/count.
#[derive(Debug)]
pub struct RateLimiter {
    per_bot_cap: u32,
    global_cap: u32,
    per_bot: BTreeMap<String, VecDeque<u64>>,
    global: VecDeque<u64>,
}

impl RateLimiter {
    pub fn new(per_bot_cap: u32, global_cap: u32) -> Self {
        Self {
            per_bot_cap,
            global_cap,
            per_bot: BTreeMap::new(),
            global: VecDeque::new(),
        }
    }

    pub fn consume(&mut self, bot_id: &str, now_ms: u64) -> RateDecision {
        self.prune(now_ms);

        let bot_window = self.per_bot.entry(bot_id.to_string()).or_default();
        if bot_window.len() as u32 >= self.per_bot_cap {
            let retry = retry_after(bot_window.front().copied(), now_ms);
            return RateDecision::denied(RateLimitReason::BotCap, retry);
        }
        if self.global.len() as u32 >= self.global_cap {
            let retry = retry_after(self.global.front().copied(), now_ms);
            return RateDecision::denied(RateLimitReason::GlobalCap, retry);
        }

        bot_window.push_back(now_ms);
        self.global.push_back(now_ms);
        RateDecision::allowed()
    }

    /// Calls remaining in the current window, after pruning. `None` counts
    /// the global window.
    pub fn calls_in_last_hour(&mut self, bot_id: Option<&str>, now_ms: u64) -> usize {
        self.prune(now_ms);
        match bot_id {
            Some(id) => self.per_bot.get(id).map(VecDeque::len).unwrap_or(0),
            None => self.global.len(),
        }
    }

    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(WINDOW_MS);
        while self.global.front().is_some_and(|ts| *ts <= cutoff) {
            self.global.pop_front();
        }
        for window in self.per_bot.values_mut() {
            while window.front().is_some_and(|ts| *ts <= cutoff) {
                window.pop_front();
            }
        }
        self.per_bot.retain(|_, w| !w.is_empty());
    }
}

fn retry_after(earliest: Option<u64>, now_ms: u64) -> u64 {
    earliest
        .map(|ts| (ts + WINDOW_MS).saturating_sub(now_ms))
        .unwrap_or(MIN_RETRY_AFTER_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_cap_denies_at_boundary() {
        let mut rl = RateLimiter::new(2, 100);
        assert!(rl.consume("a", 1_000).allowed);
        assert!(rl.consume("a", 2_000).allowed);
        let denied = rl.consume("a", 3_000);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(RateLimitReason::BotCap));
        assert!(denied.retry_after_ms.unwrap() >= 1_000);
    }

    #[test]
    fn denial_records_no_timestamp() {
        let mut rl = RateLimiter::new(1, 100);
        assert!(rl.consume("a", 1_000).allowed);
        assert!(!rl.consume("a", 2_000).allowed);
        assert_eq!(rl.calls_in_last_hour(Some("a"), 2_000), 1);
        assert_eq!(rl.calls_in_last_hour(None, 2_000), 1);
    }

    #[test]
    fn global_cap_applies_across_bots() {
        let mut rl = RateLimiter::new(10, 2);
        assert!(rl.consume("a", 1_000).allowed);
        assert!(rl.consume("b", 2_000).allowed);
        let denied = rl.consume("c", 3_000);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(RateLimitReason::GlobalCap));
    }

    #[test]
    fn per_bot_cap_checked_before_global() {
        let mut rl = RateLimiter::new(1, 1);
        assert!(rl.consume("a", 1_000).allowed);
        let denied = rl.consume("a", 2_000);
        assert_eq!(denied.reason, Some(RateLimitReason::BotCap));
    }

    #[test]
    fn window_slides_after_an_hour() {
        let mut rl = RateLimiter::new(1, 100);
        assert!(rl.consume("a", 1_000).allowed);
        assert!(!rl.consume("a", 1_500).allowed);
        // The entry at t=1000 ages out at t=1000+3600s.
        assert!(rl.consume("a", 1_000 + 3_600_000 + 1).allowed);
    }

    #[test]
    fn retry_after_reflects_earliest_entry() {
        let mut rl = RateLimiter::new(1, 100);
        assert!(rl.consume("a", 10_000).allowed);
        let denied = rl.consume("a", 20_000);
        assert_eq!(denied.retry_after_ms, Some(10_000 + 3_600_000 - 20_000));
    }

    #[test]
    fn cap_holds_for_any_window_position() {
        let mut rl = RateLimiter::new(3, 100);
        let mut allowed = 0;
        for i in 0..10u64 {
            if rl.consume("a", 1_000 + i * 60_000).allowed {
                allowed += 1;
            }
        }
        // Only three admits fit inside one rolling hour.
        assert_eq!(allowed, 3);
    }
}
