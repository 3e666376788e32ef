//! per-rule cap on outbound notifications in a rolling one-hour window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub const WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Send,
    /// cap reached; `wait` is the time left until the window rolls over
    Suppress { wait: Duration },
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: u32,
    window_end: Instant,
}

pub struct NotificationRateLimiter {
    hourly_max: u32,
    windows: Mutex<HashMap<String, WindowState>>,
}

impl NotificationRateLimiter {
    pub fn new(hourly_max: u32) -> Self {
        Self { hourly_max, windows: Mutex::new(HashMap::new()) }
    }

    /// open a window for `rule_id` if it has none yet; window ends one hour from `now`
    pub fn register(&self, rule_id: &str, now: Instant) {
        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows
            .entry(rule_id.to_string())
            .or_insert(WindowState { count: 0, window_end: now + WINDOW });
    }

    /// forget windows of rules `keep` rejects
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows.retain(|id, _| keep(id));
    }

    /// decide whether a notification for `rule_id` may go out at `now`.
    /// the counter only moves when the answer is `Send`.
    pub fn check(&self, rule_id: &str, now: Instant) -> Decision {
        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = windows
            .entry(rule_id.to_string())
            .or_insert(WindowState { count: 0, window_end: now + WINDOW });

        if now >= state.window_end {
            state.count = 0;
            while state.window_end <= now {
                state.window_end += WINDOW;
            }
        }

        if state.count >= self.hourly_max {
            let wait = state.window_end.saturating_duration_since(now);
            tracing::debug!(
                rule = rule_id,
                sent = state.count,
                wait_secs = wait.as_secs(),
                "notification suppressed, hourly maximum reached"
            );
            return Decision::Suppress { wait };
        }

        state.count += 1;
        Decision::Send
    }

    #[cfg(test)]
    pub fn sent_in_window(&self, rule_id: &str) -> u32 {
        self.windows
            .lock()
            .map(|w| w.get(rule_id).map(|s| s.count).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fourth_within_ten_minutes_is_suppressed() {
        let limiter = NotificationRateLimiter::new(3);
        let start = Instant::now();
        limiter.register("r1", start);

        let decisions: Vec<_> = (0..4)
            .map(|i| limiter.check("r1", start + Duration::from_secs(150 * i)))
            .collect();

        let sent = decisions.iter().filter(|d| **d == Decision::Send).count();
        assert_eq!(sent, 3);
        // fourth at t=450s: 3150s left in the window
        assert_eq!(decisions[3], Decision::Suppress { wait: Duration::from_secs(3150) });
        assert_eq!(limiter.sent_in_window("r1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_over() {
        let limiter = NotificationRateLimiter::new(1);
        let start = Instant::now();
        limiter.register("r1", start);
        assert_eq!(limiter.check("r1", start), Decision::Send);
        assert!(matches!(limiter.check("r1", start + Duration::from_secs(10)), Decision::Suppress { .. }));
        assert_eq!(limiter.check("r1", start + WINDOW), Decision::Send);
        // a long gap skips whole windows instead of granting a burst
        assert_eq!(limiter.check("r1", start + WINDOW * 5 + Duration::from_secs(1)), Decision::Send);
        assert!(matches!(
            limiter.check("r1", start + WINDOW * 5 + Duration::from_secs(2)),
            Decision::Suppress { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rules_are_independent() {
        let limiter = NotificationRateLimiter::new(1);
        let now = Instant::now();
        assert_eq!(limiter.check("a", now), Decision::Send);
        assert_eq!(limiter.check("b", now), Decision::Send);
        assert!(matches!(limiter.check("a", now), Decision::Suppress { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cap_suppresses_everything() {
        let limiter = NotificationRateLimiter::new(0);
        assert!(matches!(limiter.check("a", Instant::now()), Decision::Suppress { .. }));
        assert_eq!(limiter.sent_in_window("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retain_forgets_removed_rules() {
        let limiter = NotificationRateLimiter::new(1);
        let now = Instant::now();
        assert_eq!(limiter.check("gone", now), Decision::Send);
        assert_eq!(limiter.check("kept", now), Decision::Send);

        limiter.retain(|id| id == "kept");
        assert_eq!(limiter.sent_in_window("gone"), 0);
        assert_eq!(limiter.sent_in_window("kept"), 1);
        // a rule that comes back starts with a fresh window
        assert_eq!(limiter.check("gone", now), Decision::Send);
        assert!(matches!(limiter.check("kept", now), Decision::Suppress { .. }));
    }
}
