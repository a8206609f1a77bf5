//! Per-message log throttling
//!
//! Long-running copy loops can emit the same warning thousands of times
//! (a busy writer keeps the page lock, the backup restarts). The throttle
//! dedupes by message text and lets each distinct message through at most
//! once per interval.

use std::time::{Duration, Instant};

use super::events::Event;
use super::logger::Logger;

/// Suppresses repeats of the same message within a fixed interval.
///
/// Not thread-safe; each copy loop owns its own throttle.
pub struct LogThrottle {
    interval: Duration,
    last_message: Option<String>,
    last_emit: Option<Instant>,
}

impl LogThrottle {
    /// Throttle to at most one emit of a given message per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_message: None,
            last_emit: None,
        }
    }

    /// Emit a WARN event unless the same message was emitted within the
    /// interval. A different message always resets the window.
    pub fn warn(&mut self, event: Event, message: &str, fields: &[(&str, &str)]) {
        if !self.should_emit(message) {
            return;
        }
        let mut all: Vec<(&str, &str)> = fields.to_vec();
        all.push(("message", message));
        Logger::warn(event, &all);
    }

    fn should_emit(&mut self, message: &str) -> bool {
        let now = Instant::now();
        let repeat = self.last_message.as_deref() == Some(message);
        if repeat {
            if let Some(last) = self.last_emit {
                if now.duration_since(last) < self.interval {
                    return false;
                }
            }
        }
        self.last_message = Some(message.to_string());
        self.last_emit = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_message_emits() {
        let mut throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_emit("database is locked"));
    }

    #[test]
    fn test_repeat_within_interval_suppressed() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_emit("database is locked"));
        assert!(!throttle.should_emit("database is locked"));
        assert!(!throttle.should_emit("database is locked"));
    }

    #[test]
    fn test_different_message_resets_window() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_emit("database is locked"));
        assert!(throttle.should_emit("backup restarted"));
        assert!(throttle.should_emit("database is locked"));
    }

    #[test]
    fn test_repeat_after_interval_emits() {
        let mut throttle = LogThrottle::new(Duration::from_millis(0));
        assert!(throttle.should_emit("database is locked"));
        assert!(throttle.should_emit("database is locked"));
    }
}
