//! Wall-clock timestamps used as attempt anchors and in clip filenames

use chrono::{Local, TimeZone};
#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of millisecond timestamps.
///
/// Every anchor of an attempt (`startAt`, `stopAt`, `decisionAt`) comes from
/// the same clock so that trim offsets are differences on one timeline.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

/// The host clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Local::now().timestamp_millis()
    }
}

/// A clock that only moves when told to
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Format a timestamp the way final clip names carry it: `YYYY-MM-DD_HHhMMmSSs`
pub fn clip_timestamp(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(at) => at.format("%Y-%m-%d_%Hh%Mm%Ss").to_string(),
        None => Local::now().format("%Y-%m-%d_%Hh%Mm%Ss").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);
        clock.advance(6000);
        assert_eq!(clock.now_ms(), 7000);
        clock.set(42);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn test_clip_timestamp_shape() {
        let stamp = clip_timestamp(SystemClock.now_ms());
        // 2026-10-19_17h43m05s
        assert_eq!(stamp.len(), 20);
        assert_eq!(&stamp[10..11], "_");
        assert_eq!(&stamp[13..14], "h");
        assert_eq!(&stamp[16..17], "m");
        assert!(stamp.ends_with('s'));
    }
}
