//! The single in-memory record of the attempt being recorded

use super::AttemptId;

/// Timing anchors of the current attempt.
///
/// `stop_at` is set by the first clock stop only. Later stops during a
/// no-lift bounce are counted but leave the anchor where it was.
#[derive(Debug, Clone, Default)]
pub struct AttemptState {
    id: Option<AttemptId>,
    start_at: i64,
    stop_at: i64,
    decision_at: i64,
    stop_request_count: u32,
}

/// Immutable copy taken when an attempt is finalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSnapshot {
    pub id: Option<AttemptId>,
    pub start_at: i64,
    pub stop_at: i64,
    pub decision_at: i64,
    pub stop_request_count: u32,
}

impl AttemptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record wholesale for a new attempt
    pub fn on_start(&mut self, id: AttemptId, now_ms: i64) {
        *self = Self {
            id: Some(id),
            start_at: now_ms,
            stop_at: 0,
            decision_at: 0,
            stop_request_count: 0,
        };
    }

    /// Count a clock stop; only the first one moves the anchor
    pub fn on_stop_tick(&mut self, now_ms: i64) {
        self.stop_request_count += 1;
        if self.stop_request_count == 1 {
            self.stop_at = now_ms;
        }
    }

    /// Last decision wins
    pub fn on_decision(&mut self, now_ms: i64) {
        self.decision_at = now_ms;
    }

    pub fn snapshot(&self) -> AttemptSnapshot {
        AttemptSnapshot {
            id: self.id.clone(),
            start_at: self.start_at,
            stop_at: self.stop_at,
            decision_at: self.decision_at,
            stop_request_count: self.stop_request_count,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn id(&self) -> Option<&AttemptId> {
        self.id.as_ref()
    }

    pub fn stop_at(&self) -> i64 {
        self.stop_at
    }

    pub fn stop_request_count(&self) -> u32 {
        self.stop_request_count
    }
}

impl AttemptSnapshot {
    /// Offset into the working file where the published clip begins.
    ///
    /// Keeps `lead_ms` of preparation before the clock stopped. `None` means
    /// no start anchor was seen and the file is published untrimmed.
    pub fn trim_offset_ms(&self, lead_ms: i64) -> Option<i64> {
        if self.start_at == 0 {
            return None;
        }
        Some((self.stop_at - self.start_at - lead_ms).max(0))
    }
}
