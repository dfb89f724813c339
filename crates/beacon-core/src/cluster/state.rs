use chrono::{DateTime, Utc};

/// Outcome of the most recent TTL update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Success,
    Failure,
}

/// Observable state of the heartbeat loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    /// When the last update was attempted.
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Outcome of the last update, `None` before the first tick.
    pub last_outcome: Option<HeartbeatOutcome>,
    /// Failures since the last successful update.
    pub consecutive_failures: u32,
    /// Updates attempted since the loop started.
    pub total_attempts: u64,
}

impl HeartbeatState {
    /// Record a successful update.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_sent_at = Some(at);
        self.last_outcome = Some(HeartbeatOutcome::Success);
        self.consecutive_failures = 0;
        self.total_attempts += 1;
    }

    /// Record a failed update.
    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.last_sent_at = Some(at);
        self.last_outcome = Some(HeartbeatOutcome::Failure);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_attempts += 1;
    }

    pub fn is_healthy(&self) -> bool {
        self.last_outcome == Some(HeartbeatOutcome::Success)
    }
}

/// What a blocking query response did to the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStep {
    /// The index moved forward (or this was the first response).
    Advanced,
    /// Same index as before: the long poll timed out with no change.
    Unchanged,
    /// The index went backwards; the cursor was reset to zero.
    Regressed { previous: u64 },
}

/// Long-poll cursor of the membership watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchCursor {
    last_index: u64,
    last_modified: Option<DateTime<Utc>>,
    primed: bool,
}

impl WatchCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// Index to block on for the next query.
    ///
    /// A fresh or reset cursor asks with 0 (return immediately with the full
    /// set). Once a response has been seen the index is at least 1, so a
    /// backend reporting index 0 cannot turn the watch into a hot loop.
    pub fn wait_index(&self) -> u64 {
        if self.primed {
            self.last_index.max(1)
        } else {
            0
        }
    }

    /// Fold a response index into the cursor.
    pub fn observe(&mut self, index: u64, now: DateTime<Utc>) -> CursorStep {
        if self.primed && index < self.last_index {
            let previous = self.last_index;
            self.reset();
            return CursorStep::Regressed { previous };
        }

        if self.primed && index == self.last_index {
            return CursorStep::Unchanged;
        }

        self.last_index = index;
        self.last_modified = Some(now);
        self.primed = true;
        CursorStep::Advanced
    }

    /// Forget the last index so the next query fetches the full set.
    pub fn reset(&mut self) {
        self.last_index = 0;
        self.primed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_state_transitions() {
        let mut state = HeartbeatState::default();
        assert!(!state.is_healthy());

        state.record_failure(Utc::now());
        state.record_failure(Utc::now());
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_outcome, Some(HeartbeatOutcome::Failure));

        state.record_success(Utc::now());
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.total_attempts, 3);
        assert!(state.is_healthy());
    }

    #[test]
    fn test_cursor_advances_and_reuses_index() {
        let mut cursor = WatchCursor::new();
        assert_eq!(cursor.wait_index(), 0);

        assert_eq!(cursor.observe(0, Utc::now()), CursorStep::Advanced);
        assert_eq!(cursor.wait_index(), 1);

        assert_eq!(cursor.observe(5, Utc::now()), CursorStep::Advanced);
        assert_eq!(cursor.wait_index(), 5);

        assert_eq!(cursor.observe(5, Utc::now()), CursorStep::Unchanged);
        assert_eq!(cursor.wait_index(), 5);

        assert_eq!(cursor.observe(7, Utc::now()), CursorStep::Advanced);
        assert_eq!(cursor.last_index(), 7);
        assert!(cursor.last_modified().is_some());
    }

    #[test]
    fn test_cursor_regression_resets() {
        let mut cursor = WatchCursor::new();
        cursor.observe(40, Utc::now());

        assert_eq!(
            cursor.observe(3, Utc::now()),
            CursorStep::Regressed { previous: 40 }
        );
        assert_eq!(cursor.last_index(), 0);
        assert_eq!(cursor.wait_index(), 0);

        // The follow-up full fetch is accepted whatever its index.
        assert_eq!(cursor.observe(3, Utc::now()), CursorStep::Advanced);
        assert_eq!(cursor.wait_index(), 3);
    }
}
