//! C7 — Token tracker.
//!
//! Additive per-turn counters for input, output, cache-read, and
//! cache-write tokens (spec.md §4.7), queried at end-of-run to emit a
//! `Custom { name: "usage", … }` event.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub turns: u64,
}

/// One turn's reported usage, as surfaced on a `RunFinished` payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TokenTracker {
    totals: UsageTotals,
}

impl TokenTracker {
    pub fn new() -> Self {
        TokenTracker::default()
    }

    pub fn record_turn(&mut self, usage: TurnUsage) {
        self.totals.input_tokens += usage.input_tokens;
        self.totals.output_tokens += usage.output_tokens;
        self.totals.cache_read_tokens += usage.cache_read_tokens;
        self.totals.cache_write_tokens += usage.cache_write_tokens;
        self.totals.turns += 1;
    }

    pub fn totals(&self) -> UsageTotals {
        self.totals
    }

    pub fn any_recorded(&self) -> bool {
        self.totals.turns > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_additive_across_turns() {
        let mut t = TokenTracker::new();
        t.record_turn(TurnUsage { input_tokens: 100, output_tokens: 50, cache_read_tokens: 0, cache_write_tokens: 0 });
        t.record_turn(TurnUsage { input_tokens: 200, output_tokens: 80, cache_read_tokens: 10, cache_write_tokens: 5 });
        let totals = t.totals();
        assert_eq!(totals.input_tokens, 300);
        assert_eq!(totals.output_tokens, 130);
        assert_eq!(totals.cache_read_tokens, 10);
        assert_eq!(totals.cache_write_tokens, 5);
        assert_eq!(totals.turns, 2);
    }

    #[test]
    fn fresh_tracker_has_no_recorded_turns() {
        assert!(!TokenTracker::new().any_recorded());
    }

    #[test]
    fn never_decreases() {
        let mut t = TokenTracker::new();
        t.record_turn(TurnUsage { input_tokens: 5, ..Default::default() });
        let before = t.totals().input_tokens;
        t.record_turn(TurnUsage::default());
        assert!(t.totals().input_tokens >= before);
    }
}
