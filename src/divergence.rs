//! C5 — Divergence detector.
//!
//! Four independent tail-scan detectors over append-only rings: doom loops
//! (identical calls), same-tool loops, failure loops, stalled progress, and
//! interleaved mutation failures (spec.md §4.5). Every ring is a plain
//! bounded `Vec`, trimmed from the front on push — no dedicated ring-buffer
//! type, matching the tail-equality scan the wider pack converges on.

use crate::config::RunConfig;

/// One completed tool call, as recorded for detector purposes.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub name: String,
    pub arguments_json: String,
    pub success: bool,
    pub is_mutation: bool,
}

/// Whether a single iteration produced any file change, for `no_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationRecord {
    pub had_file_change: bool,
    pub had_mutation_failure: bool,
}

/// Caps how far any single ring grows; generous relative to the detector
/// windows so a long run doesn't force repeated reallocation.
const RING_CAP: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct DivergenceDetector {
    calls: Vec<CallRecord>,
    failures: Vec<CallRecord>,
    iterations: Vec<IterationRecord>,
}

impl DivergenceDetector {
    pub fn new() -> Self {
        DivergenceDetector::default()
    }

    /// Record one completed tool call.
    pub fn record_call(&mut self, call: CallRecord) {
        if !call.success {
            push_bounded(&mut self.failures, call.clone());
        }
        push_bounded(&mut self.calls, call);
    }

    /// Record the outcome of a whole iteration.
    pub fn record_iteration(&mut self, record: IterationRecord) {
        push_bounded(&mut self.iterations, record);
    }

    /// Total tool calls observed, including failures.
    pub fn length(&self) -> usize {
        self.calls.len()
    }

    pub fn reset(&mut self) {
        self.calls.clear();
        self.failures.clear();
        self.iterations.clear();
    }

    /// All identical `(name, arguments_json)` over the last `window` calls.
    pub fn doom_loop(&self, config: &RunConfig) -> Option<String> {
        let window = config.doom_loop_window;
        let tail = tail_slice(&self.calls, window)?;
        let first = &tail[0];
        let all_identical = tail
            .iter()
            .all(|c| c.name == first.name && c.arguments_json == first.arguments_json);
        all_identical.then(|| first.name.clone())
    }

    /// All of the last `window` calls share a tool name, excluding
    /// configured read-only tools.
    pub fn same_tool_loop(&self, config: &RunConfig) -> Option<String> {
        let window = config.same_tool_loop_window;
        let tail = tail_slice(&self.calls, window)?;
        if tail.iter().any(|c| config.read_only_tools.contains(&c.name)) {
            return None;
        }
        let first = &tail[0];
        tail.iter().all(|c| c.name == first.name).then(|| first.name.clone())
    }

    /// All of the last `window` *failures* (dedicated ring) share a name.
    pub fn failure_loop(&self, config: &RunConfig) -> Option<String> {
        let window = config.failure_loop_window;
        let tail = tail_slice(&self.failures, window)?;
        let first = &tail[0];
        tail.iter().all(|c| c.name == first.name).then(|| first.name.clone())
    }

    /// No iteration in the last `window` recorded a file change.
    pub fn no_progress(&self, config: &RunConfig) -> bool {
        let window = config.no_progress_window;
        match tail_slice(&self.iterations, window) {
            Some(tail) => tail.iter().all(|r| !r.had_file_change),
            None => false,
        }
    }

    /// Every iteration in the last `window` had at least one mutation-tool
    /// failure.
    pub fn mutation_failure_loop(&self, config: &RunConfig) -> bool {
        let window = config.mutation_failure_loop_window;
        match tail_slice(&self.iterations, window) {
            Some(tail) => tail.iter().all(|r| r.had_mutation_failure),
            None => false,
        }
    }

    /// Whether the calls tail is exactly one call short of satisfying
    /// `doom_loop`'s condition. Lets a caller hold off on a shorter-window
    /// iteration-based check (`no_progress`) for one more iteration so an
    /// identical-call loop is reported as `doom_loop` rather than preempted.
    pub fn doom_loop_imminent(&self, config: &RunConfig) -> bool {
        let lookback = config.doom_loop_window.saturating_sub(1);
        // A lookback below 2 would trivially match a single call against
        // itself — no real signal that a pattern is forming.
        if lookback < 2 {
            return false;
        }
        let Some(tail) = tail_slice(&self.calls, lookback) else { return false };
        let Some(first) = tail.first() else { return false };
        tail.iter().all(|c| c.name == first.name && c.arguments_json == first.arguments_json)
    }

    /// Same idea for `same_tool_loop`: the last `window - 1` calls already
    /// share a (non-read-only) tool name.
    pub fn same_tool_loop_imminent(&self, config: &RunConfig) -> bool {
        let lookback = config.same_tool_loop_window.saturating_sub(1);
        if lookback < 2 {
            return false;
        }
        let Some(tail) = tail_slice(&self.calls, lookback) else { return false };
        if tail.iter().any(|c| config.read_only_tools.contains(&c.name)) {
            return false;
        }
        let Some(first) = tail.first() else { return false };
        tail.iter().all(|c| c.name == first.name)
    }

    /// Whether the iterations tail is one iteration short of satisfying
    /// `mutation_failure_loop`'s condition. Unlike the identity-match
    /// detectors above, a single `had_mutation_failure = true` iteration is
    /// already a real signal, so (unlike `doom_loop_imminent`/
    /// `same_tool_loop_imminent`) a lookback of 1 is accepted.
    pub fn mutation_failure_loop_imminent(&self, config: &RunConfig) -> bool {
        let lookback = config.mutation_failure_loop_window.saturating_sub(1);
        if lookback < 1 {
            return false;
        }
        match tail_slice(&self.iterations, lookback) {
            Some(tail) => tail.iter().all(|r| r.had_mutation_failure),
            None => false,
        }
    }
}

/// The last `window` elements of `items`, or `None` if there are fewer than
/// `window` (below-threshold is always "not diverging").
fn tail_slice<T>(items: &[T], window: usize) -> Option<&[T]> {
    if window == 0 || items.len() < window {
        return None;
    }
    Some(&items[items.len() - window..])
}

fn push_bounded<T>(ring: &mut Vec<T>, item: T) {
    ring.push(item);
    if ring.len() > RING_CAP {
        ring.remove(0);
    }
}
