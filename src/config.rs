//! Per-request tunables.
//!
//! Mirrors the teacher's `AgentConfig` shape (`default()` plus named
//! variants) but scoped to what the core itself owns: iteration/retry
//! caps, divergence-detector windows, and context/log/snapshot limits.
//! API keys and a persisted config file belong to the excluded transport
//! layer, not here.

use std::collections::HashSet;

/// Tunable constants for one agent run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_iterations: u32,
    pub max_retry_attempts: u32,

    pub doom_loop_window: usize,
    pub same_tool_loop_window: usize,
    pub failure_loop_window: usize,
    /// Smaller than `doom_loop_window` by default; `check_divergence` holds
    /// this off for one iteration when a doom/same-tool pattern is already
    /// forming, so identical-call loops report as `doom_loop`.
    pub no_progress_window: usize,
    pub mutation_failure_loop_window: usize,

    /// Tool names excluded from `same_tool_loop` (read-only tools).
    pub read_only_tools: HashSet<String>,

    /// Model context window size in tokens; 0 means unknown (always
    /// treated as having budget).
    pub context_window: u64,
    pub max_output: u64,

    pub agents_md_max_characters: usize,
    pub max_debug_logs: usize,
    pub max_snapshots: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            max_iterations: 10,
            max_retry_attempts: 5,
            doom_loop_window: 3,
            same_tool_loop_window: 5,
            failure_loop_window: 3,
            no_progress_window: 2,
            mutation_failure_loop_window: 2,
            read_only_tools: HashSet::new(),
            context_window: 0,
            max_output: 0,
            agents_md_max_characters: 4000,
            max_debug_logs: 20,
            max_snapshots: 10,
        }
    }
}

impl RunConfig {
    /// A config tuned for deep unattended runs: wider iteration budget,
    /// looser same-tool-loop tolerance.
    pub fn autonomous() -> Self {
        RunConfig {
            max_iterations: 25,
            same_tool_loop_window: 8,
            ..RunConfig::default()
        }
    }

    /// A config tuned for tight supervised runs: trips on divergence sooner.
    pub fn conservative() -> Self {
        RunConfig {
            max_iterations: 6,
            doom_loop_window: 2,
            same_tool_loop_window: 3,
            ..RunConfig::default()
        }
    }

    pub fn with_read_only_tools(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.read_only_tools = tools.into_iter().collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let c = RunConfig::default();
        assert_eq!(c.max_iterations, 10);
        assert_eq!(c.max_retry_attempts, 5);
        assert_eq!(c.doom_loop_window, 3);
        assert_eq!(c.same_tool_loop_window, 5);
        assert_eq!(c.failure_loop_window, 3);
        assert_eq!(c.no_progress_window, 2);
        assert_eq!(c.mutation_failure_loop_window, 2);
        assert_eq!(c.max_debug_logs, 20);
        assert_eq!(c.max_snapshots, 10);
    }

    #[test]
    fn autonomous_widens_iteration_budget() {
        assert!(RunConfig::autonomous().max_iterations > RunConfig::default().max_iterations);
    }

    #[test]
    fn conservative_tightens_doom_loop() {
        assert!(RunConfig::conservative().doom_loop_window < RunConfig::default().doom_loop_window);
    }
}
