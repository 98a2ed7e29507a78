//! Engine limits and diagnostics switches

use std::env;

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Soft limit of changes per observer instance per cycle
    pub max_nr_of_changes: usize,
    /// Soft limit of changes across the universe per cycle
    pub max_total_nr_of_changes: usize,
    /// Maximum dependency set size of one observer instance
    pub max_nr_of_observed: usize,
    /// Maximum number of observer instances depending on one slot
    pub max_nr_of_observers: usize,
    /// Traces kept per observer instance
    pub max_trace_history: usize,
    /// Maximum runs rendered in a runaway diagnostic
    pub max_trace_render: usize,
    /// Log identity matching decisions
    pub trace_matching: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_nr_of_changes: 200,
            max_total_nr_of_changes: 20_000,
            max_nr_of_observed: 1_000,
            max_nr_of_observers: 1_000,
            max_trace_history: 32,
            max_trace_render: 64,
            trace_matching: false,
        }
    }
}

impl EngineConfig {
    /// Tight limits; runaway observers are caught early
    pub fn strict() -> Self {
        EngineConfig {
            max_nr_of_changes: 20,
            max_total_nr_of_changes: 2_000,
            max_nr_of_observed: 256,
            max_nr_of_observers: 256,
            ..Default::default()
        }
    }

    /// Large models with deep derivation chains
    pub fn relaxed() -> Self {
        EngineConfig {
            max_nr_of_changes: 1_000,
            max_total_nr_of_changes: 200_000,
            max_nr_of_observed: 10_000,
            max_nr_of_observers: 10_000,
            ..Default::default()
        }
    }

    /// Default limits with matching traces and longer trace history
    pub fn debugging() -> Self {
        EngineConfig {
            max_trace_history: 128,
            max_trace_render: 256,
            trace_matching: true,
            ..Default::default()
        }
    }

    /// Default configuration overlaid with `RIPPLE_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(flag) = read_var("RIPPLE_TRACE_MATCHING") {
            config.trace_matching = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(max) = read_var("RIPPLE_MAX_CHANGES").and_then(|v| v.parse().ok()) {
            config.max_nr_of_changes = max;
        }
        if let Some(max) = read_var("RIPPLE_MAX_TOTAL_CHANGES").and_then(|v| v.parse().ok()) {
            config.max_total_nr_of_changes = max;
        }
        config
    }

    pub fn with_max_changes(mut self, per_instance: usize, total: usize) -> Self {
        self.max_nr_of_changes = per_instance;
        self.max_total_nr_of_changes = total;
        self
    }
}

fn read_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_keep_ordering() {
        let strict = EngineConfig::strict();
        let default = EngineConfig::default();
        let relaxed = EngineConfig::relaxed();

        assert!(strict.max_nr_of_changes < default.max_nr_of_changes);
        assert!(default.max_nr_of_changes < relaxed.max_nr_of_changes);
        assert!(EngineConfig::debugging().trace_matching);
    }

    #[test]
    fn test_with_max_changes() {
        let config = EngineConfig::default().with_max_changes(5, 50);
        assert_eq!(config.max_nr_of_changes, 5);
        assert_eq!(config.max_total_nr_of_changes, 50);
    }
}
