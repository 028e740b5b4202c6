// ============================================================================
// spark-compose - Runtime Configuration
// ============================================================================

use crate::core::constants::DEFAULT_MAX_FLUSH_PASSES;
use crate::core::context::with_context;

/// Per-thread runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Passes a single flush may run before it is reported as a runaway update.
    pub max_flush_passes: u32,
    /// Isolate panicking node functions instead of unwinding through `flush`.
    pub catch_node_panics: bool,
    /// Emit a warning for every read of a cell whose owner is gone.
    pub log_stale_reads: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_flush_passes: DEFAULT_MAX_FLUSH_PASSES,
            catch_node_panics: true,
            log_stale_reads: true,
        }
    }
}

impl RuntimeConfig {
    /// Set the pass cap. Zero is clamped to one.
    #[must_use]
    pub fn with_max_flush_passes(mut self, passes: u32) -> Self {
        self.max_flush_passes = passes.max(1);
        self
    }

    /// Toggle panic isolation for node functions.
    #[must_use]
    pub fn with_catch_node_panics(mut self, enabled: bool) -> Self {
        self.catch_node_panics = enabled;
        self
    }

    /// Toggle stale-read warnings.
    #[must_use]
    pub fn with_log_stale_reads(mut self, enabled: bool) -> Self {
        self.log_stale_reads = enabled;
        self
    }
}

/// Install `config` for the current thread, returning the previous one.
pub fn configure(config: RuntimeConfig) -> RuntimeConfig {
    with_context(|ctx| ctx.set_config(config))
}

/// The configuration active on the current thread.
pub fn config() -> RuntimeConfig {
    with_context(|ctx| ctx.config())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_flush_passes, DEFAULT_MAX_FLUSH_PASSES);
        assert!(config.catch_node_panics);
        assert!(config.log_stale_reads);
    }

    #[test]
    fn builders_and_clamp() {
        let config = RuntimeConfig::default()
            .with_max_flush_passes(0)
            .with_catch_node_panics(false)
            .with_log_stale_reads(false);
        assert_eq!(config.max_flush_passes, 1);
        assert!(!config.catch_node_panics);
        assert!(!config.log_stale_reads);
    }

    #[test]
    fn configure_is_per_thread() {
        let previous = configure(RuntimeConfig::default().with_max_flush_passes(8));
        assert_eq!(previous, RuntimeConfig::default());
        assert_eq!(config().max_flush_passes, 8);

        std::thread::spawn(|| {
            assert_eq!(config().max_flush_passes, DEFAULT_MAX_FLUSH_PASSES);
        })
        .join()
        .unwrap();
    }
}
