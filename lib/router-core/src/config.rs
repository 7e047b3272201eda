use std::time::Duration;

/// Quiet period before a burst of change notifications is reconciled
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
/// Attempts of one reconcile pass before it is abandoned
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Generator settings
#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    /// Quiet period of the debouncer
    pub debounce: Duration,
    /// Immediate retries of a failed pass, first attempt included
    pub max_attempts: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}
