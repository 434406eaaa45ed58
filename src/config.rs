use std::time::Duration;

/// Fabric configuration
///
/// Tunables shared by the demultiplexer, the view client and the storage
/// maintenance services. Values are validated for positivity only; there is
/// no cross-field validation.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Interval between manager-issued minimum-id probes
    pub ping_interval: Duration,

    /// Maximum number of simultaneously open log/state file writers
    pub max_open_files: usize,

    /// Log file size at which the storage layer rotates to a new LOG file
    pub max_log_file_bytes: u64,

    /// Per-channel reorder backlog ceiling; exceeding it breaks the channel
    pub max_backlog_bytes: usize,

    /// Interval between prune passes over a cache directory
    pub prune_interval: Duration,

    /// How many times a given unknown channel id is logged before the
    /// warnings for that id are suppressed
    pub unknown_channel_log_limit: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            max_open_files: 256,
            max_log_file_bytes: 10 * 1024 * 1024,
            max_backlog_bytes: 100 * 1024 * 1024,
            prune_interval: Duration::from_secs(60 * 10),
            unknown_channel_log_limit: 3,
        }
    }
}

impl FabricConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ping interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the open-file cap
    pub fn max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }

    /// Set the log rotation size
    pub fn max_log_file_bytes(mut self, bytes: u64) -> Self {
        self.max_log_file_bytes = bytes;
        self
    }

    /// Set the per-channel backlog ceiling
    pub fn max_backlog_bytes(mut self, bytes: usize) -> Self {
        self.max_backlog_bytes = bytes;
        self
    }

    /// Set the prune interval
    pub fn prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Set the unknown-channel log suppression threshold
    pub fn unknown_channel_log_limit(mut self, limit: u32) -> Self {
        self.unknown_channel_log_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ping_interval.is_zero() {
            return Err("ping_interval must be positive".to_string());
        }
        if self.max_open_files == 0 {
            return Err("max_open_files must be positive".to_string());
        }
        if self.max_log_file_bytes == 0 {
            return Err("max_log_file_bytes must be positive".to_string());
        }
        if self.max_backlog_bytes == 0 {
            return Err("max_backlog_bytes must be positive".to_string());
        }
        if self.prune_interval.is_zero() {
            return Err("prune_interval must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FabricConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = FabricConfig::new()
            .ping_interval(Duration::from_secs(1))
            .max_open_files(16)
            .max_backlog_bytes(1024);
        assert_eq!(config.max_open_files, 16);
        assert_eq!(config.max_backlog_bytes, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = FabricConfig::new().max_open_files(0);
        assert!(config.validate().is_err());
    }
}
