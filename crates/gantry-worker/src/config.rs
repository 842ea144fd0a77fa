//! Worker instance configuration.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Configuration for one worker instance.
///
/// Job-specific values arrive in the job envelope; this carries the
/// host-level settings and the defaults that apply when a job does not
/// override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance name, used in status reports and handed to the runner.
    pub name: String,
    /// Queue the instance consumes job descriptions from.
    pub queue_name: String,
    /// Host name included in status reports.
    pub host: String,
    /// Default maximum wall-clock for an entire job script.
    pub hard_limit: Duration,
    /// Default maximum gap with no log output before the runner kills the job.
    pub log_silence: Duration,
    /// Idle interval after an unclassified error before re-arming.
    pub cooldown: Duration,
    /// Grace given to the bus client to drain an in-flight delivery on unsubscribe.
    pub unsubscribe_grace: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: "worker-1".to_string(),
            queue_name: "builds".to_string(),
            host: "localhost".to_string(),
            hard_limit: Duration::from_secs(50 * 60),
            log_silence: Duration::from_secs(10 * 60),
            cooldown: Duration::from_secs(10),
            unsubscribe_grace: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = InstanceConfig::default();
        assert_eq!(config.queue_name, "builds");
        assert_eq!(config.hard_limit, Duration::from_secs(3000));
        assert_eq!(config.log_silence, Duration::from_secs(600));
        assert_eq!(config.cooldown, Duration::from_secs(10));
        assert_eq!(config.unsubscribe_grace, Duration::from_secs(2));
    }
}
