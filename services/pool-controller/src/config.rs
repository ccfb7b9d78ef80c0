//! Configuration for the pool controller.

use anyhow::Result;

/// Pool controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the machine pool this controller owns.
    pub pool_name: String,

    /// Cluster the pool belongs to.
    pub cluster_name: String,

    /// Machine-pool resource name records correlate back to. Defaults to
    /// the pool name.
    pub machine_pool_name: String,

    /// Desired replica count for the development harness.
    pub desired_replicas: i64,

    /// Interval between reconcile passes, in seconds.
    pub reconcile_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let pool_name =
            std::env::var("VMFLEET_POOL_NAME").unwrap_or_else(|_| "pool0".to_string());

        let cluster_name =
            std::env::var("VMFLEET_CLUSTER_NAME").unwrap_or_else(|_| "dev".to_string());

        let machine_pool_name =
            std::env::var("VMFLEET_MACHINE_POOL_NAME").unwrap_or_else(|_| pool_name.clone());

        let desired_replicas = std::env::var("VMFLEET_DESIRED_REPLICAS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let reconcile_interval_secs = std::env::var("VMFLEET_RECONCILE_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let log_level = std::env::var("VMFLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            pool_name,
            cluster_name,
            machine_pool_name,
            desired_replicas,
            reconcile_interval_secs,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.reconcile_interval_secs, 30);
        assert_eq!(config.log_level, "info");
        assert!(!config.pool_name.is_empty());
        // Without an explicit machine-pool name, the pool name doubles up.
        assert_eq!(config.machine_pool_name, config.pool_name);
    }
}
