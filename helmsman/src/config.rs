//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given values for election timeout min & max are invalid. Max must be greater than min.
    #[error("given values for election timeout min & max are invalid")]
    InvalidElectionTimeoutMinMax,

    /// The given value for max_payload_entries is too small, must be > 0.
    #[error("the given value for max_payload_entries is too small, must be > 0")]
    MaxPayloadEntriesTooSmall,

    /// The heartbeat interval must be smaller than the minimum election timeout.
    #[error("the heartbeat interval must be smaller than the minimum election timeout")]
    HeartbeatTooSlow,
}

/// Log compaction and snapshot policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

/// The runtime configuration for a Raft node.
///
/// The default values of this config are sensible for running tests against an in-process
/// transport. When running over a real network, the timing values should be tuned to the
/// network's latency profile; the election timeout should be at least an order of magnitude
/// greater than the expected one-way message latency.
///
/// Use [`Config::build`] to construct an instance:
///
/// ```
/// use helmsman::Config;
///
/// let config = Config::build("cluster".into())
///     .election_timeout_min(150)
///     .election_timeout_max(300)
///     .heartbeat_interval(50)
///     .validate()
///     .unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The heartbeat interval in milliseconds at which leaders will send heartbeats to followers.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: u64,
    /// The distance behind in log replication before the lagging pacing state is declared.
    pub replication_lag_threshold: u64,
    /// The snapshot policy to use for a Raft node.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum snapshot chunk size, in bytes, sent per InstallSnapshot RPC.
    pub snapshot_max_chunk_size: u64,
    /// The timeout in milliseconds for sending a single snapshot segment.
    pub install_snapshot_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            snapshot_policy: None,
            snapshot_max_chunk_size: None,
            install_snapshot_timeout: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
    snapshot_policy: Option<SnapshotPolicy>,
    snapshot_max_chunk_size: Option<u64>,
    install_snapshot_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `replication_lag_threshold`.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `snapshot_max_chunk_size`.
    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Validate the state of this builder, returning a new `Config` on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(150);
        let election_timeout_max = self.election_timeout_max.unwrap_or(300);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(50);
        let max_payload_entries = self.max_payload_entries.unwrap_or(300);
        let replication_lag_threshold = self.replication_lag_threshold.unwrap_or(1000);
        let snapshot_policy = self.snapshot_policy.unwrap_or(SnapshotPolicy::LogsSinceLast(5000));
        let snapshot_max_chunk_size = self.snapshot_max_chunk_size.unwrap_or(3 * 1024 * 1024);
        let install_snapshot_timeout = self.install_snapshot_timeout.unwrap_or(200);

        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        if heartbeat_interval >= election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow);
        }
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            replication_lag_threshold,
            snapshot_policy,
            snapshot_max_chunk_size,
            install_snapshot_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("default".into()).validate().unwrap();
        assert!(cfg.election_timeout_min < cfg.election_timeout_max);
        assert!(cfg.heartbeat_interval < cfg.election_timeout_min);
        assert_eq!(cfg.cluster_name, "default");
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_error() {
        let res = Config::build("test".into())
            .election_timeout_min(1000)
            .election_timeout_max(700)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeoutMinMax);
    }

    #[test]
    fn test_heartbeat_slower_than_election_timeout_produces_error() {
        let res = Config::build("test".into())
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(150)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::HeartbeatTooSlow);
    }

    #[test]
    fn test_rand_election_timeout_within_bounds() {
        let cfg = Config::build("test".into())
            .election_timeout_min(100)
            .election_timeout_max(200)
            .validate()
            .unwrap();
        for _ in 0..50 {
            let t = cfg.new_rand_election_timeout();
            assert!((100..200).contains(&t), "timeout {} out of range", t);
        }
    }
}
