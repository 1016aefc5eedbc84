//! Configuration types for the diagnostics agent

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `TICKSCOPE__AUTO_SAMPLER__BACKOFF_SECS=30`
const ENV_PREFIX: &str = "TICKSCOPE";

/// How sampled threads are grouped into profile nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadGrouping {
    /// One node per thread name
    ByName,
    /// Threads of the same pool (name minus trailing `-N`/`#N`) share a node
    ByPool,
    /// All threads merged into a single node
    AsOne,
}

impl std::str::FromStr for ThreadGrouping {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "by-name" | "name" => Ok(ThreadGrouping::ByName),
            "by-pool" | "pool" => Ok(ThreadGrouping::ByPool),
            "as-one" | "one" => Ok(ThreadGrouping::AsOne),
            _ => anyhow::bail!("Invalid thread grouping: {}", s),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub statistics: StatisticsConfig,
    pub auto_sampler: AutoSamplerConfig,
    pub reporting: ReportingConfig,
}

/// Rolling tick-rate statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Expected ticks per second of the host
    pub nominal_tps: u32,

    /// Only every Nth tick is timed
    pub sample_interval_ticks: u64,

    /// Rolling window lengths in seconds, shortest first
    pub windows_secs: Vec<u64>,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            nominal_tps: 20,
            sample_interval_ticks: 20,
            windows_secs: vec![5, 10, 60, 5 * 60, 15 * 60],
        }
    }
}

impl StatisticsConfig {
    /// Number of decimated samples that cover `window_secs` at nominal cadence
    pub fn window_capacity(&self, window_secs: u64) -> usize {
        let per_sample = self.sample_interval_ticks.max(1);
        let samples = window_secs * u64::from(self.nominal_tps) / per_sample;
        samples.max(1) as usize
    }

    /// Nominal wall time between two decimated samples
    pub fn nominal_sample_nanos(&self) -> u64 {
        if self.nominal_tps == 0 {
            return 0;
        }
        self.sample_interval_ticks * 1_000_000_000 / u64::from(self.nominal_tps)
    }
}

/// Automatic sampler thresholds and session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSamplerConfig {
    pub enabled: bool,

    /// Ticks ignored after boot while the host stabilizes
    pub warmup_ticks: u64,

    /// A tick gap at or above this is "late"
    pub late_tick_ms: u64,

    /// Consecutive on-time ticks that declare recovery
    pub stable_ticks_threshold: u32,

    /// Short-term average below which sampling starts, above which it may stop
    pub avg_tps_threshold: f64,

    /// Minimum idle time after a session before another may start
    pub backoff_secs: u64,

    /// Sessions complete on their own after this long
    pub max_duration_secs: u64,

    /// Stack sampling resolution in microseconds
    pub sampling_interval_us: u64,

    pub thread_grouping: ThreadGrouping,

    pub ignore_sleeping: bool,

    /// Comment attached to automatic reports
    pub comment: String,
}

impl Default for AutoSamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warmup_ticks: 20 * 10,
            late_tick_ms: 200,
            stable_ticks_threshold: 2,
            avg_tps_threshold: 19.5,
            backoff_secs: 10,
            max_duration_secs: 60,
            sampling_interval_us: 100,
            thread_grouping: ThreadGrouping::ByPool,
            ignore_sleeping: false,
            comment: "AutoSampler".to_string(),
        }
    }
}

impl AutoSamplerConfig {
    pub fn late_tick(&self) -> Duration {
        Duration::from_millis(self.late_tick_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_micros(self.sampling_interval_us)
    }
}

/// Upload and dashboard annotation endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Content store that accepts report uploads
    pub content_store_url: String,

    /// Prefix that turns an upload key into a shareable link
    pub viewer_url: String,

    pub user_agent: String,

    pub upload_attempts: u32,

    /// Dashboard annotations are only created when this is present
    pub grafana: Option<GrafanaConfig>,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            content_store_url: "https://bytebin.lucko.me".to_string(),
            viewer_url: "https://spark.lucko.me/#".to_string(),
            user_agent: concat!("tickscope/", env!("CARGO_PKG_VERSION")).to_string(),
            upload_attempts: 3,
            grafana: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrafanaConfig {
    pub url: String,

    /// Identifies this host in annotation tags (defaults to the host name)
    #[serde(default)]
    pub server_id: Option<String>,

    #[serde(default = "default_auth_email")]
    pub auth_email: String,
}

fn default_auth_email() -> String {
    "tickscope".to_string()
}

impl AgentConfig {
    /// Load configuration from an optional file, overlaid with `TICKSCOPE__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: AgentConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let stats = &self.statistics;
        if stats.nominal_tps == 0 {
            return Err(invalid("nominal_tps must be greater than 0"));
        }
        if stats.sample_interval_ticks == 0 {
            return Err(invalid("sample_interval_ticks must be greater than 0"));
        }
        if stats.windows_secs.is_empty() {
            return Err(invalid("at least one statistics window is required"));
        }
        if stats.windows_secs.iter().any(|&w| w == 0) {
            return Err(invalid("statistics windows must be longer than 0s"));
        }

        let auto = &self.auto_sampler;
        if auto.late_tick_ms == 0 {
            return Err(invalid("late_tick_ms must be greater than 0"));
        }
        if auto.max_duration_secs == 0 {
            return Err(invalid("max_duration_secs must be greater than 0"));
        }
        if auto.sampling_interval_us == 0 {
            return Err(invalid("sampling_interval_us must be greater than 0"));
        }
        if auto.avg_tps_threshold.is_nan() || auto.avg_tps_threshold <= 0.0 {
            return Err(invalid("avg_tps_threshold must be positive"));
        }

        if self.reporting.upload_attempts == 0 {
            return Err(invalid("upload_attempts must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> AgentError {
    AgentError::InvalidConfig(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_nominal_cadence() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.statistics.windows_secs, vec![5, 10, 60, 300, 900]);
        assert_eq!(config.auto_sampler.warmup_ticks, 200);
        assert_eq!(config.auto_sampler.late_tick(), Duration::from_millis(200));
        assert_eq!(config.auto_sampler.backoff(), Duration::from_secs(10));
        assert_eq!(config.auto_sampler.max_duration(), Duration::from_secs(60));
        assert!(config.reporting.grafana.is_none());
    }

    #[test]
    fn test_window_capacity() {
        let stats = StatisticsConfig::default();
        assert_eq!(stats.window_capacity(5), 5);
        assert_eq!(stats.window_capacity(900), 900);
        assert_eq!(stats.nominal_sample_nanos(), 1_000_000_000);

        let coarse = StatisticsConfig {
            sample_interval_ticks: 40,
            ..StatisticsConfig::default()
        };
        assert_eq!(coarse.window_capacity(5), 2);
        assert_eq!(coarse.window_capacity(1), 1);
        assert_eq!(coarse.nominal_sample_nanos(), 2_000_000_000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AgentConfig::default();
        config.statistics.windows_secs.clear();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.statistics.sample_interval_ticks = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.auto_sampler.max_duration_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.auto_sampler.avg_tps_threshold = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thread_grouping_from_str() {
        assert_eq!("pool".parse::<ThreadGrouping>().unwrap(), ThreadGrouping::ByPool);
        assert_eq!("AS-ONE".parse::<ThreadGrouping>().unwrap(), ThreadGrouping::AsOne);
        assert!("threads".parse::<ThreadGrouping>().is_err());
    }

    #[test]
    fn test_load_from_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[auto_sampler]
backoff_secs = 30
thread_grouping = "by-name"

[reporting.grafana]
url = "http://grafana.local"
server_id = "lobby-1"
"#
        )
        .unwrap();

        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.auto_sampler.backoff_secs, 30);
        assert_eq!(config.auto_sampler.thread_grouping, ThreadGrouping::ByName);
        assert_eq!(config.auto_sampler.late_tick_ms, 200);
        assert_eq!(config.statistics.nominal_tps, 20);

        let grafana = config.reporting.grafana.unwrap();
        assert_eq!(grafana.server_id.as_deref(), Some("lobby-1"));
        assert_eq!(grafana.auth_email, "tickscope");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[statistics]\nnominal_tps = 0").unwrap();
        assert!(AgentConfig::load(Some(file.path())).is_err());
    }
}
