//! Configuration for label propagation and the per-node affinity service.

use std::str::FromStr;
use std::time::Duration;

use affinity_graph::{BuilderKind, GraphConfig};

use crate::error::{Error, Result};
use crate::retry::IoRetry;

/// Allowed range for the group driver's update frequency, in seconds.
pub const UPDATE_FREQUENCY_SECS: std::ops::RangeInclusive<u64> = 5..=65535;

/// Default coordinator port.
pub const DEFAULT_SERVER_PORT: u16 = 44537;

/// Settings for one label propagation deployment.
#[derive(Debug, Clone)]
pub struct LpaConfig {
    /// Number of peer exchanges a participant runs concurrently.
    pub num_threads: usize,

    /// Iteration bound for one run.
    pub max_iterations: u32,

    /// How long the coordinator waits for a stage barrier.
    pub stage_timeout: Duration,

    /// Retry policy for remote calls.
    pub retry: IoRetry,

    /// Port the coordinator endpoint is exported on. Only the export layer
    /// that puts [`LpaServer`](crate::LpaServer) on the network reads it;
    /// in-process clusters carry it through validation and startup logs.
    pub server_port: u16,
}

impl Default for LpaConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            max_iterations: 10,
            stage_timeout: Duration::from_secs(60),
            retry: IoRetry::default(),
            server_port: DEFAULT_SERVER_PORT,
        }
    }
}

impl LpaConfig {
    #[must_use]
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: IoRetry) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::InvalidConfig("num_threads must be at least 1".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfig("max_iterations must be at least 1".to_string()));
        }
        if self.stage_timeout.is_zero() {
            return Err(Error::InvalidConfig("stage timeout must be positive".to_string()));
        }
        if self.server_port == 0 {
            return Err(Error::InvalidConfig("server port must be in 1..=65535".to_string()));
        }
        self.retry.validate()
    }
}

/// Everything a node needs to run the affinity subsystem.
#[derive(Debug, Clone)]
pub struct AffinityConfig {
    /// Builder strategy, or `None` to run without the subsystem.
    pub builder: Option<BuilderKind>,

    pub graph: GraphConfig,

    /// How often the driver asks for fresh groups.
    pub update_frequency: Duration,

    pub lpa: LpaConfig,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            builder: Some(BuilderKind::Weighted),
            graph: GraphConfig::default(),
            update_frequency: Duration::from_secs(60),
            lpa: LpaConfig::default(),
        }
    }
}

impl AffinityConfig {
    #[must_use]
    pub fn with_builder(mut self, builder: Option<BuilderKind>) -> Self {
        self.builder = builder;
        self
    }

    #[must_use]
    pub fn with_graph(mut self, graph: GraphConfig) -> Self {
        self.graph = graph;
        self
    }

    #[must_use]
    pub fn with_update_frequency(mut self, frequency: Duration) -> Self {
        self.update_frequency = frequency;
        self
    }

    #[must_use]
    pub fn with_lpa(mut self, lpa: LpaConfig) -> Self {
        self.lpa = lpa;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.graph.validate()?;
        validate_update_frequency(self.update_frequency)?;
        self.lpa.validate()
    }

    /// Read `AFFINITY_*` variables from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, falling back to defaults for missing
    /// keys. Values that are present but unparseable are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let builder = match lookup("AFFINITY_BUILDER") {
            None => defaults.builder,
            Some(value) if value.trim().eq_ignore_ascii_case("none") => None,
            Some(value) => Some(value.parse::<BuilderKind>()?),
        };

        let graph = GraphConfig::default()
            .with_snapshot_period(
                parse(&lookup, "AFFINITY_SNAPSHOT_PERIOD_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.graph.snapshot_period),
            )
            .with_period_count(
                parse(&lookup, "AFFINITY_PERIOD_COUNT")?.unwrap_or(defaults.graph.period_count),
            );

        let update_frequency = parse(&lookup, "AFFINITY_UPDATE_FREQ_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.update_frequency);

        let retry = IoRetry::new(
            parse(&lookup, "AFFINITY_IO_RETRIES")?.unwrap_or(defaults.lpa.retry.max_attempts),
            parse(&lookup, "AFFINITY_IO_RETRY_WAIT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.lpa.retry.wait),
        );

        let lpa = LpaConfig {
            num_threads: parse(&lookup, "AFFINITY_NUM_THREADS")?.unwrap_or(defaults.lpa.num_threads),
            max_iterations: parse(&lookup, "AFFINITY_MAX_ITERATIONS")?
                .unwrap_or(defaults.lpa.max_iterations),
            stage_timeout: parse(&lookup, "AFFINITY_STAGE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.lpa.stage_timeout),
            retry,
            server_port: parse(&lookup, "AFFINITY_SERVER_PORT")?.unwrap_or(defaults.lpa.server_port),
        };

        let config = Self {
            builder,
            graph,
            update_frequency,
            lpa,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Check the driver frequency against [`UPDATE_FREQUENCY_SECS`].
pub fn validate_update_frequency(frequency: Duration) -> Result<()> {
    let secs = frequency.as_secs();
    if frequency.subsec_nanos() != 0 || !UPDATE_FREQUENCY_SECS.contains(&secs) {
        return Err(Error::InvalidConfig(format!(
            "update frequency {frequency:?} outside {}..={} seconds",
            UPDATE_FREQUENCY_SECS.start(),
            UPDATE_FREQUENCY_SECS.end()
        )));
    }
    Ok(())
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{key}={raw:?} is not a valid value"))),
    }
}
