//! TOML service configuration.
//!
//! Every field has a default, so an empty file (or no file) yields a working
//! service. Durations are integer `*_ms` / `*_secs` fields.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1"
//! port = 8890
//!
//! [tuning]
//! auto_suggest_threshold = 0.6
//! retention_days = 30
//!
//! [gateway]
//! heartbeat_interval_secs = 30
//!
//! [logging]
//! filter = "knob_tuner=debug,info"
//!
//! [[knobs]]
//! module = "fiscal"
//! name = "spendingCap"
//! default = 0.4
//! min = 0.0
//! max = 1.0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::error::{TuneError, TuneResult};
use crate::gateway::session::GatewayConfig;
use crate::tuning::learning::LearningConfig;
use crate::tuning::orchestrator::OrchestratorConfig;
use crate::tuning::registry::KnobDescriptor;
use crate::tuning::telemetry::TelemetryConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub tuning: TuningSection,
    pub gateway: GatewaySection,
    pub logging: LoggingSection,
    /// Extra knobs appended to the built-in catalog.
    pub knobs: Vec<KnobDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    pub builtin_knobs: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { bind: "127.0.0.1".into(), port: 8890, builtin_knobs: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningSection {
    pub auto_suggest_threshold: f64,
    pub analyze_deadline_ms: u64,
    pub maintenance_interval_secs: u64,
    pub retention_days: u32,
    pub effectiveness_lookback_secs: u64,
    pub effectiveness_half_life_secs: u64,
    pub confidence_k: f64,
    pub recompute_deadline_ms: u64,
    pub learning_lookback_secs: u64,
    pub max_observations: usize,
    pub min_pattern_samples: u64,
    pub pattern_decay_after_secs: u64,
    pub pattern_retention_secs: u64,
    pub suggestion_ttl_secs: u64,
    pub generation_deadline_ms: u64,
    pub correlation_window_secs: u64,
}

impl Default for TuningSection {
    fn default() -> Self {
        let orc = OrchestratorConfig::default();
        let t = &orc.telemetry;
        let l = &orc.learning;
        Self {
            auto_suggest_threshold: orc.auto_suggest_threshold,
            analyze_deadline_ms: orc.analyze_deadline.as_millis() as u64,
            maintenance_interval_secs: orc.maintenance_interval.as_secs(),
            retention_days: orc.retention_days,
            effectiveness_lookback_secs: t.lookback.as_secs(),
            effectiveness_half_life_secs: t.half_life.as_secs(),
            confidence_k: t.confidence_k,
            recompute_deadline_ms: t.recompute_deadline.as_millis() as u64,
            learning_lookback_secs: l.lookback.as_secs(),
            max_observations: l.max_observations,
            min_pattern_samples: l.min_pattern_samples,
            pattern_decay_after_secs: l.decay_after.as_secs(),
            pattern_retention_secs: l.pattern_retention.as_secs(),
            suggestion_ttl_secs: l.suggestion_ttl.as_secs(),
            generation_deadline_ms: l.generation_deadline.as_millis() as u64,
            correlation_window_secs: l.correlation_window.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
    pub stale_after_secs: u64,
    pub request_timeout_ms: u64,
    pub push_confidence: f64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let g = GatewayConfig::default();
        Self {
            queue_capacity: g.queue_capacity,
            heartbeat_interval_secs: g.heartbeat_interval.as_secs(),
            stale_after_secs: g.stale_after.as_secs(),
            request_timeout_ms: g.request_timeout.as_millis() as u64,
            push_confidence: g.push_confidence,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `tracing_subscriber::EnvFilter` directive. `RUST_LOG` takes precedence.
    pub filter: Option<String>,
}

impl AppConfig {
    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> TuneResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TuneError::Config(format!("reading {}: {e}", path.display())))?;
        let config = Self::parse(&text)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn parse(text: &str) -> TuneResult<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the `--config` file if given, then CLI overrides.
    pub fn resolve(cli: &Cli) -> TuneResult<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bind) = &cli.bind {
            self.server.bind = bind.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(filter) = &cli.log_filter {
            self.logging.filter = Some(filter.clone());
        }
        if cli.no_builtin_knobs {
            self.server.builtin_knobs = false;
        }
    }

    fn validate(&self) -> TuneResult<()> {
        let t = &self.tuning;
        if !(0.0..=1.0).contains(&t.auto_suggest_threshold) {
            return Err(TuneError::Config(format!(
                "tuning.auto_suggest_threshold must be within [0, 1], got {}",
                t.auto_suggest_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.gateway.push_confidence) {
            return Err(TuneError::Config(format!(
                "gateway.push_confidence must be within [0, 1], got {}",
                self.gateway.push_confidence
            )));
        }
        if t.confidence_k <= 0.0 {
            return Err(TuneError::Config("tuning.confidence_k must be positive".into()));
        }
        if self.gateway.heartbeat_interval_secs == 0 || self.gateway.stale_after_secs == 0 {
            return Err(TuneError::Config("gateway intervals must be non-zero".into()));
        }
        for knob in &self.knobs {
            knob.validate()
                .map_err(|e| TuneError::Config(format!("[[knobs]] {}: {e}", knob.key())))?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        let t = &self.tuning;
        OrchestratorConfig {
            telemetry: TelemetryConfig {
                lookback: Duration::from_secs(t.effectiveness_lookback_secs),
                half_life: Duration::from_secs(t.effectiveness_half_life_secs),
                confidence_k: t.confidence_k,
                recompute_deadline: Duration::from_millis(t.recompute_deadline_ms),
                ..TelemetryConfig::default()
            },
            learning: LearningConfig {
                lookback: Duration::from_secs(t.learning_lookback_secs),
                confidence_k: t.confidence_k,
                max_observations: t.max_observations,
                min_pattern_samples: t.min_pattern_samples,
                decay_after: Duration::from_secs(t.pattern_decay_after_secs),
                pattern_retention: Duration::from_secs(t.pattern_retention_secs),
                suggestion_ttl: Duration::from_secs(t.suggestion_ttl_secs),
                generation_deadline: Duration::from_millis(t.generation_deadline_ms),
                correlation_window: Duration::from_secs(t.correlation_window_secs),
            },
            auto_suggest_threshold: t.auto_suggest_threshold,
            analyze_deadline: Duration::from_millis(t.analyze_deadline_ms),
            maintenance_interval: Duration::from_secs(t.maintenance_interval_secs),
            retention_days: t.retention_days,
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        let g = &self.gateway;
        GatewayConfig {
            queue_capacity: g.queue_capacity,
            heartbeat_interval: Duration::from_secs(g.heartbeat_interval_secs),
            stale_after: Duration::from_secs(g.stale_after_secs),
            request_timeout: Duration::from_millis(g.request_timeout_ms),
            push_confidence: g.push_confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.orchestrator().retention_days, 30);
        assert_eq!(config.gateway().heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file_with_extra_knobs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100

[tuning]
auto_suggest_threshold = 0.4

[gateway]
stale_after_secs = 45

[logging]
filter = "debug"

[[knobs]]
module = "fiscal"
name = "spendingCap"
default = 0.4
min = 0.0
max = 1.0
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.orchestrator().auto_suggest_threshold, 0.4);
        assert_eq!(config.gateway().stale_after, Duration::from_secs(45));
        assert_eq!(config.logging.filter.as_deref(), Some("debug"));
        assert_eq!(config.knobs.len(), 1);
        assert_eq!(config.knobs[0].name, "spendingCap");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        assert!(matches!(AppConfig::parse("[server\nport = 1"), Err(TuneError::Config(_))));
    }

    #[test]
    fn test_invalid_knob_bounds_rejected() {
        let text = r#"
[[knobs]]
module = "m"
name = "k"
default = 5.0
min = 1.0
max = 0.0
"#;
        assert!(matches!(AppConfig::parse(text), Err(TuneError::Config(_))));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        assert!(AppConfig::parse("[tuning]\nauto_suggest_threshold = 1.5").is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = AppConfig::parse("[server]\nport = 9100\nbind = \"0.0.0.0\"").unwrap();
        let cli = Cli::parse_from([
            "knob-tuner",
            "--port",
            "9200",
            "--log-filter",
            "warn",
            "--no-builtin-knobs",
        ]);
        config.apply_cli(&cli);
        assert_eq!(config.listen_addr(), "0.0.0.0:9200");
        assert_eq!(config.logging.filter.as_deref(), Some("warn"));
        assert!(!config.server.builtin_knobs);
    }
}
