//! Configuration management for the audit gateway.
//!
//! Configuration can be set via environment variables:
//! - `GATEWAY_HOST` - Optional. Server host. Defaults to `0.0.0.0`.
//! - `GATEWAY_PORT` - Optional. Server port. Defaults to `8080`.
//! - `AUDITOR_DOCS_DIR` - Optional. Directory for uploaded documents and reports. Defaults to `temp_docs`.
//! - `AUDITOR_WORKERS` - Optional. Number of pipeline workers. Defaults to `4`.
//! - `AUDITOR_QUEUE_CAPACITY` - Optional. Dispatch queue capacity. Defaults to `100`.
//! - `RUST_PARSER_ADDR` - Optional. Parser service base URL.
//! - `JAVA_ENGINE_ADDR` - Optional. Rule engine base URL.
//! - `PY_INFERENCE_ADDR` - Optional. Inference service base URL.
//! - `INFERENCE_ENABLED` - Optional. Set to `false` to run without semantic analysis.
//! - `PARSE_TIMEOUT_SECS`, `AUDIT_CALL_TIMEOUT_SECS`, `AUDIT_FANOUT_TIMEOUT_SECS`,
//!   `ANNOTATE_TIMEOUT_SECS` - Optional. Per-stage deadlines.
//! - `BREAKER_FAILURE_THRESHOLD`, `BREAKER_COOLDOWN_SECS` - Optional. Inference circuit breaker.
//! - `SCORE_RULE_WEIGHT`, `SCORE_SEMANTIC_WEIGHT` - Optional. Compliance score weights.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Base URLs of the three analysis services.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub parser: String,
    pub rule_engine: String,
    pub inference: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            parser: "http://parser-rs:52051".to_string(),
            rule_engine: "http://engine-java:9191".to_string(),
            inference: "http://inference-py:50051".to_string(),
        }
    }
}

/// Deadlines applied by the pipeline to each stage.
#[derive(Debug, Clone)]
pub struct PipelineTimeouts {
    /// Deadline for `Parser.Parse`
    pub parse: Duration,
    /// Deadline for each audit branch (rule engine, inference)
    pub audit_call: Duration,
    /// Parent deadline bounding the whole audit fan-out
    pub audit_fanout: Duration,
    /// Deadline for `Parser.Annotate`
    pub annotate: Duration,
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            parse: Duration::from_secs(30),
            audit_call: Duration::from_secs(25),
            audit_fanout: Duration::from_secs(45),
            annotate: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker settings for the inference service.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures (or timeouts) that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Points deducted from the compliance score per unit of score impact.
#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub rule_engine: f64,
    pub inference: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            rule_engine: 60.0,
            inference: 40.0,
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Directory holding uploaded sources, annotated copies and reports
    pub docs_dir: PathBuf,

    /// Number of pipeline workers
    pub workers: usize,

    /// Capacity of the dispatch queue
    pub queue_capacity: usize,

    /// Analysis service endpoints
    pub services: ServiceEndpoints,

    /// Whether the inference client is constructed at all
    pub inference_enabled: bool,

    pub timeouts: PipelineTimeouts,

    pub breaker: BreakerConfig,

    pub scoring: ScoringWeights,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be parsed,
    /// or if a count that must be positive is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new(PathBuf::from("temp_docs"));

        let host = std::env::var("GATEWAY_HOST").unwrap_or(defaults.host);
        let port = env_parse("GATEWAY_PORT", defaults.port)?;
        let docs_dir = std::env::var("AUDITOR_DOCS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.docs_dir);

        let workers = env_parse("AUDITOR_WORKERS", defaults.workers)?;
        let queue_capacity = env_parse("AUDITOR_QUEUE_CAPACITY", defaults.queue_capacity)?;
        require_positive("AUDITOR_WORKERS", workers)?;
        require_positive("AUDITOR_QUEUE_CAPACITY", queue_capacity)?;

        let services = ServiceEndpoints {
            parser: std::env::var("RUST_PARSER_ADDR").unwrap_or(defaults.services.parser),
            rule_engine: std::env::var("JAVA_ENGINE_ADDR")
                .unwrap_or(defaults.services.rule_engine),
            inference: std::env::var("PY_INFERENCE_ADDR").unwrap_or(defaults.services.inference),
        };

        let inference_enabled = env_parse("INFERENCE_ENABLED", defaults.inference_enabled)?;

        let timeouts = PipelineTimeouts {
            parse: env_secs("PARSE_TIMEOUT_SECS", defaults.timeouts.parse)?,
            audit_call: env_secs("AUDIT_CALL_TIMEOUT_SECS", defaults.timeouts.audit_call)?,
            audit_fanout: env_secs("AUDIT_FANOUT_TIMEOUT_SECS", defaults.timeouts.audit_fanout)?,
            annotate: env_secs("ANNOTATE_TIMEOUT_SECS", defaults.timeouts.annotate)?,
        };

        let breaker = BreakerConfig {
            failure_threshold: env_parse(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker.failure_threshold,
            )?,
            cooldown: env_secs("BREAKER_COOLDOWN_SECS", defaults.breaker.cooldown)?,
        };
        require_positive(
            "BREAKER_FAILURE_THRESHOLD",
            breaker.failure_threshold as usize,
        )?;

        let scoring = ScoringWeights {
            rule_engine: env_parse("SCORE_RULE_WEIGHT", defaults.scoring.rule_engine)?,
            inference: env_parse("SCORE_SEMANTIC_WEIGHT", defaults.scoring.inference)?,
        };

        Ok(Self {
            host,
            port,
            docs_dir,
            workers,
            queue_capacity,
            services,
            inference_enabled,
            timeouts,
            breaker,
            scoring,
        })
    }

    /// Create a config with default values (useful for testing).
    pub fn new(docs_dir: PathBuf) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            docs_dir,
            workers: 4,
            queue_capacity: 100,
            services: ServiceEndpoints::default(),
            inference_enabled: true,
            timeouts: PipelineTimeouts::default(),
            breaker: BreakerConfig::default(),
            scoring: ScoringWeights::default(),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_value::<u64>(key, &raw).map(Duration::from_secs),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), format!("{}", e)))
}

fn require_positive(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be at least 1".to_string(),
        ));
    }
    Ok(())
}
