//! Configuration loading and validation.
//!
//! One YAML or JSON file (picked by extension) describes every chain, the
//! sink, the local store, write retries and extra event signatures. Values
//! are validated once at load; nothing downstream checks for defaults.

use alloy::primitives::B256;
use ingest_data::{ChainHandle, RateLimit, ReceiptMode, RetryPolicy};
use ingest_decode::{DataShape, DecoderKind, EventSignature, LogShape, SignatureRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("signature {name} (topic0 {topic0}) has no decoder")]
    MissingDecoder { name: String, topic0: B256 },
    #[error("duplicate chain {0}")]
    DuplicateChain(String),
}

fn default_true() -> bool {
    true
}
fn default_confirmation_depth() -> u64 {
    12
}
fn default_concurrency() -> usize {
    20
}
fn default_batch_width() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_shrink_retries() -> u32 {
    4
}
fn default_network() -> String {
    "mainnet".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "RateLimitConfig::default_rps")]
    pub requests_per_second: u32,
    #[serde(default = "RateLimitConfig::default_burst")]
    pub burst: u32,
}

impl RateLimitConfig {
    fn default_rps() -> u32 {
        25
    }
    fn default_burst() -> u32 {
        50
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: Self::default_rps(),
            burst: Self::default_burst(),
        }
    }
}

/// Per-chain settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub chain_id: u64,
    pub rpc_url: String,
    #[serde(default = "default_network")]
    pub network: String,
    /// Trailing blocks withheld from ingestion
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    /// Maximum in-flight RPC requests
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Blocks per backfill batch
    #[serde(default = "default_batch_width")]
    pub batch_width: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Attempts per RPC call, first try included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How many times a failing batch may be halved
    #[serde(default = "default_max_shrink_retries")]
    pub max_shrink_retries: u32,
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub receipts: ReceiptMode,
}

impl ChainConfig {
    pub fn handle(&self) -> ChainHandle {
        ChainHandle {
            chain_id: self.chain_id,
            name: self.name.clone(),
            network: self.network.clone(),
            rpc_url: self.rpc_url.clone(),
            confirmation_depth: self.confirmation_depth,
            concurrency: self.concurrency,
            rate_limit: RateLimit {
                requests_per_second: self.rate_limit.requests_per_second,
                burst: self.rate_limit.burst,
            },
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            receipts: self.receipts,
        }
    }

    pub fn read_retry(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy::new(self.max_attempts, defaults.base_delay, defaults.max_delay)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| ConfigError::Invalid(format!("chain {}: {what}", self.name));
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("chain name must not be empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if self.rate_limit.requests_per_second == 0 || self.rate_limit.burst == 0 {
            return Err(invalid("rate limit and burst must be at least 1"));
        }
        if self.batch_width == 0 {
            return Err(invalid("batch_width must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.poll_interval_ms == 0 || self.request_timeout_ms == 0 {
            return Err(invalid("intervals must be non-zero"));
        }
        if let (Some(start), Some(end)) = (self.start_block, self.end_block) {
            if end < start {
                return Err(invalid("end_block is before start_block"));
            }
        }
        let scheme_ok = self.rpc_url.starts_with("http://") || self.rpc_url.starts_with("https://");
        let parsed = self.rpc_url.parse::<alloy::transports::http::reqwest::Url>();
        if !scheme_ok || parsed.is_err() {
            return Err(invalid(&format!("unparsable rpc_url {}", self.rpc_url)));
        }
        Ok(())
    }
}

/// InfluxDB v2 connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfluxConfig {
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "InfluxConfig::default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "InfluxConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl InfluxConfig {
    fn default_max_batch() -> usize {
        5_000
    }
    fn default_timeout_ms() -> u64 {
        10_000
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Influx(InfluxConfig),
    /// Records go to the local SQLite store
    #[default]
    Sqlite,
}

impl SinkConfig {
    pub fn max_batch(&self) -> usize {
        match self {
            SinkConfig::Influx(influx) => influx.max_batch,
            SinkConfig::Sqlite => InfluxConfig::default_max_batch(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_path")]
    pub path: String,
}

impl StoreConfig {
    fn default_path() -> String {
        "data/ingest.sqlite".to_string()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteRetryConfig {
    #[serde(default = "WriteRetryConfig::default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "WriteRetryConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "WriteRetryConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl WriteRetryConfig {
    fn default_attempts() -> u32 {
        5
    }
    fn default_base_delay_ms() -> u64 {
        250
    }
    fn default_max_delay_ms() -> u64 {
        10_000
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Default for WriteRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}

/// An extra registry entry. Appended after the builtins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureConfig {
    pub name: String,
    pub protocol: String,
    pub topic0: B256,
    /// Topic count including topic0
    pub topics: usize,
    pub data_len: usize,
    /// When false, `data_len` is a minimum
    #[serde(default = "default_true")]
    pub data_exact: bool,
    #[serde(default)]
    pub decoder: Option<DecoderKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub write_retry: WriteRetryConfig,
    #[serde(default)]
    pub signatures: Vec<SignatureConfig>,
}

/// Serialisation format of a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// `.json` is JSON; anything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// Loads, applies `INFLUX_*` environment overrides and validates a config file.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed, or fails validation.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<IngestConfig, ConfigError> {
    let path = path.as_ref();
    let path_str = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path_str.clone(),
        source: e,
    })?;

    let mut config = parse_config(&content, ConfigFormat::from_path(path), &path_str)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Parses without validating or applying overrides.
///
/// # Errors
/// [`ConfigError::Parse`] on syntax errors, unknown fields or bad values.
pub fn parse_config(
    content: &str,
    format: ConfigFormat,
    source_name: &str,
) -> Result<IngestConfig, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: source_name.to_string(),
        message,
    };
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| parse_err(e.to_string())),
        ConfigFormat::Json => serde_json::from_str(content).map_err(|e| parse_err(e.to_string())),
    }
}

impl IngestConfig {
    /// Fills InfluxDB credentials from `INFLUX_TOKEN`, `INFLUX_ORG` and
    /// `INFLUX_BUCKET` when set.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let SinkConfig::Influx(influx) = &mut self.sink {
            for (key, slot) in [
                ("INFLUX_TOKEN", &mut influx.token),
                ("INFLUX_ORG", &mut influx.org),
                ("INFLUX_BUCKET", &mut influx.bucket),
            ] {
                if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                    *slot = value;
                }
            }
        }
    }

    /// # Errors
    /// The first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for chain in &self.chains {
            chain.validate()?;
            if !ids.insert(chain.chain_id) {
                return Err(ConfigError::DuplicateChain(format!("id {}", chain.chain_id)));
            }
            if !names.insert(chain.name.as_str()) {
                return Err(ConfigError::DuplicateChain(chain.name.clone()));
            }
        }

        if let SinkConfig::Influx(influx) = &self.sink {
            if influx.url.is_empty() || influx.org.is_empty() || influx.bucket.is_empty() {
                return Err(ConfigError::Invalid(
                    "influx sink needs url, org and bucket".to_string(),
                ));
            }
            if influx.token.is_empty() {
                return Err(ConfigError::Invalid(
                    "influx sink needs a token (or INFLUX_TOKEN)".to_string(),
                ));
            }
            if influx.max_batch == 0 {
                return Err(ConfigError::Invalid("sink max_batch must be at least 1".to_string()));
            }
        }

        if self.write_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "write_retry.max_attempts must be at least 1".to_string(),
            ));
        }

        for sig in &self.signatures {
            if sig.decoder.is_none() {
                return Err(ConfigError::MissingDecoder {
                    name: sig.name.clone(),
                    topic0: sig.topic0,
                });
            }
            if sig.topics == 0 || sig.topics > 4 {
                return Err(ConfigError::Invalid(format!(
                    "signature {}: topics must be between 1 and 4",
                    sig.name
                )));
            }
        }
        Ok(())
    }

    /// Builtin signatures followed by configured ones.
    ///
    /// # Errors
    /// [`ConfigError::MissingDecoder`] for an entry without a decoder.
    pub fn registry(&self) -> Result<SignatureRegistry, ConfigError> {
        let mut registry = SignatureRegistry::builtin();
        for sig in &self.signatures {
            let decoder = sig.decoder.ok_or_else(|| ConfigError::MissingDecoder {
                name: sig.name.clone(),
                topic0: sig.topic0,
            })?;
            let data = if sig.data_exact {
                DataShape::Exact(sig.data_len)
            } else {
                DataShape::AtLeast(sig.data_len)
            };
            registry.register(EventSignature::new(
                sig.name.clone(),
                sig.protocol.clone(),
                sig.topic0,
                LogShape {
                    topics: sig.topics,
                    data,
                },
                decoder,
            ));
        }
        Ok(registry)
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }

    /// Enabled chains, or the named ones when `names` is non-empty.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] for an unknown name or an empty selection.
    pub fn select_chains(&self, names: &[String]) -> Result<Vec<&ChainConfig>, ConfigError> {
        let selected: Vec<&ChainConfig> = if names.is_empty() {
            self.chains.iter().filter(|c| c.enabled).collect()
        } else {
            names
                .iter()
                .map(|n| {
                    self.chain(n)
                        .ok_or_else(|| ConfigError::Invalid(format!("unknown chain {n}")))
                })
                .collect::<Result<_, _>>()?
        };
        if selected.is_empty() {
            return Err(ConfigError::Invalid("no enabled chains".to_string()));
        }
        Ok(selected)
    }
}
