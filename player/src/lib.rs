//! The player side of a rochambeau state channel.
//!
//! [GameChannel] drives the commit-reveal protocol against a bot peer, keeps
//! local round state in step with the channel, and persists enough of it to
//! resume after a restart.

use rochambeau_client::RejectReason;
use rochambeau_types::{AbiError, Keypair, Move, SnapshotError};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;
use url::Url;

pub mod backoff;
pub mod coordinator;
pub mod defaults;
pub mod interceptor;
pub mod notify;
pub mod persistence;

pub use backoff::RetryPolicy;
pub use coordinator::{GameChannel, Options, Phase, RoundPhase};
pub use interceptor::{BotAction, SigningInterceptor};
pub use notify::{Notification, StateView};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid selection: {0}")]
    InvalidSelection(Move),
    #[error("selection rejected: {0}")]
    SelectionRejected(RejectReason),
    #[error("cannot {operation}: {reason}")]
    Precondition {
        operation: &'static str,
        reason: &'static str,
    },
    #[error("round {index} is already completed")]
    RoundCompleted { index: u64 },
    #[error("reveal failed after {attempts} attempts: {last}")]
    RevealFailed { attempts: u32, last: String },
    #[error("dispute rejected: {0}")]
    DisputeRejected(String),
    #[error("lookup of call at channel round {round} timed out")]
    FetchTimedOut { round: u64 },
    #[error("not connected to a channel")]
    NotConnected,
    #[error("no verified game contract")]
    NoContract,
    #[error("snapshot corrupted: {0}")]
    Corrupted(#[from] SnapshotError),
    #[error("channel died")]
    ChannelDied,
    #[error("client error: {0}")]
    Client(#[from] rochambeau_client::Error),
    #[error("abi error: {0}")]
    Abi(#[from] AbiError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration of the `rochambeau-player` binary.
#[derive(Deserialize, Serialize)]
pub struct Config {
    /// Hex encoded ed25519 secret; a fresh account is generated when absent.
    #[serde(default)]
    pub secret_key: Option<String>,
    /// External matchmaker; the bundled local one is started when absent.
    #[serde(default)]
    pub matchmaking_url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,

    /// Compiler service used to check the bot's contract against `contract_source_path`.
    #[serde(default)]
    pub compiler_url: Option<String>,
    #[serde(default)]
    pub contract_source_path: Option<String>,

    #[serde(default = "default_stake")]
    pub stake: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    #[serde(default = "default_max_call_attempts")]
    pub max_call_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
    #[serde(default = "default_log_retention_rounds")]
    pub log_retention_rounds: usize,
    #[serde(default = "default_autoplay_rounds")]
    pub autoplay_rounds: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("secret_key is not a valid ed25519 secret")]
    InvalidSecretKey,
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("{field} must be a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} URL scheme must be http or https: {value}")]
    InvalidUrlScheme { field: &'static str, value: String },
    #[error("{field} requires {requires}")]
    MissingCompanion {
        field: &'static str,
        requires: &'static str,
    },
    #[error("retry_backoff_ms ({base}) must not exceed max_retry_backoff_ms ({max})")]
    InvalidBackoff { base: u64, max: u64 },
}

pub struct ValidatedConfig {
    pub keypair: Option<Keypair>,
    pub matchmaking_url: Option<Url>,
    pub host: String,
    pub port: u16,
    pub snapshot_path: PathBuf,
    pub log_level: Level,
    pub json_logs: bool,
    pub compiler: Option<(Url, PathBuf)>,
    pub autoplay_rounds: u64,
    pub event_buffer: usize,
    pub options: Options,
}

struct RedactedConfig<'a>(&'a Config);

impl fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.0;
        f.debug_struct("Config")
            .field(
                "secret_key",
                &cfg.secret_key.as_ref().map(|_| "<redacted>"),
            )
            .field("matchmaking_url", &cfg.matchmaking_url)
            .field("host", &cfg.host)
            .field("port", &cfg.port)
            .field("snapshot_path", &cfg.snapshot_path)
            .field("log_level", &cfg.log_level)
            .field("json_logs", &cfg.json_logs)
            .field("compiler_url", &cfg.compiler_url)
            .field("contract_source_path", &cfg.contract_source_path)
            .field("stake", &cfg.stake)
            .field("fetch_timeout_ms", &cfg.fetch_timeout_ms)
            .field("verify_timeout_ms", &cfg.verify_timeout_ms)
            .field("max_call_attempts", &cfg.max_call_attempts)
            .field("retry_backoff_ms", &cfg.retry_backoff_ms)
            .field("max_retry_backoff_ms", &cfg.max_retry_backoff_ms)
            .field("log_retention_rounds", &cfg.log_retention_rounds)
            .field("autoplay_rounds", &cfg.autoplay_rounds)
            .field("event_buffer", &cfg.event_buffer)
            .finish()
    }
}

fn default_host() -> String {
    defaults::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    defaults::DEFAULT_PORT
}

fn default_snapshot_path() -> String {
    defaults::DEFAULT_SNAPSHOT_PATH.to_string()
}

fn default_log_level() -> String {
    defaults::DEFAULT_LOG_LEVEL.to_string()
}

fn default_json_logs() -> bool {
    defaults::DEFAULT_JSON_LOGS
}

fn default_stake() -> u64 {
    defaults::DEFAULT_STAKE
}

fn default_fetch_timeout_ms() -> u64 {
    defaults::DEFAULT_FETCH_TIMEOUT_MS
}

fn default_verify_timeout_ms() -> u64 {
    defaults::DEFAULT_VERIFY_TIMEOUT_MS
}

fn default_max_call_attempts() -> u32 {
    defaults::DEFAULT_MAX_CALL_ATTEMPTS
}

fn default_retry_backoff_ms() -> u64 {
    defaults::DEFAULT_RETRY_BACKOFF_MS
}

fn default_max_retry_backoff_ms() -> u64 {
    defaults::DEFAULT_MAX_RETRY_BACKOFF_MS
}

fn default_log_retention_rounds() -> usize {
    defaults::DEFAULT_LOG_RETENTION_ROUNDS
}

fn default_autoplay_rounds() -> u64 {
    defaults::DEFAULT_AUTOPLAY_ROUNDS
}

fn default_event_buffer() -> usize {
    defaults::DEFAULT_EVENT_BUFFER
}

fn ensure_nonzero(field: &'static str, value: u64) -> std::result::Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

fn validate_http_url(field: &'static str, value: &str) -> std::result::Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(ConfigError::InvalidUrlScheme {
                field,
                value: value.to_string(),
            })
        }
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        });
    }
    Ok(url)
}

impl Config {
    pub fn redacted_debug(&self) -> impl fmt::Debug + '_ {
        RedactedConfig(self)
    }

    pub fn validate(self) -> std::result::Result<ValidatedConfig, ConfigError> {
        let keypair = match &self.secret_key {
            Some(secret) => {
                Some(Keypair::from_secret_hex(secret).ok_or(ConfigError::InvalidSecretKey)?)
            }
            None => None,
        };
        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;
        let matchmaking_url = self
            .matchmaking_url
            .as_deref()
            .map(|url| validate_http_url("matchmaking_url", url))
            .transpose()?;
        let compiler = match (&self.compiler_url, &self.contract_source_path) {
            (Some(url), Some(source)) => Some((
                validate_http_url("compiler_url", url)?,
                PathBuf::from(source),
            )),
            (Some(_), None) => {
                return Err(ConfigError::MissingCompanion {
                    field: "compiler_url",
                    requires: "contract_source_path",
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingCompanion {
                    field: "contract_source_path",
                    requires: "compiler_url",
                })
            }
            (None, None) => None,
        };

        ensure_nonzero("stake", self.stake)?;
        ensure_nonzero("fetch_timeout_ms", self.fetch_timeout_ms)?;
        ensure_nonzero("verify_timeout_ms", self.verify_timeout_ms)?;
        ensure_nonzero("max_call_attempts", self.max_call_attempts as u64)?;
        ensure_nonzero("retry_backoff_ms", self.retry_backoff_ms)?;
        ensure_nonzero("log_retention_rounds", self.log_retention_rounds as u64)?;
        ensure_nonzero("event_buffer", self.event_buffer as u64)?;
        if self.retry_backoff_ms > self.max_retry_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                base: self.retry_backoff_ms,
                max: self.max_retry_backoff_ms,
            });
        }

        Ok(ValidatedConfig {
            keypair,
            matchmaking_url,
            host: self.host,
            port: self.port,
            snapshot_path: PathBuf::from(self.snapshot_path),
            log_level,
            json_logs: self.json_logs,
            compiler,
            autoplay_rounds: self.autoplay_rounds,
            event_buffer: self.event_buffer,
            options: Options {
                stake: self.stake,
                fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
                verify_timeout: Duration::from_millis(self.verify_timeout_ms),
                retry: RetryPolicy {
                    max_attempts: self.max_call_attempts,
                    base: Duration::from_millis(self.retry_backoff_ms),
                    max: Duration::from_millis(self.max_retry_backoff_ms),
                },
                log_retention_rounds: self.log_retention_rounds,
                notification_buffer: defaults::DEFAULT_NOTIFICATION_BUFFER,
            },
        })
    }
}

#[cfg(test)]
mod tests;
