use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum InvalidConfig {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Bitbucket workspace cannot be empty")]
    EmptyWorkspace,

    #[error("Bitbucket credentials are incomplete")]
    EmptyCredentials,

    #[error("Worker count must be at least 1")]
    NoWorkers,

    #[error("Cache TTL must be at least one second")]
    ZeroCacheTtl,

    #[error("At most {} retries are allowed", MAX_RETRIES)]
    TooManyRetries,
}

/// Upper bound for `bitbucket.retry.max_retries`.
pub const MAX_RETRIES: u32 = 10;

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.port == 0 {
            return Err(InvalidConfig::InvalidPort);
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 3001,
    }
}

#[derive(Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// OAuth or workspace access token, sent as a bearer token.
    Token { token: String },
    /// Username and app password, sent with basic auth.
    AppPassword { username: String, password: String },
}

impl Credentials {
    pub fn username(&self) -> Option<&str> {
        match self {
            Credentials::Token { .. } => None,
            Credentials::AppPassword { username, .. } => Some(username),
        }
    }

    fn is_complete(&self) -> bool {
        match self {
            Credentials::Token { token } => !token.is_empty(),
            Credentials::AppPassword { username, password } => {
                !username.is_empty() && !password.is_empty()
            }
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token { .. } => f.debug_struct("Token").finish_non_exhaustive(),
            Credentials::AppPassword { username, .. } => f
                .debug_struct("AppPassword")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries per request on 429 and 5xx responses.
    pub max_retries: u32,
    /// Delay before the first retry, doubled on every subsequent one.
    pub base_delay_ms: u64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

fn default_api_url() -> Url {
    Url::parse("https://api.bitbucket.org").expect("static URL is valid")
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BitbucketConfig {
    #[serde(default = "default_api_url")]
    pub api_url: Url,
    pub workspace: String,
    pub credentials: Credentials,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DirectoryConfig {
    /// The ops service, reached over HTTP.
    Http { url: Url },
    /// A YAML fixture loaded once at startup.
    File { path: PathBuf },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_capacity: u64,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            max_capacity: 10_000,
            ttl_secs: 600,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct FanoutConfig {
    /// Identity workers per available CPU.
    pub worker_multiplier: usize,
    /// Concurrent ACL fetches when building a single user's permission view.
    pub resource_workers: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        FanoutConfig {
            worker_multiplier: 4,
            resource_workers: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    pub bitbucket: BitbucketConfig,
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.bitbucket.workspace.trim().is_empty() {
            return Err(InvalidConfig::EmptyWorkspace);
        }
        if !self.bitbucket.credentials.is_complete() {
            return Err(InvalidConfig::EmptyCredentials);
        }
        if self.fanout.worker_multiplier == 0 || self.fanout.resource_workers == 0 {
            return Err(InvalidConfig::NoWorkers);
        }
        if self.bitbucket.retry.max_retries > MAX_RETRIES {
            return Err(InvalidConfig::TooManyRetries);
        }
        if self.cache.enabled && self.cache.ttl_secs == 0 {
            return Err(InvalidConfig::ZeroCacheTtl);
        }
        Ok(())
    }
}
