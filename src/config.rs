//! Configuration loading and types for vhdpush.
//!
//! Configuration is optional.  When a YAML file is given it is
//! deserialized into [`Config`]; every field has a default so a partial
//! file (or no file at all) is valid.  Command-line flags override the
//! values loaded here.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::errors::PushError;
use crate::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Default destination names.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Cloud endpoints and credential variable names.
    #[serde(default)]
    pub azure: AzureConfig,

    /// Upload engine tuning.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Retry policy for transient storage failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Destination defaults used when the CLI leaves a name unspecified.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default = "default_account_name")]
    pub account_name: String,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    #[serde(default = "default_blob_name")]
    pub blob_name: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            location: default_location(),
            account_name: default_account_name(),
            container_name: default_container_name(),
            blob_name: default_blob_name(),
        }
    }
}

/// Azure endpoints.
///
/// Overriding the endpoints allows pointing the tool at a sovereign cloud
/// or a local emulator.
#[derive(Debug, Clone, Deserialize)]
pub struct AzureConfig {
    /// Identity (Active Directory) authority host.
    #[serde(default = "default_active_directory_endpoint")]
    pub active_directory_endpoint: String,

    /// Resource manager endpoint; also the token audience.
    #[serde(default = "default_resource_manager_endpoint")]
    pub resource_manager_endpoint: String,

    /// Blob service host suffix, `{account}.{suffix}`.
    #[serde(default = "default_blob_endpoint_suffix")]
    pub blob_endpoint_suffix: String,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,

    /// Names of the environment variables holding the service principal.
    #[serde(default)]
    pub env: CredentialEnvNames,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            active_directory_endpoint: default_active_directory_endpoint(),
            resource_manager_endpoint: default_resource_manager_endpoint(),
            blob_endpoint_suffix: default_blob_endpoint_suffix(),
            http_timeout_seconds: default_http_timeout(),
            env: CredentialEnvNames::default(),
        }
    }
}

impl AzureConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

/// Environment variable names for the four service principal values.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialEnvNames {
    #[serde(default = "default_subscription_var")]
    pub subscription_id: String,

    #[serde(default = "default_tenant_var")]
    pub tenant_id: String,

    #[serde(default = "default_client_id_var")]
    pub client_id: String,

    #[serde(default = "default_client_secret_var")]
    pub client_secret: String,
}

impl Default for CredentialEnvNames {
    fn default() -> Self {
        Self {
            subscription_id: default_subscription_var(),
            tenant_id: default_tenant_var(),
            client_id: default_client_id_var(),
            client_secret: default_client_secret_var(),
        }
    }
}

/// Upload engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Worker count. 0 selects 8 x available CPUs.
    #[serde(default)]
    pub parallelism: usize,

    /// Planning granularity in bytes (default 2 MiB).
    #[serde(default = "default_page_size")]
    pub page_size: u64,

    /// Largest logical image accepted, in bytes (default 8 TiB).
    #[serde(default = "default_max_image_size")]
    pub max_image_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            parallelism: 0,
            page_size: default_page_size(),
            max_image_size: default_max_image_size(),
        }
    }
}

impl UploadConfig {
    /// Resolve the effective worker count.
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            return self.parallelism;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        8 * cpus
    }
}

/// Retry settings for transient remote failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per request, including the first. 1 disables retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of each delay randomized, 0.0 to 1.0.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier.max(1.0),
            jitter: self.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_location() -> String {
    "westeurope".to_string()
}

fn default_account_name() -> String {
    "linuxkit".to_string()
}

fn default_container_name() -> String {
    "linuxkitcontainer".to_string()
}

fn default_blob_name() -> String {
    "linuxkitimage.vhd".to_string()
}

fn default_active_directory_endpoint() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_resource_manager_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_blob_endpoint_suffix() -> String {
    "blob.core.windows.net".to_string()
}

fn default_http_timeout() -> u64 {
    300
}

fn default_subscription_var() -> String {
    "AZURE_SUBSCRIPTION_ID".to_string()
}

fn default_tenant_var() -> String {
    "AZURE_TENANT_ID".to_string()
}

fn default_client_id_var() -> String {
    "AZURE_CLIENT_ID".to_string()
}

fn default_client_secret_var() -> String {
    "AZURE_CLIENT_SECRET".to_string()
}

fn default_page_size() -> u64 {
    2 * 1024 * 1024
}

fn default_max_image_size() -> u64 {
    8 * 1024 * 1024 * 1024 * 1024 // 8 TiB
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, PushError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        PushError::Configuration(format!("cannot read {}: {}", path.display(), e))
    })?;
    let config: Config = serde_yaml::from_str(&contents).map_err(|e| {
        PushError::Configuration(format!("cannot parse {}: {}", path.display(), e))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject settings the upload engine cannot honor.
pub fn validate_config(config: &Config) -> Result<(), PushError> {
    let page_size = config.upload.page_size;
    if page_size == 0 || page_size % 512 != 0 {
        return Err(PushError::Configuration(format!(
            "upload.page_size must be a positive multiple of 512, got {}",
            page_size
        )));
    }
    if config.logging.format != "text" && config.logging.format != "json" {
        return Err(PushError::Configuration(format!(
            "logging.format must be 'text' or 'json', got '{}'",
            config.logging.format
        )));
    }
    Ok(())
}

// -- Tests -------------------------------------------------------------------
