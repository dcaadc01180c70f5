//! Runtime configuration and startup validation
//!
//! This module provides:
//! - Environment-mode aware configuration (development/staging/production)
//! - Storage, Redis, AI provider and solver settings
//! - Strict production validation of secrets and dev-mode bypasses

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    MissingSetting(String),

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("Dev-mode toggle {0} is forbidden in production")]
    DevToggleInProduction(String),

    #[error("Secret key {0} is too short or default in production")]
    WeakSecret(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Deployment environment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentMode {
    Development,
    Staging,
    Production,
}

impl EnvironmentMode {
    /// Parse from the conventional environment string.
    pub fn parse(value: &str) -> ConfigResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(EnvironmentMode::Development),
            "staging" => Ok(EnvironmentMode::Staging),
            "production" | "prod" => Ok(EnvironmentMode::Production),
            other => Err(ConfigError::InvalidSetting {
                name: "environment".to_string(),
                reason: format!("unknown mode: {}", other),
            }),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, EnvironmentMode::Production)
    }
}

/// Object storage connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Path-style addressing for MinIO compatibility
    pub use_path_style: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            use_path_style: false,
        }
    }
}

/// AI provider selection and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSettings {
    pub provider: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: String::new(),
            request_timeout_secs: 60,
            max_retries: 3,
        }
    }
}

/// Dev-mode bypass flags. Every one of these is strictly rejected in
/// production by [`EnvironmentConfig::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevToggles {
    pub bypass_script_validation: bool,
    pub bypass_auth: bool,
    pub allow_insecure_storage: bool,
    pub mock_collaborators: bool,
}

impl DevToggles {
    fn active(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.bypass_script_validation {
            names.push("bypass_script_validation");
        }
        if self.bypass_auth {
            names.push("bypass_auth");
        }
        if self.allow_insecure_storage {
            names.push("allow_insecure_storage");
        }
        if self.mock_collaborators {
            names.push("mock_collaborators");
        }
        names
    }
}

/// Well-known default secrets that must never survive into production.
const DEFAULT_SECRETS: &[&str] = &["changeme", "secret", "dev-secret-key", "password"];

/// Minimum secret key length accepted in production.
const MIN_SECRET_LEN: usize = 32;

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub mode: EnvironmentMode,
    /// Application secret key; >= 32 chars and non-default in production
    pub secret_key: String,
    pub storage: StorageSettings,
    pub redis_url: String,
    pub ai: AiSettings,
    /// Path to the external FEM solver binary
    pub solver_binary: String,
    pub dev_toggles: DevToggles,
    /// Worker identifier used in notifications and fleet registrations
    pub worker_id: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            mode: EnvironmentMode::Development,
            secret_key: "dev-secret-key".to_string(),
            storage: StorageSettings::default(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ai: AiSettings::default(),
            solver_binary: "/usr/bin/ccx".to_string(),
            dev_toggles: DevToggles::default(),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl EnvironmentConfig {
    /// Load from process environment variables, falling back to defaults.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("CADVAULT_ENV") {
            config.mode = EnvironmentMode::parse(&mode)?;
        }
        if let Ok(secret) = std::env::var("CADVAULT_SECRET_KEY") {
            config.secret_key = secret;
        }
        if let Ok(url) = std::env::var("CADVAULT_REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(endpoint) = std::env::var("CADVAULT_S3_ENDPOINT") {
            config.storage.endpoint = Some(endpoint);
        }
        if let Ok(region) = std::env::var("CADVAULT_S3_REGION") {
            config.storage.region = region;
        }
        if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
            config.storage.access_key = key;
        }
        if let Ok(key) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            config.storage.secret_key = key;
        }
        if let Ok(solver) = std::env::var("CADVAULT_SOLVER_BINARY") {
            config.solver_binary = solver;
        }

        Ok(config)
    }

    /// Startup validation. Refuses to start in production when any
    /// forbidden dev toggle is set or secrets are weak.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::MissingSetting("redis_url".to_string()));
        }

        if !self.mode.is_production() {
            return Ok(());
        }

        if let Some(toggle) = self.dev_toggles.active().first() {
            return Err(ConfigError::DevToggleInProduction(toggle.to_string()));
        }

        if self.secret_key.len() < MIN_SECRET_LEN
            || DEFAULT_SECRETS.contains(&self.secret_key.as_str())
        {
            return Err(ConfigError::WeakSecret("secret_key".to_string()));
        }

        if self.storage.access_key.is_empty() || self.storage.secret_key.is_empty() {
            return Err(ConfigError::MissingSetting("storage credentials".to_string()));
        }

        Ok(())
    }
}
