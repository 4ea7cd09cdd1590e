use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

// Defaults. NOT secrets; safe to ship in the binary.
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_RUNNER_GROUP_ID: u64 = 1;
pub const DEFAULT_RUNNER_LABELS: [&str; 2] = ["self-hosted", "modal"];
pub const DEFAULT_RUNNER_NAME_PREFIX: &str = "modal-runner";
pub const DEFAULT_WORK_DIRECTORY: &str = "_work";
pub const DEFAULT_RUNNER_IMAGE: &str = "github-actions-runner:2.311.0";
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_GITHUB_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SANDBOX_USER: &str = "runner";
pub const DEFAULT_SANDBOX_WORKDIR: &str = "/home/runner";
pub const DEFAULT_DOCKER_BIN: &str = "docker";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("{key} is listed in SANDBOX_FORWARD_ENV but is not set")]
    MissingForwardedVar { key: String },
}

/// Process-wide settings, loaded once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    pub webhook: WebhookConfig,
    pub github: GithubConfig,
    pub runner: RunnerConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    /// `None` means every delivery is rejected.
    pub secret: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub token: Option<SecretString>,
    pub timeout: Duration,
}

/// What the runner registers as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub group_id: u64,
    pub labels: Vec<String>,
    pub name_prefix: String,
    pub work_directory: String,
}

/// How the runner sandbox is launched.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub timeout: Duration,
    pub user: String,
    pub workdir: String,
    pub docker_bin: String,
    /// Credential set copied into every sandbox, captured at startup.
    pub forwarded_env: Vec<(String, SecretString)>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            group_id: DEFAULT_RUNNER_GROUP_ID,
            labels: default_labels(),
            name_prefix: DEFAULT_RUNNER_NAME_PREFIX.to_string(),
            work_directory: DEFAULT_WORK_DIRECTORY.to_string(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_RUNNER_IMAGE.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user: DEFAULT_SANDBOX_USER.to_string(),
            workdir: DEFAULT_SANDBOX_WORKDIR.to_string(),
            docker_bin: DEFAULT_DOCKER_BIN.to_string(),
            forwarded_env: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the process environment (after an optional `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let secret = get("WEBHOOK_SECRET").map(SecretString::from);
        if secret.is_none() {
            tracing::warn!("WEBHOOK_SECRET not set, every webhook delivery will be rejected");
        }

        let token = get("GITHUB_TOKEN").map(SecretString::from);
        if token.is_none() {
            tracing::warn!("GITHUB_TOKEN not set, queued jobs cannot be provisioned");
        }

        let labels = match get("RUNNER_LABELS") {
            Some(raw) => parse_labels(&raw),
            None => default_labels(),
        };

        let mut forwarded_env = Vec::new();
        if let Some(names) = get("SANDBOX_FORWARD_ENV") {
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                let value = lookup(name).ok_or_else(|| ConfigError::MissingForwardedVar {
                    key: name.to_string(),
                })?;
                forwarded_env.push((name.to_string(), SecretString::from(value)));
            }
        }

        Ok(Self {
            webhook: WebhookConfig { secret },
            github: GithubConfig {
                token,
                timeout: Duration::from_secs(parse_or(
                    &get,
                    "GITHUB_TIMEOUT_SECS",
                    DEFAULT_GITHUB_TIMEOUT_SECS,
                )?),
            },
            runner: RunnerConfig {
                group_id: parse_or(&get, "RUNNER_GROUP_ID", DEFAULT_RUNNER_GROUP_ID)?,
                labels,
                name_prefix: get("RUNNER_NAME_PREFIX")
                    .unwrap_or_else(|| DEFAULT_RUNNER_NAME_PREFIX.to_string()),
                work_directory: get("RUNNER_WORK_DIRECTORY")
                    .unwrap_or_else(|| DEFAULT_WORK_DIRECTORY.to_string()),
            },
            sandbox: SandboxConfig {
                image: get("RUNNER_IMAGE").unwrap_or_else(|| DEFAULT_RUNNER_IMAGE.to_string()),
                timeout: Duration::from_secs(parse_or(
                    &get,
                    "TIMEOUT_SECONDS",
                    DEFAULT_TIMEOUT_SECS,
                )?),
                user: get("SANDBOX_USER").unwrap_or_else(|| DEFAULT_SANDBOX_USER.to_string()),
                workdir: get("SANDBOX_WORKDIR")
                    .unwrap_or_else(|| DEFAULT_SANDBOX_WORKDIR.to_string()),
                docker_bin: get("DOCKER_BIN").unwrap_or_else(|| DEFAULT_DOCKER_BIN.to_string()),
                forwarded_env,
            },
        })
    }
}

fn default_labels() -> Vec<String> {
    DEFAULT_RUNNER_LABELS.iter().map(|l| l.to_string()).collect()
}

/// Labels arrive JSON-encoded. A value that does not parse falls back to the
/// defaults instead of failing startup.
fn parse_labels(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(labels) if !labels.is_empty() => labels,
        Ok(_) => {
            tracing::warn!("RUNNER_LABELS is an empty list, using defaults");
            default_labels()
        }
        Err(e) => {
            tracing::warn!("RUNNER_LABELS is not a JSON string array ({}), using defaults", e);
            default_labels()
        }
    }
}

fn parse_or<G>(get: &G, key: &str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}
