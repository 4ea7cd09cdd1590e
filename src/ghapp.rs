use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::models::{JitConfigRequest, JitConfigResponse};

const UA: &str = concat!("runner-dispatch/", env!("CARGO_PKG_VERSION"));
const GITHUB_API_VERSION: &str = "2022-11-28";

/// Single-use runner registration credential. Never logged.
pub struct JitToken {
    config: SecretString,
    pub runner_id: Option<u64>,
}

impl JitToken {
    pub fn new(config: impl Into<String>, runner_id: Option<u64>) -> Self {
        Self {
            config: SecretString::from(config.into()),
            runner_id,
        }
    }

    pub fn into_secret(self) -> SecretString {
        self.config
    }
}

impl std::fmt::Debug for JitToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitToken")
            .field("config", &"[REDACTED]")
            .field("runner_id", &self.runner_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("GITHUB_TOKEN is not configured")]
    MissingCredential,
    /// GitHub answered with a non-2xx status. `body` is for logs only.
    #[error("GitHub returned {status}")]
    Upstream { status: StatusCode, body: String },
    #[error("request to GitHub failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("unexpected JIT config response: {0}")]
    MalformedResponse(String),
}

/// Mints JIT runner registrations.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Ask for one JIT config for the repository at `repository_url`
    /// (the repository's API URL).
    async fn exchange(
        &self,
        repository_url: &str,
        request: &JitConfigRequest,
    ) -> Result<JitToken, TokenError>;
}

/// GitHub REST client authenticated with a long-lived token.
#[derive(Clone)]
pub struct GithubClient {
    token: Option<SecretString>,
    http: reqwest::Client,
}

impl GithubClient {
    pub fn new(token: Option<SecretString>, timeout: Duration) -> Result<Self, TokenError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TokenError::Transport)?;
        Ok(Self { token, http })
    }
}

pub fn jitconfig_url(repository_url: &str) -> String {
    format!(
        "{}/actions/runners/generate-jitconfig",
        repository_url.trim_end_matches('/')
    )
}

#[async_trait]
impl TokenIssuer for GithubClient {
    async fn exchange(
        &self,
        repository_url: &str,
        request: &JitConfigRequest,
    ) -> Result<JitToken, TokenError> {
        let token = self.token.as_ref().ok_or(TokenError::MissingCredential)?;

        let resp = self
            .http
            .post(jitconfig_url(repository_url))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, UA)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()))
            .json(request)
            .send()
            .await
            .map_err(TokenError::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TokenError::Upstream { status, body });
        }

        let bytes = resp.bytes().await.map_err(TokenError::Transport)?;
        let parsed: JitConfigResponse = serde_json::from_slice(&bytes)
            .map_err(|e| TokenError::MalformedResponse(e.to_string()))?;
        if parsed.encoded_jit_config.is_empty() {
            return Err(TokenError::MalformedResponse("empty encoded_jit_config".into()));
        }

        Ok(JitToken::new(
            parsed.encoded_jit_config,
            parsed.runner.map(|r| r.id),
        ))
    }
}
