//! The webhook handler: verify → request JIT config → launch sandbox.
//!
//! Each delivery is handled independently. The only shared state is the
//! immutable [`Config`] and the two capability clients.

use std::sync::Arc;

use crate::config::Config;
use crate::error::DispatchError;
use crate::ghapp::{TokenError, TokenIssuer};
use crate::models::{DispatchOutcome, JitConfigRequest, JobId, WebhookPayload};
use crate::runners::{runner_command, SandboxLauncher, SandboxSpec, JIT_CONFIG_ENV};
use crate::signature;

/// Event name GitHub sends for workflow job lifecycle deliveries.
pub const WORKFLOW_JOB_EVENT: &str = "workflow_job";

const JOB_ID_LABEL: &str = "runner-dispatch.job-id";

/// One inbound delivery, as received.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub signature: Option<&'a str>,
    /// `X-GitHub-Event`, when the caller sent one.
    pub event: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<Config>,
    issuer: Arc<dyn TokenIssuer>,
    launcher: Arc<dyn SandboxLauncher>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        issuer: Arc<dyn TokenIssuer>,
        launcher: Arc<dyn SandboxLauncher>,
    ) -> Self {
        Self {
            config,
            issuer,
            launcher,
        }
    }

    pub async fn handle(&self, delivery: Delivery<'_>) -> Result<DispatchOutcome, DispatchError> {
        if let Err(e) = signature::verify(
            self.config.webhook.secret.as_ref(),
            delivery.signature,
            delivery.body,
        ) {
            tracing::error!("rejecting delivery: {}", e);
            return Err(e.into());
        }

        let payload: WebhookPayload = serde_json::from_slice(delivery.body).map_err(|e| {
            tracing::error!("failed to parse JSON payload: {}", e);
            DispatchError::InvalidPayload(e)
        })?;

        if let Some(event) = delivery.event {
            if event != WORKFLOW_JOB_EVENT {
                tracing::debug!("ignoring {} event", event);
                return Ok(DispatchOutcome::Ignored);
            }
        }
        if !payload.is_queued() {
            tracing::debug!(
                "ignoring workflow_job action {:?}",
                payload.action.as_deref().unwrap_or("")
            );
            return Ok(DispatchOutcome::Ignored);
        }

        let job_id = payload.job_id();
        tracing::Span::current().record("job_id", tracing::field::display(&job_id));
        let repo_url = payload.repository_url().ok_or_else(|| {
            tracing::error!("missing repository URL in payload for job {}", job_id);
            DispatchError::MissingRepositoryUrl
        })?;
        check_repository_url(repo_url)?;

        self.provision(repo_url, job_id).await
    }

    async fn provision(
        &self,
        repo_url: &str,
        job_id: JobId,
    ) -> Result<DispatchOutcome, DispatchError> {
        let runner = &self.config.runner;
        let request = JitConfigRequest {
            name: runner_name(&runner.name_prefix, &job_id),
            runner_group_id: runner.group_id,
            labels: runner.labels.clone(),
            work_directory: runner.work_directory.clone(),
        };

        tracing::info!("requesting JIT config for job {}", job_id);
        let token = self
            .issuer
            .exchange(repo_url, &request)
            .await
            .map_err(|e| {
                match &e {
                    TokenError::Upstream { status, body } => tracing::error!(
                        "GitHub API error for job {} ({}): {}",
                        job_id,
                        status,
                        body
                    ),
                    other => tracing::error!(
                        "unexpected error calling GitHub API for job {}: {}",
                        job_id,
                        other
                    ),
                }
                DispatchError::from(e)
            })?;
        if let Some(runner_id) = token.runner_id {
            tracing::debug!("GitHub registered runner {} for job {}", runner_id, job_id);
        }

        let sandbox = &self.config.sandbox;
        let mut env = Vec::with_capacity(1 + sandbox.forwarded_env.len());
        env.push((JIT_CONFIG_ENV.to_string(), token.into_secret()));
        env.extend(sandbox.forwarded_env.iter().cloned());

        let spec = SandboxSpec {
            name: request.name,
            image: sandbox.image.clone(),
            command: runner_command(),
            env,
            timeout: sandbox.timeout,
            user: sandbox.user.clone(),
            workdir: sandbox.workdir.clone(),
            labels: vec![(JOB_ID_LABEL.to_string(), job_id.to_string())],
        };

        tracing::info!("spawning {} sandbox for job {}", self.launcher.name(), job_id);
        let handle = self.launcher.launch(spec).await.map_err(|e| {
            tracing::error!("failed to create sandbox for job {}: {}", job_id, e);
            DispatchError::from(e)
        })?;
        tracing::info!("sandbox {} running job {}", handle.id, job_id);

        Ok(DispatchOutcome::Provisioned { job_id })
    }
}

/// `<prefix>-<job id>`, restricted to characters docker accepts in a
/// container name since the same string names the sandbox.
fn runner_name(prefix: &str, job_id: &JobId) -> String {
    format!("{}-{}", prefix, job_id)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn check_repository_url(raw: &str) -> Result<(), DispatchError> {
    match url::Url::parse(raw) {
        Ok(u) if matches!(u.scheme(), "http" | "https") && u.has_host() => Ok(()),
        _ => {
            tracing::error!("repository URL {:?} is not an http(s) URL", raw);
            Err(DispatchError::InvalidRepositoryUrl(raw.to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{GithubConfig, RunnerConfig, SandboxConfig, WebhookConfig};
    use crate::ghapp::JitToken;
    use crate::runners::{LaunchError, SandboxHandle};
    use crate::signature::{sign, SignatureError};
    use axum::http::StatusCode;
    use secrecy::{ExposeSecret, SecretString};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    pub(crate) const SECRET: &str = "webhook-secret";
    pub(crate) const QUEUED: &str = r#"{"action":"queued","repository":{"url":"https://api.example.com/repos/o/r"},"workflow_job":{"id":42}}"#;
    pub(crate) const COMPLETED: &str = r#"{"action":"completed","repository":{"url":"https://api.example.com/repos/o/r"},"workflow_job":{"id":42}}"#;

    /// Records every exchange and answers with a fixed result.
    pub(crate) struct StubIssuer {
        pub calls: Mutex<Vec<(String, JitConfigRequest)>>,
        reply: Box<dyn Fn() -> Result<JitToken, TokenError> + Send + Sync>,
    }

    impl StubIssuer {
        pub fn ok(jit: &'static str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                reply: Box::new(move || Ok(JitToken::new(jit, Some(7)))),
            }
        }

        pub fn upstream(status: StatusCode) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                reply: Box::new(move || {
                    Err(TokenError::Upstream {
                        status,
                        body: "{\"message\":\"Validation Failed\"}".into(),
                    })
                }),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl TokenIssuer for StubIssuer {
        async fn exchange(
            &self,
            repository_url: &str,
            request: &JitConfigRequest,
        ) -> Result<JitToken, TokenError> {
            self.calls
                .lock()
                .unwrap()
                .push((repository_url.to_string(), request.clone()));
            (self.reply)()
        }
    }

    /// What a launch saw, with env values exposed for assertions.
    #[derive(Debug, Clone)]
    pub(crate) struct Launched {
        pub name: String,
        pub image: String,
        pub command: Vec<String>,
        pub env: Vec<(String, String)>,
        pub timeout: Duration,
        pub labels: Vec<(String, String)>,
    }

    pub(crate) struct StubLauncher {
        pub launches: Mutex<Vec<Launched>>,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    impl StubLauncher {
        pub fn ok() -> Self {
            Self {
                launches: Mutex::new(Vec::new()),
                fail: false,
                gate: None,
            }
        }

        /// Holds every launch until `gate` is notified.
        pub fn gated(gate: Arc<Notify>) -> Self {
            Self {
                launches: Mutex::new(Vec::new()),
                fail: false,
                gate: Some(gate),
            }
        }

        pub fn failing() -> Self {
            Self {
                launches: Mutex::new(Vec::new()),
                fail: true,
                gate: None,
            }
        }

        pub fn calls(&self) -> usize {
            self.launches.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl SandboxLauncher for StubLauncher {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn launch(&self, spec: SandboxSpec) -> Result<SandboxHandle, LaunchError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.launches.lock().unwrap().push(Launched {
                name: spec.name,
                image: spec.image,
                command: spec.command,
                env: spec
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
                    .collect(),
                timeout: spec.timeout,
                labels: spec.labels,
            });
            if self.fail {
                Err(LaunchError::Rejected {
                    status: "exit status: 125".into(),
                    stderr: "Unable to find image".into(),
                })
            } else {
                Ok(SandboxHandle { id: "c0ffee".into() })
            }
        }
    }

    pub(crate) fn test_config(secret: Option<&str>) -> Config {
        Config {
            webhook: WebhookConfig {
                secret: secret.map(|s| SecretString::from(s.to_string())),
            },
            github: GithubConfig {
                token: Some(SecretString::from("ghp_test".to_string())),
                timeout: Duration::from_secs(5),
            },
            runner: RunnerConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }

    fn dispatcher(
        config: Config,
        issuer: &Arc<StubIssuer>,
        launcher: &Arc<StubLauncher>,
    ) -> Dispatcher {
        Dispatcher::new(Arc::new(config), issuer.clone(), launcher.clone())
    }

    fn signed(body: &str) -> String {
        sign(SECRET.as_bytes(), body.as_bytes())
    }

    async fn run(d: &Dispatcher, sig: Option<&str>, body: &str) -> Result<DispatchOutcome, DispatchError> {
        d.handle(Delivery {
            signature: sig,
            event: None,
            body: body.as_bytes(),
        })
        .await
    }

    #[tokio::test]
    async fn test_queued_job_is_provisioned() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);

        let outcome = run(&d, Some(&signed(QUEUED)), QUEUED).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Provisioned { job_id: JobId::Number(42) });

        let calls = issuer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "https://api.example.com/repos/o/r");
        assert!(calls[0].1.name.contains("42"));
        assert_eq!(calls[0].1.name, "modal-runner-42");
        assert_eq!(calls[0].1.runner_group_id, 1);
        assert_eq!(calls[0].1.labels, vec!["self-hosted", "modal"]);
        assert_eq!(calls[0].1.work_directory, "_work");

        let launches = launcher.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        let launched = &launches[0];
        assert_eq!(launched.name, "modal-runner-42");
        assert_eq!(launched.image, crate::config::DEFAULT_RUNNER_IMAGE);
        assert_eq!(launched.command, runner_command());
        assert_eq!(launched.timeout, Duration::from_secs(3600));
        assert_eq!(
            launched.labels,
            vec![(JOB_ID_LABEL.to_string(), "42".to_string())]
        );
    }

    #[tokio::test]
    async fn test_token_reaches_sandbox_verbatim() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);
        run(&d, Some(&signed(QUEUED)), QUEUED).await.unwrap();

        let launches = launcher.launches.lock().unwrap();
        let values: Vec<&(String, String)> = launches[0]
            .env
            .iter()
            .filter(|(_, v)| v.contains('X'))
            .collect();
        assert_eq!(values, vec![&(JIT_CONFIG_ENV.to_string(), "X".to_string())]);
    }

    #[tokio::test]
    async fn test_forwarded_credentials_join_the_env() {
        let issuer = Arc::new(StubIssuer::ok("jit"));
        let launcher = Arc::new(StubLauncher::ok());
        let mut config = test_config(Some(SECRET));
        config.sandbox.forwarded_env =
            vec![("NPM_TOKEN".to_string(), SecretString::from("npm_1".to_string()))];
        let d = dispatcher(config, &issuer, &launcher);
        run(&d, Some(&signed(QUEUED)), QUEUED).await.unwrap();

        let launches = launcher.launches.lock().unwrap();
        assert_eq!(
            launches[0].env,
            vec![
                (JIT_CONFIG_ENV.to_string(), "jit".to_string()),
                ("NPM_TOKEN".to_string(), "npm_1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_other_actions_are_ignored_without_calls() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);

        for action in ["completed", "in_progress", "waiting", ""] {
            let body = QUEUED.replace("\"queued\"", &format!("\"{}\"", action));
            let outcome = run(&d, Some(&signed(&body)), &body).await.unwrap();
            assert_eq!(outcome, DispatchOutcome::Ignored, "action {action:?}");
        }
        let outcome = run(&d, Some(&signed(COMPLETED)), COMPLETED).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
        // ping deliveries carry no action at all
        let ping = r#"{"zen":"Keep it logically awesome.","hook_id":1}"#;
        assert_eq!(run(&d, Some(&signed(ping)), ping).await.unwrap(), DispatchOutcome::Ignored);

        assert_eq!(issuer.calls(), 0);
        assert_eq!(launcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_workflow_job_events_are_ignored() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);
        let sig = signed(QUEUED);

        let outcome = d
            .handle(Delivery {
                signature: Some(&sig),
                event: Some("check_run"),
                body: QUEUED.as_bytes(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert_eq!(issuer.calls(), 0);

        let outcome = d
            .handle(Delivery {
                signature: Some(&sig),
                event: Some(WORKFLOW_JOB_EVENT),
                body: QUEUED.as_bytes(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Provisioned { .. }));
    }

    #[tokio::test]
    async fn test_bad_signatures_never_reach_github() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);

        let err = run(&d, None, QUEUED).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unauthorized(SignatureError::Missing)));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let wrong = sign(b"not-the-secret", QUEUED.as_bytes());
        let err = run(&d, Some(&wrong), QUEUED).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unauthorized(SignatureError::Mismatch)));

        // signature of a different body
        let err = run(&d, Some(&signed(COMPLETED)), QUEUED).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        // garbage bodies are still an auth failure first
        let err = run(&d, Some("sha256=00"), "not json").await.unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        assert_eq!(issuer.calls(), 0);
        assert_eq!(launcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_secret_rejects_everything() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(None), &issuer, &launcher);

        for sig in [None, Some(signed(QUEUED)), Some(sign(b"", QUEUED.as_bytes()))] {
            let err = run(&d, sig.as_deref(), QUEUED).await.unwrap_err();
            assert!(matches!(
                err,
                DispatchError::Unauthorized(SignatureError::SecretNotConfigured)
            ));
            assert_eq!(err.status(), StatusCode::FORBIDDEN);
        }
        assert_eq!(issuer.calls(), 0);
        assert_eq!(launcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);

        let body = "{\"action\": \"queued\"";
        let err = run(&d, Some(&signed(body)), body).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_or_bad_repository_url() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);

        let body = r#"{"action":"queued","workflow_job":{"id":42}}"#;
        let err = run(&d, Some(&signed(body)), body).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingRepositoryUrl));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let body = r#"{"action":"queued","repository":{"url":"file:///etc"},"workflow_job":{"id":42}}"#;
        let err = run(&d, Some(&signed(body)), body).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRepositoryUrl(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_job_id_uses_placeholder() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);

        let body = r#"{"action":"queued","repository":{"url":"https://api.example.com/repos/o/r"}}"#;
        let outcome = run(&d, Some(&signed(body)), body).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Provisioned { job_id: JobId::unknown() });
        assert_eq!(issuer.calls.lock().unwrap()[0].1.name, "modal-runner-unknown");
    }

    #[tokio::test]
    async fn test_text_job_id_is_made_name_safe() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);

        let body = QUEUED.replace("\"id\":42", "\"id\":\"build / linux:x64\"");
        let outcome = run(&d, Some(&signed(&body)), &body).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Provisioned { job_id: JobId::Text("build / linux:x64".into()) }
        );
        assert_eq!(issuer.calls.lock().unwrap()[0].1.name, "modal-runner-build---linux-x64");

        let launches = launcher.launches.lock().unwrap();
        assert_eq!(launches[0].name, "modal-runner-build---linux-x64");
        assert_eq!(launches[0].labels[0].1, "build / linux:x64");
    }

    #[test]
    fn test_runner_name_keeps_safe_characters() {
        assert_eq!(runner_name("modal-runner", &JobId::Number(42)), "modal-runner-42");
        assert_eq!(runner_name("ci.pool_a", &JobId::unknown()), "ci.pool_a-unknown");
    }

    #[tokio::test]
    async fn test_upstream_failure_skips_launch() {
        let issuer = Arc::new(StubIssuer::upstream(StatusCode::UNPROCESSABLE_ENTITY));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);

        let err = run(&d, Some(&signed(QUEUED)), QUEUED).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.detail(), "Failed to generate JIT config");
        assert_eq!(issuer.calls(), 1);
        assert_eq!(launcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_internal_error() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::failing());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);

        let err = run(&d, Some(&signed(QUEUED)), QUEUED).await.unwrap_err();
        assert!(matches!(err, DispatchError::Launch(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.detail(), "Failed to spawn runner sandbox");
        assert_eq!(issuer.calls(), 1);
        assert_eq!(launcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_each_delivery_gets_its_own_token() {
        let issuer = Arc::new(StubIssuer::ok("X"));
        let launcher = Arc::new(StubLauncher::ok());
        let d = dispatcher(test_config(Some(SECRET)), &issuer, &launcher);
        let sig = signed(QUEUED);

        run(&d, Some(&sig), QUEUED).await.unwrap();
        run(&d, Some(&sig), QUEUED).await.unwrap();
        assert_eq!(issuer.calls(), 2);
        assert_eq!(launcher.calls(), 2);
    }
}
