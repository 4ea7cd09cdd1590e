pub mod docker;
pub mod image;

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

/// Environment variable the runner entry command reads its JIT config from.
pub const JIT_CONFIG_ENV: &str = "GHA_JIT_CONFIG";

/// Copies the pre-installed runner into the home directory and starts it
/// ephemerally with the injected JIT config.
pub const RUNNER_ENTRY_COMMAND: &str =
    r#"cp -r /actions-runner/* ~/ && ./run.sh --jitconfig "$GHA_JIT_CONFIG""#;

/// One sandbox to create. Values in `env` reach the sandbox as process
/// environment and never appear in any command line.
#[derive(Debug)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, SecretString)>,
    pub timeout: Duration,
    pub user: String,
    pub workdir: String,
    pub labels: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{0} not found in PATH")]
    RuntimeUnavailable(String),
    #[error("failed to start sandbox runtime: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("sandbox runtime exited with {status}: {stderr}")]
    Rejected { status: String, stderr: String },
}

/// Creates sandboxes. Returns once the sandbox is running; the job inside
/// it is not awaited.
#[async_trait::async_trait]
pub trait SandboxLauncher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn launch(&self, spec: SandboxSpec) -> Result<SandboxHandle, LaunchError>;
}

/// `bash -c` invocation of the runner entry command.
pub fn runner_command() -> Vec<String> {
    vec![
        "bash".to_string(),
        "-c".to_string(),
        RUNNER_ENTRY_COMMAND.to_string(),
    ]
}
