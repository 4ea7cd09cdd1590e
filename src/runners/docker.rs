use std::process::Stdio;

use secrecy::ExposeSecret;
use tokio::process::Command as TokioCommand;

use super::{LaunchError, SandboxHandle, SandboxLauncher, SandboxSpec};

/// Grace period between the timeout's TERM and KILL.
const KILL_AFTER: &str = "--kill-after=30s";

/// Launches each sandbox as a detached, self-removing Docker container.
pub struct DockerLauncher {
    docker_bin: String,
}

impl DockerLauncher {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }
}

/// `docker run` arguments for `spec`.
///
/// Env entries are passed as bare `--env NAME`; docker copies the value from
/// its own environment, so secrets stay out of argv.
pub fn run_args(spec: &SandboxSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--detach".into(),
        "--rm".into(),
        "--name".into(),
        spec.name.clone(),
        "--user".into(),
        spec.user.clone(),
        "--workdir".into(),
        spec.workdir.clone(),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }
    for (key, _) in &spec.env {
        args.push("--env".into());
        args.push(key.clone());
    }
    args.push(spec.image.clone());

    // coreutils timeout bounds the container's life independently of this process
    args.push("timeout".into());
    args.push(KILL_AFTER.into());
    args.push(format!("{}s", spec.timeout.as_secs().max(1)));
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait::async_trait]
impl SandboxLauncher for DockerLauncher {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn launch(&self, spec: SandboxSpec) -> Result<SandboxHandle, LaunchError> {
        let docker = which::which(&self.docker_bin)
            .map_err(|_| LaunchError::RuntimeUnavailable(self.docker_bin.clone()))?;

        let mut cmd = TokioCommand::new(docker);
        cmd.args(run_args(&spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            cmd.env(key, value.expose_secret());
        }

        tracing::debug!("docker run for sandbox {} from {}", spec.name, spec.image);
        let output = cmd.output().await.map_err(LaunchError::Spawn)?;

        if !output.status.success() {
            return Err(LaunchError::Rejected {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // docker run --detach prints the container id
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(SandboxHandle { id })
    }
}
