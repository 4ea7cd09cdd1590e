use anyhow::{bail, Context, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;

/// Actions runner release baked into the image.
pub const RUNNER_VERSION: &str = "2.311.0";

pub const DOCKERFILE: &str = include_str!("../../docker/runner.Dockerfile");

pub fn default_tag(runner_version: &str) -> String {
    format!("github-actions-runner:{}", runner_version)
}

/// `docker build` arguments; the Dockerfile itself is fed on stdin.
pub fn build_args(tag: &str, runner_version: &str) -> Vec<String> {
    vec![
        "build".into(),
        "--tag".into(),
        tag.into(),
        "--build-arg".into(),
        format!("RUNNER_VERSION={}", runner_version),
        "-".into(),
    ]
}

/// Builds the runner image with the local docker CLI.
pub async fn build_image(docker_bin: &str, tag: &str, runner_version: &str) -> Result<()> {
    let docker = which::which(docker_bin)
        .with_context(|| format!("{} not found in PATH", docker_bin))?;

    tracing::info!("building runner image {} (runner v{})", tag, runner_version);
    let mut child = TokioCommand::new(docker)
        .args(build_args(tag, runner_version))
        .stdin(Stdio::piped())
        .spawn()
        .context("failed to spawn docker build")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(DOCKERFILE.as_bytes()).await?;
    }

    let status = child.wait().await?;
    if !status.success() {
        bail!("docker build for {} failed with {}", tag, status);
    }
    tracing::info!("runner image {} built", tag);
    Ok(())
}
