use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runner_dispatch::config::{self, Config};
use runner_dispatch::dispatch::Dispatcher;
use runner_dispatch::ghapp::GithubClient;
use runner_dispatch::runners::docker::DockerLauncher;
use runner_dispatch::runners::image;
use runner_dispatch::server::{self, AppState};
use runner_dispatch::signature;

#[derive(Parser, Debug)]
#[command(name = "runner-dispatch", version, about = "Just-in-time GitHub Actions runner dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen for workflow_job webhooks
    Serve {
        /// Listener host and port
        #[arg(long, env = "BIND_ADDR", default_value = config::DEFAULT_BIND)]
        bind: String,
    },
    /// Build the runner sandbox image with the local docker CLI
    BuildImage {
        /// Image tag (defaults to github-actions-runner:<runner-version>)
        #[arg(long)]
        tag: Option<String>,
        /// Actions runner release to bake in
        #[arg(long, default_value = image::RUNNER_VERSION)]
        runner_version: String,
        #[arg(long, env = "DOCKER_BIN", default_value = config::DEFAULT_DOCKER_BIN)]
        docker_bin: String,
    },
    /// Print the X-Hub-Signature-256 value for a payload file
    Sign {
        /// Environment variable holding the webhook secret
        #[arg(long, default_value = "WEBHOOK_SECRET")]
        secret_env: String,
        /// Payload file, byte-for-byte as it will be sent
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("DISPATCH_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve { bind } => cmd_serve(bind).await?,
        Commands::BuildImage {
            tag,
            runner_version,
            docker_bin,
        } => {
            let tag = tag.unwrap_or_else(|| image::default_tag(&runner_version));
            image::build_image(&docker_bin, &tag, &runner_version).await?
        }
        Commands::Sign { secret_env, file } => cmd_sign(&secret_env, &file)?,
    }
    Ok(())
}

async fn cmd_serve(bind: String) -> Result<()> {
    let config = Arc::new(Config::from_env().context("loading configuration")?);
    tracing::info!(
        "runner group {} labels {:?}, image {}, timeout {}s",
        config.runner.group_id,
        config.runner.labels,
        config.sandbox.image,
        config.sandbox.timeout.as_secs()
    );

    let github = GithubClient::new(config.github.token.clone(), config.github.timeout)
        .context("building GitHub client")?;
    let launcher = DockerLauncher::new(config.sandbox.docker_bin.clone());
    let dispatcher = Dispatcher::new(config, Arc::new(github), Arc::new(launcher));

    server::serve(&bind, AppState::new(dispatcher)).await
}

fn cmd_sign(secret_env: &str, file: &str) -> Result<()> {
    let _ = dotenv::dotenv();
    let secret = std::env::var(secret_env)
        .ok()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("{} is not set", secret_env))?;
    let body = std::fs::read(file).with_context(|| format!("reading {}", file))?;
    println!("{}", signature::sign(secret.as_bytes(), &body));
    Ok(())
}
