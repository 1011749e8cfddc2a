use anyhow::Result;
use clap::Parser;
use proposal_scheduler::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("proposal_scheduler=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    cli::run(args).await
}
