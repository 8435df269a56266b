use clap::Parser;
use simworker::{cli, logging};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = cli::Cli::parse();
    logging::init(cli.log_json);
    cli::run(cli).await
}
