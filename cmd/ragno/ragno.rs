mod cli;
mod export;

use clap::Parser;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = cli::CLI::parse();
    cli::run(cli).await
}
