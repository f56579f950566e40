use clap::Parser;
use ironcoin::{Cli, CliHandler};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = CliHandler::run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
