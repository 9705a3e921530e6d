use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use screensync::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // SIGINT and SIGTERM both start a graceful shutdown
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || signal.cancel()) {
        eprintln!("screensync: cannot install signal handler: {}", e);
        return ExitCode::from(1);
    }

    ExitCode::from(cli::execute(cli, shutdown).await)
}
