use std::process::ExitCode;

use clap::Parser;

use ferret_lib::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    ferret_lib::init_logging(cli.verbose);

    match ferret_lib::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
