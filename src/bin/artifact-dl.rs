use std::env;
use std::process::ExitCode;

use artifact_dl::cli::{self, Exit, parse_args, print_usage};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let invocation = match parse_args(&args) {
        Ok(invocation) => invocation,
        Err(message) => {
            eprintln!("Error: {message}");
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match cli::run(invocation).await {
        Ok(Exit::Success) => ExitCode::SUCCESS,
        Ok(Exit::Failure) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
