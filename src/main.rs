mod bundles;
mod cli;
mod config;
mod error;
mod executor;
mod lock;
mod orchestrator;
mod planner;
mod recovery;
mod session;
mod state;
mod steplog;

use std::time::Instant;

use chrono::Local;
use flexi_logger::Logger;
use log::{error, info};

use cli::Cli;

fn main() {
    let _logger = Logger::try_with_env_or_str("pgevodb=info")
        .expect("Invalid log specification")
        .start()
        .expect("Failed to start logger");

    let start = Instant::now();
    let now = Local::now();
    info!("pgevodb starting at {}", now.format("%Y-%m-%d %H:%M:%S"));

    let result = Cli::handle_command_line();

    let duration = start.elapsed();

    match result {
        Ok(()) => {
            info!("pgevodb completed successfully in {:.2?}", duration);
        }
        Err(err) => {
            error!("pgevodb exited with error in {:.2?}", duration);
            error!("{:?}", err);
            eprintln!("Error: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}
