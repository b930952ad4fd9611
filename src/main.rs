//! testrig - test execution orchestrator
//!
//! Loads test assemblies into isolated contexts or agent processes, runs
//! them and reports results on the console.

use clap::Parser;
use testrig::common::logging;
use testrig::{agency, cli, commands};
use commands::Commands;

#[derive(Parser)]
#[command(name = "testrig", about = "Run tests in isolated contexts or agent processes")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (result, guard) = match cli.command {
        Commands::Agent { agency, agent_id } => {
            let (log_path, guard) = logging::init_agent();
            if let Some(path) = &log_path {
                tracing::debug!(path = %path.display(), "Agent log file");
            }
            (agency::run_agent(&agency, agent_id).await.map(|()| 0), guard)
        }
        command => {
            logging::init_cli();
            (cli::dispatch(command).await, None)
        }
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };

    // Flush buffered log lines before exiting
    drop(guard);
    std::process::exit(code);
}
