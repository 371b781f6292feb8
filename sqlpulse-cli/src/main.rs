//! sqlpulse CLI.
//!
//! Subcommands:
//! - `run`     — run the agent in the foreground until stopped
//! - `version` — print the version and exit
//!
//! The basedir defaults to `/var/lib/sqlpulse` and can be overridden
//! with `--basedir` or the `SQLPULSE_BASEDIR` environment variable.

mod error;
mod runner;

use clap::{Parser, Subcommand};
use error::CliError;

const DEFAULT_BASEDIR: &str = "/var/lib/sqlpulse";

#[derive(Parser)]
#[command(name = "sqlpulse")]
#[command(version = sqlpulse::VERSION)]
#[command(about = "MySQL observability agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground
    Run {
        /// Base directory (config/, data/, log/)
        #[arg(long, env = "SQLPULSE_BASEDIR", default_value = DEFAULT_BASEDIR)]
        basedir: String,
    },
    /// Print the version and exit
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { basedir } => run(&basedir).await,
        Commands::Version => {
            println!("sqlpulse {}", sqlpulse::VERSION);
            Ok(())
        }
    };
    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(basedir: &str) -> Result<(), CliError> {
    let dir = sqlpulse::basedir::Basedir::init(basedir)?;
    let _logging = runner::init_logging(&dir)?;
    runner::run_agent(basedir).await
}
