//! See <https://github.com/matklad/cargo-xtask/>
//!
//! This binary defines auxiliary commands that are not expressible with just
//! `cargo`. It is wired into the `cargo` command line by the alias in
//! `.cargo/config.toml`.

use clap::Parser;

mod containers;
mod integration;
mod prelude;

/// Development tasks for the gopro repository
#[derive(Debug, Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for gopro", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: Global,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, clap::Args)]
pub struct Global {
    /// Silence the command output
    #[clap(long, global = true)]
    pub silent: bool,
}

impl Global {
    pub fn is_silent(&self) -> bool {
        self.silent
    }
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run the Redis-backed test suite against a real server
    Integration(integration::IntegrationCommand),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Integration(integration_cmd) => {
            integration::run(integration_cmd, cli.global).await?;
        }
    }

    Ok(())
}
