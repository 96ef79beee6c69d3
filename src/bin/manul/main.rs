//! Entry point: parse arguments, build the supervisor, run it.

use clap::Parser;

use manul::cli::Cli;
use manul::error::Result;
use manul::supervisor::Supervisor;

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    #[cfg(windows)]
    if let Some(slot) = cli.worker_slot {
        return manul::supervisor::run_worker_slot(cli, slot);
    }

    let supervisor = Supervisor::new(cli)?;
    supervisor.run()
}
