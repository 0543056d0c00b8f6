use clap::Parser;
use log::info;
use lupin::cli::{iwae, rws, Cli, Commands};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Iwae(args) => {
            iwae::run(args)?;
        }
        Commands::Rws(args) => {
            rws::run(args)?;
        }
    }

    info!("Done");
    Ok(())
}
