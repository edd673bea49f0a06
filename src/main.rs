use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use tracegraph::cli::{Cli, Command};
use tracegraph::error::exit_code;
use tracegraph::replay::StopFlag;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<tracegraph::Error>() {
                ExitCode::from(err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .parse_default_env()
        .init();

    // Validate CLI arguments
    cli.validate()
        .map_err(tracegraph::Error::InvalidArgument)
        .context("Invalid arguments")?;

    match &cli.command {
        Command::Graph(args) => {
            let stop = StopFlag::new();
            let flag = stop.clone();
            ctrlc::set_handler(move || flag.request())
                .context("Failed to set Ctrl-C handler")?;

            let stdout = std::io::stdout();
            let mut out = std::io::BufWriter::new(stdout.lock());
            tracegraph::commands::graph::run(args, stop, &mut out)
                .with_context(|| format!("Failed to build graph of '{}'", args.function))?;
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "tracegraph", &mut std::io::stdout());
        }
    }

    Ok(())
}
