use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tracegraph")]
#[command(about = "Call graphs of recorded function traces")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the call graph of a function from recorded trace data
    Graph(GraphArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct GraphArgs {
    /// Function whose calls are aggregated
    #[arg(default_value = "main")]
    pub function: String,

    /// Trace data directory
    #[arg(long, short = 'd', default_value = "uftrace.data")]
    pub data: PathBuf,

    /// Maximum call depth to trace and print
    #[arg(long, short = 'D', default_value = "1024")]
    pub depth: i32,

    /// Hide calls shorter than this (e.g. 10us, 2ms; bare numbers are ns)
    #[arg(long, short = 't', value_parser = parse_time)]
    pub time_filter: Option<u64>,

    /// Only replay these threads
    #[arg(long, value_delimiter = ',')]
    pub tid: Vec<u32>,

    /// Function filters, `name;!name`
    #[arg(long, short = 'F')]
    pub filter: Option<String>,

    /// Function triggers, `name@action,...;...`
    #[arg(long, short = 'T')]
    pub trigger: Option<String>,
}

/// Parse a duration into nanoseconds
fn parse_time(s: &str) -> Result<u64, String> {
    // Bare number as nanoseconds
    if let Ok(nsec) = s.parse::<u64>() {
        return Ok(nsec);
    }

    if let Ok(d) = humantime::parse_duration(s) {
        return u64::try_from(d.as_nanos()).map_err(|_| format!("Duration '{}' is too large", s));
    }

    Err(format!(
        "Invalid time '{}'. Examples: 500ns, 10us, 2ms, 1s, 1500",
        s
    ))
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Command::Graph(args) = &self.command {
            if args.depth <= 0 {
                return Err(format!("Depth must be positive, got {}", args.depth));
            }
            if args.function.is_empty() {
                return Err("Function name must not be empty".to_string());
            }
        }

        Ok(())
    }

    /// Default log filter for the requested verbosity
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
