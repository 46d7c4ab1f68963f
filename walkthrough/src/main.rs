mod demos;
mod raw;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use engine::Protection;
use tracing_subscriber::EnvFilter;

/// Runs small machine code routines inside this process.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Run a single walkthrough instead of all of them
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=5), conflicts_with = "code")]
    example: Option<u8>,

    /// Raw machine code to load and call, entry at byte 0
    #[arg(long, value_name = "FILE")]
    code: Option<PathBuf>,

    /// Integer argument for --code, repeat for more
    #[arg(long = "arg", value_name = "INT", allow_negative_numbers = true, requires = "code")]
    args: Vec<i64>,

    /// Protection of loaded code for --code and walkthroughs 1-4 (walkthrough 5 always runs rwx)
    #[arg(long, value_enum, default_value_t = Exec::Rx)]
    protection: Exec,

    /// Log filter, e.g. `engine=trace`
    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Exec {
    Rx,
    Rwx,
}

impl From<Exec> for Protection {
    fn from(exec: Exec) -> Self {
        match exec {
            Exec::Rx => Protection::ExecuteRead,
            Exec::Rwx => Protection::ExecuteReadWrite,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log).with_context(|| format!("invalid log filter `{}`", cli.log))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.code {
        let value = raw::run_file(path, &cli.args, cli.protection.into())?;
        println!("{} return value: {value}", path.display());
        return Ok(());
    }

    let examples = match cli.example {
        Some(n) => vec![n],
        None => (1..=5).collect(),
    };
    for n in examples {
        let outcome = demos::run(n, cli.protection.into()).with_context(|| format!("Example{n} failed"))?;
        println!("{outcome}");
    }
    Ok(())
}

#[test]
fn test_cli_parses_negative_arguments() {
    let cli = Cli::try_parse_from(["walkthrough", "--code", "add.bin", "--arg", "10", "--arg", "-15"]).unwrap();
    assert_eq!(cli.args, [10, -15]);
    assert_eq!(cli.protection, Exec::Rx);
}

#[test]
fn test_cli_protection_applies_to_walkthroughs() {
    let cli = Cli::try_parse_from(["walkthrough", "-e", "3", "--protection", "rwx"]).unwrap();
    assert_eq!(cli.example, Some(3));
    assert_eq!(Protection::from(cli.protection), Protection::ExecuteReadWrite);
}

#[test]
fn test_cli_rejects_unknown_example() {
    assert!(Cli::try_parse_from(["walkthrough", "-e", "6"]).is_err());
    assert!(Cli::try_parse_from(["walkthrough", "--arg", "1"]).is_err());
}
