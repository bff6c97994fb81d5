//! Command line handling shared by both binaries: `-a help|start|test` and `-h`.
use std::{future::Future, process::ExitCode};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tokio::process::Command;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Print usage and exit
    Help,
    /// Run the service until interrupted
    Start,
    /// Run the test suite
    Test,
}

#[derive(Debug, Parser)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// What to do
    #[arg(short = 'a', long = "action", value_enum)]
    action: Option<Action>,

    /// Print usage and exit
    #[arg(short = 'h', long = "help", action = ArgAction::SetTrue)]
    help: bool,
}

pub fn usage(program: &str) -> String {
    format!(
        "Usage: {program} -a <start/test>\n\
         \n\
         Options:\n  \
           -a, --action <ACTION>  help, start or test\n  \
           -h, --help             print this message"
    )
}

/// Picks the action for `args`, including the program name. Anything unusable falls back to
/// [`Action::Help`] after reporting the arguments it could not make sense of.
pub fn parse_action(args: &[String]) -> Action {
    match Cli::try_parse_from(args) {
        Ok(Cli { help: true, .. }) => Action::Help,
        Ok(Cli {
            action: Some(action),
            ..
        }) => action,
        Ok(Cli { action: None, .. }) | Err(_) => {
            eprintln!("Invalid command found in {args:?}");
            Action::Help
        }
    }
}

async fn run_tests() -> Result<ExitCode> {
    info!("running test suite");
    let status = Command::new("cargo")
        .arg("test")
        .status()
        .await
        .context("failed to run cargo test")?;

    if status.success() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(%status, "test suite failed");
        let code = status.code().and_then(|code| u8::try_from(code).ok());
        Ok(ExitCode::from(code.unwrap_or(1)))
    }
}

/// Runs whatever `args` asks for, `start` being the service itself.
pub async fn dispatch<F, Fut>(args: Vec<String>, start: F) -> Result<ExitCode>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let program = args.first().map_or("powerflow", String::as_str);

    match parse_action(&args) {
        Action::Help => {
            println!("{}", usage(program));
            Ok(ExitCode::SUCCESS)
        }
        Action::Start => {
            start().await?;
            Ok(ExitCode::SUCCESS)
        }
        Action::Test => run_tests().await,
    }
}
