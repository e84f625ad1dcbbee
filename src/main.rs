use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;
mod compress;
mod error;
mod exclude;
mod job;
mod progress;
mod publish;
mod tar_stream;
mod threads;

use cli::Args;
use error::Result;

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.kind() == ErrorKind::DisplayVersion => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            // Argument errors share the failure exit code with everything else.
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    if args.wants_help() {
        println!("{}", Args::help_text());
        return ExitCode::from(1);
    }

    init_logging(args.log_level());

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err.format_detailed());
            ExitCode::from(err.exit_code())
        }
    }
}

fn init_logging(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn run(args: Args) -> Result<()> {
    let job = args.into_job()?;
    debug!(?job, "archive job configured");
    job::run(&job)?;
    Ok(())
}
