use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pickle_array::{convert, ConvertOptions, Error};

/// Dump the array held in a pickled record to a raw binary file
#[derive(Parser, Debug)]
#[command(name = "convert")]
#[command(version, about, long_about = None)]
struct Args {
    /// pickle file to read
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// record field holding the array
    #[arg(short, long, default_value = "image", value_name = "NAME")]
    field: String,

    /// output file, defaults to the input path with .pickle replaced by .bin
    #[arg(short, long, value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// also write a JSON header (shape, dtype, order) next to the output
    #[arg(long)]
    header: bool,

    /// debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pickle_array={log_level},convert={log_level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(io::stderr().is_terminal())
                .with_writer(io::stderr),
        )
        .init();

    if let Err(err) = run(&args) {
        // reported outside the log filter
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: &Args) -> Result<()> {
    let options = ConvertOptions {
        field: args.field.clone(),
        output: args.output.clone(),
        write_header: args.header,
    };

    let mut stdout = io::stdout().lock();
    let conversion = convert(&args.input, &options, &mut stdout).map_err(|err: Error| {
        let step = err.kind();
        anyhow::Error::new(err).context(format!("{step} step failed for {}", args.input.display()))
    })?;
    stdout.flush().context("failed to flush standard output")?;

    tracing::debug!(
        output = %conversion.output.display(),
        bytes = conversion.bytes_written,
        "conversion done"
    );
    Ok(())
}
