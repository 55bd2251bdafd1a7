use std::{
    io::{self, BufRead, Write},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::Parser;
use task_estimate::NomMarkdownParser;
use task_estimate::process_markdown;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "task-estimate",
    about = "Roll child hour estimates up into their parents in a Markdown outline read from stdin",
    version
)]
struct Cli {
    /// Trace every parsed item and estimate update to stderr.
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let stdin = io::stdin();
    let stdout = io::stdout();
    match run(stdin.lock(), stdout.lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("failed to process markdown: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "task_estimate=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Read the whole document, process it, and only then write the result.
fn run<R: BufRead, W: Write>(input: R, mut output: W) -> Result<()> {
    let markdown = read_document(input)?;
    let updated = process_markdown(&NomMarkdownParser, &markdown)?;
    output
        .write_all(updated.as_bytes())
        .context("writing output")?;
    output.flush().context("flushing output")?;
    Ok(())
}

/// Accumulate input lines until EOF, re-terminating each with `\n`.
fn read_document<R: BufRead>(input: R) -> Result<String> {
    let mut markdown = String::new();
    for line in input.lines() {
        let line = line.context("reading input")?;
        markdown.push_str(&line);
        markdown.push('\n');
    }
    Ok(markdown)
}
