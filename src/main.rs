//! hoser: execute one named pipe from a plan file
//!
//! Usage:
//!   hoser [-d] file.json[:pipename]
//!
//! The caller's standard streams are preset onto the `stdin`, `stdout` and
//! `stderr` variables. Exits zero only when every child exited cleanly.

use clap::Parser;
use hoser::{Program, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::os::fd::OwnedFd;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hoser", about = "Execute a dataflow plan of OS processes")]
struct Args {
    /// Plan file with an optional pipe name, e.g. plan.json:main
    target: String,

    /// Print debug information to stderr
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("debug"))
            .with_writer(std::io::stderr)
            .init();
    }

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("hoser: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<bool, Box<dyn std::error::Error>> {
    let (path, pipe_name) = split_target(&args.target)?;

    let file = File::open(path).map_err(|err| format!("open '{path}': {err}"))?;
    let pipes = hoser::plan::parse(BufReader::new(file))
        .map_err(|err| format!("invalid hoser pipe file '{path}': {err}"))?;

    let pipe = match pipe_name {
        None => pipes.first().ok_or_else(|| format!("no pipes in '{path}'"))?,
        Some(name) => pipes
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| format!("no pipe with name '{name}' found in '{path}'"))?,
    };

    let mut presets = BTreeMap::new();
    presets.insert(
        "stdin".to_string(),
        Value::Stream(OwnedFd::from(os_pipe::dup_stdin()?)),
    );
    presets.insert(
        "stdout".to_string(),
        Value::Stream(OwnedFd::from(os_pipe::dup_stdout()?)),
    );
    presets.insert(
        "stderr".to_string(),
        Value::Stream(OwnedFd::from(os_pipe::dup_stderr()?)),
    );

    let mut program = Program::build(pipe, presets)?;
    program.start();
    let codes = program.wait();
    Ok(codes.values().all(|&code| code == 0))
}

/// Split `file[:pipename]` into its parts
fn split_target(target: &str) -> Result<(&str, Option<&str>), String> {
    let mut parts = target.split(':');
    let path = parts.next().filter(|p| !p.is_empty()).ok_or("no plan file specified")?;
    let pipe = parts.next().filter(|p| !p.is_empty());
    if parts.next().is_some() {
        return Err("path has too many parts, expected only file.json:pipe".to_string());
    }
    Ok((path, pipe))
}
