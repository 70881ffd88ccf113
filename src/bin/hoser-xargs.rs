//! hoser-xargs: spawn one command per stdin line
//!
//! Each line read from stdin is substituted for the replacement token in
//! the command arguments and the command is run concurrently. Failures are
//! reported on stderr; the children inherit stdout and stderr.

use clap::Parser;
use std::io::{self, BufRead};
use std::process::Command;
use std::thread;
use tracing::error;

#[derive(Parser, Debug)]
#[command(
    name = "hoser-xargs",
    about = "Run a command for every line of stdin"
)]
struct Args {
    /// Replacement token (token will be replaced with line in stdin)
    #[arg(short = 'I', default_value = "{}")]
    replace: String,

    /// Command and arguments to run per line
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut children = Vec::new();

    let stdin = io::stdin().lock();
    for (lineno, line) in stdin.lines().enumerate() {
        let Ok(line) = line else { break };
        let argv: Vec<String> = args
            .command
            .iter()
            .map(|arg| arg.replace(&args.replace, &line))
            .collect();
        children.push(thread::spawn(move || run_line(lineno + 1, &argv)));
    }

    for child in children {
        let _ = child.join();
    }
}

fn run_line(lineno: usize, argv: &[String]) {
    match Command::new(&argv[0]).args(&argv[1..]).status() {
        Ok(status) if status.success() => {}
        Ok(status) => error!("[line {}] exited: {}", lineno, status),
        Err(err) => error!("[line {}] start failed: {}", lineno, err),
    }
}
