//! hoser-merge: interleave records from many streams onto stdout
//!
//! Each input is read record by record (up to the separator byte) and every
//! record is copied to stdout atomically, so concurrent producers never
//! interleave mid-record. Stdin supplies the paths of additional streams to
//! merge, one per line, which lets an upstream process hand over pipe paths
//! as it creates them.

use clap::Parser;
use crossbeam_channel::{Sender, unbounded};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::ExitCode;
use std::thread;
use tracing::error;

const MAX_RECORD_SIZE: usize = 48 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "hoser-merge",
    about = "Copy whole records from many input streams to stdout"
)]
struct Args {
    /// Separator for continuous strings that will be copied atomically to
    /// stdout (a single byte)
    #[arg(long, default_value = "\n")]
    sep: String,

    /// Streams to merge
    streams: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.sep.len() != 1 {
        eprintln!("hoser-merge: sep must be exactly 1 byte");
        return ExitCode::FAILURE;
    }
    let sep = args.sep.as_bytes()[0];

    let mut inputs = Vec::new();
    for path in &args.streams {
        match File::open(path) {
            Ok(file) => inputs.push((path.clone(), file)),
            Err(err) => {
                eprintln!("hoser-merge: open '{path}': {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    let (records_tx, records_rx) = unbounded::<Vec<u8>>();
    for (name, input) in inputs {
        let tx = records_tx.clone();
        thread::spawn(move || copy_records(&name, input, sep, &tx));
    }
    thread::spawn(move || watch_stdin(sep, records_tx));

    // Runs until every copier (including those stdin spawns later) is done.
    let mut out = io::stdout().lock();
    for record in records_rx {
        if let Err(err) = out.write_all(&record) {
            error!("output write: {}", err);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

/// Read stream paths from stdin, spawning a copier for each
fn watch_stdin(sep: u8, records: Sender<Vec<u8>>) {
    let stdin = io::stdin().lock();
    for line in stdin.lines() {
        let Ok(path) = line else { return };
        if path.is_empty() {
            continue;
        }
        match File::open(&path) {
            Ok(file) => {
                let tx = records.clone();
                thread::spawn(move || copy_records(&path, file, sep, &tx));
            }
            Err(err) => error!("open file '{}' to merge: {}", path, err),
        }
    }
}

/// Copy separator-delimited records from `from` until EOF
fn copy_records(name: &str, from: impl Read, sep: u8, out: &Sender<Vec<u8>>) {
    let mut reader = BufReader::new(from);
    loop {
        let mut record = Vec::new();
        match reader
            .by_ref()
            .take(MAX_RECORD_SIZE as u64)
            .read_until(sep, &mut record)
        {
            Ok(0) => return, // EOF
            Ok(_) => {
                if record.last() != Some(&sep) {
                    record.push(sep); // final record missing its separator
                }
                if out.send(record).is_err() {
                    return;
                }
            }
            Err(err) => {
                error!("copy: read '{}': {}", name, err);
                return;
            }
        }
    }
}
