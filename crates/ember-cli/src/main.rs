//! Ember command-line driver
//!
//! `ember` with no arguments starts the REPL; `ember <script>` runs a file.
//! Exit codes follow the BSD sysexits convention: 64 usage, 65 bad source,
//! 70 runtime failure, 74 I/O error.

mod repl;

use std::fs;
use std::io::Write;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use ember_runtime::{InterpretError, Vm};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Parser)]
#[command(name = "ember", version, about = "The Ember programming language")]
struct Cli {
    /// Script to run; omit to start the REPL
    script: Option<String>,

    /// Print compile diagnostics as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(EX_USAGE);
        }
    };

    match cli.script {
        Some(path) => run_file(&path, cli.json),
        None => match repl::run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{err:#}");
                ExitCode::from(EX_IOERR)
            }
        },
    }
}

fn run_file(path: &str, json: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read \"{}\": {}", path, err);
            return ExitCode::from(EX_IOERR);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(diagnostics)) => {
            if json {
                for diagnostic in &diagnostics {
                    match diagnostic.to_json_string() {
                        Ok(line) => println!("{}", line),
                        Err(err) => eprintln!("{}", err),
                    }
                }
            } else {
                let text = diagnostics
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n");
                report(&text);
            }
            ExitCode::from(EX_DATAERR)
        }
        Err(InterpretError::Runtime(err)) => {
            report(err.to_string().trim_end());
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

/// Write error text to stderr, in red when the terminal supports it
fn report(text: &str) {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)));
    let _ = writeln!(stderr, "{}", text);
    let _ = stderr.reset();
}
