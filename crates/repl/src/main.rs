//! ember - run Ember programs, or talk to one interactively.
//!
//! Usage:
//!   ember                   # start the REPL
//!   ember script.em         # compile and run a file
//!
//! Exit codes:
//!   0   success
//!   60  file could not be read
//!   64  usage error
//!   65  runtime error
//!   70  compile error
//!   74  out of memory while reading the file

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use ember_runtime::{InterpretError, Vm, VmOptions};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

const EXIT_FILE: u8 = 60;
const EXIT_USAGE: u8 = 64;
const EXIT_RUNTIME: u8 = 65;
const EXIT_COMPILE: u8 = 70;
const EXIT_OOM: u8 = 74;

#[derive(Parser)]
#[command(name = "ember")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ember interpreter - run a script or start a REPL", long_about = None)]
struct Cli {
    /// Script to run; starts a REPL when omitted
    script: Option<PathBuf>,

    /// Log every executed instruction to stderr
    #[arg(long)]
    trace_execution: bool,

    /// Collect garbage at every allocation point
    #[arg(long)]
    stress_gc: bool,

    /// Log collector activity to stderr
    #[arg(long)]
    log_gc: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Let clap print help/version itself; everything else is a
            // usage error and must exit 64.
            if err.use_stderr() {
                let _ = err.print();
                return ExitCode::from(EXIT_USAGE);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    init_logging(cli.log_gc, cli.trace_execution);

    let options = VmOptions {
        trace_execution: cli.trace_execution,
        stress_gc: cli.stress_gc,
    };

    match cli.script {
        Some(path) => run_file(&path, options),
        None => repl(options),
    }
}

fn init_logging(log_gc: bool, trace_execution: bool) {
    let mut directives = Vec::new();
    if log_gc {
        directives.push("ember_core=debug");
    }
    if trace_execution {
        directives.push("ember_runtime=trace");
    }
    let filter = if directives.is_empty() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(directives.join(","))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_file(path: &Path, options: VmOptions) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot read '{}': {}", path.display(), err);
            let code = if err.kind() == ErrorKind::OutOfMemory {
                EXIT_OOM
            } else {
                EXIT_FILE
            };
            return ExitCode::from(code);
        }
    };

    let mut vm = Vm::new(options);
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(err)) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_COMPILE)
        }
        Err(InterpretError::Runtime(err)) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

/// Line REPL. Globals persist across lines; expression statements print
/// their value. An empty line or ctrl-d leaves.
fn repl(options: VmOptions) -> ExitCode {
    let mut vm = Vm::new(options);
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("cannot start line editor: {err}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    break;
                }
                let _ = editor.add_history_entry(&line);
                // Errors do not end the session; the VM already reset.
                if let Err(err) = vm.interpret_repl(&line) {
                    eprintln!("{err}");
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("readline error: {err}");
                break;
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    ExitCode::SUCCESS
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".ember_history"))
}
