use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use fox_vm::InterpretOutcome;

/// Fox language interpreter: run a script, or start a REPL with no arguments.
#[derive(Parser)]
#[command(name = "fox", version)]
struct Cli {
    /// Script to execute. Omit to start the REPL.
    script: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let status = match cli.script {
        Some(path) => run_file(&path),
        None => run_repl(),
    };
    process::exit(status as i32);
}

fn run_file(path: &PathBuf) -> fox_vm::ExitStatus {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("fox: cannot read '{}': {}", path.display(), e);
            return fox_vm::ExitStatus::IoError;
        }
    };
    let base_path = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let filename = path.display().to_string();
    report(fox_vm::interpret(&source, filename, base_path))
}

fn run_repl() -> fox_vm::ExitStatus {
    println!("Fox REPL — Ctrl-D to exit");
    let keep_running = Arc::new(AtomicBool::new(true));
    let handler_flag = keep_running.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst)) {
        log::warn!("failed to install SIGINT handler: {e}");
    }

    let stdin = io::stdin();
    loop {
        if !keep_running.load(Ordering::SeqCst) {
            return fox_vm::ExitStatus::Success;
        }
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return fox_vm::ExitStatus::Success,
            Ok(_) => {
                if !keep_running.load(Ordering::SeqCst) {
                    return fox_vm::ExitStatus::Success;
                }
                report(fox_vm::interpret(&line, "<script>", PathBuf::from(".")));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                eprintln!("fox: {e}");
                return fox_vm::ExitStatus::IoError;
            }
        }
    }
}

/// Prints diagnostics for a non-success outcome and returns its exit status,
/// the same mapping `ExitStatus` itself documents.
fn report(outcome: InterpretOutcome) -> fox_vm::ExitStatus {
    match &outcome {
        InterpretOutcome::Value(_) => {}
        InterpretOutcome::CompileError(errors) => {
            for e in errors {
                eprintln!("{e}");
            }
        }
        InterpretOutcome::RuntimeError(e) => eprintln!("{e}"),
    }
    outcome.exit_status()
}
