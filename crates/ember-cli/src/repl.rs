//! Interactive prompt
//!
//! One VM lives for the whole session, so globals, functions, and classes
//! declared on earlier lines stay visible.

use anyhow::{Context, Result};
use ember_runtime::{InterpretError, Vm, VERSION};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub fn run() -> Result<()> {
    println!("Ember {} (ctrl-d to exit)", VERSION);

    let mut editor = DefaultEditor::new().context("failed to start line editor")?;
    let mut vm = Vm::new();

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                match vm.interpret(&line) {
                    Ok(()) => {}
                    Err(err @ InterpretError::Compile(_)) => eprintln!("{}", err),
                    // Runtime errors render their own trailing newline
                    Err(InterpretError::Runtime(err)) => eprint!("{}", err),
                }
            }
            // ctrl-c drops the current line, not the session
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err).context("could not read input"),
        }
    }

    Ok(())
}
