use anyhow::{Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::commands::{parse_command, Command};
use crate::engine::Engine;
use crate::printer::{print_records, print_stats};

const PROMPT: &str = "stratum> ";

pub fn run_repl(engine: &mut Engine) -> Result<()> {
    let mut editor = DefaultEditor::new().context("initialize line editor")?;

    loop {
        let line = match editor.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.trim());

        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(err) => {
                eprintln!("Error: {err}");
                continue;
            }
        };
        if matches!(command, Command::Exit) {
            break;
        }
        if let Err(err) = execute(engine, command) {
            eprintln!("Error: {err:#}");
        }
    }
    Ok(())
}

fn execute(engine: &mut Engine, command: Command) -> Result<()> {
    match command {
        Command::Insert { key, attrs } => {
            engine.insert(&key, attrs)?;
            println!("inserted");
        }
        Command::Delete { key } => {
            if engine.delete(&key)? {
                println!("deleted");
            } else {
                println!("key not found");
            }
        }
        Command::Update { key, attrs } => {
            if engine.update(&key, attrs)? {
                println!("updated");
            } else {
                println!("key not found");
            }
        }
        Command::Select { condition } => {
            let records = engine.select(&condition)?;
            print_records(&records);
        }
        Command::Range { lo, hi } => {
            let records = engine.range(lo, hi)?;
            print_records(&records);
        }
        Command::Stats => {
            let stats = engine.stats()?;
            print_stats(&stats);
        }
        Command::Maintain => {
            let performed = engine.maintain()?;
            if performed.is_empty() {
                println!("no maintenance needed");
            } else {
                println!("maintained: {}", performed.join(", "));
            }
        }
        Command::Help => print_help(),
        Command::Exit => {}
    }
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  insert <key> <attr> [attr ...]   Store a record under an integer key");
    println!("  delete <key>                     Remove a record");
    println!("  update <key> <attr> [attr ...]   Replace a record");
    println!("  select <field> <op> <value>      Query; op is one of = < <= > >=");
    println!("  range <lo> <hi>                  All records with keys in [lo, hi]");
    println!("  stats                            Show engine statistics");
    println!("  maintain                         Run scheduled index maintenance");
    println!("  help                             Show this message");
    println!("  exit                             Leave the shell");
}
