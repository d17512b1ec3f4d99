use crate::safety::dry_run_flag;
use crate::types::{ResolvedCommand, RiskLevel, SafetyResult};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal,
};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::{env, fs, process::Command, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Edit,
    Explain,
    DryRun,
    Quit,
}

pub fn print_resolved(cmd: &ResolvedCommand, safety: &SafetyResult) {
    println!();

    for (i, line) in cmd.commands.iter().enumerate() {
        if cmd.commands.len() > 1 {
            println!("  {}. {}", i + 1, line);
        } else {
            println!("  {}", line);
        }
    }

    println!();
    let tags: Vec<&str> = cmd.tags.iter().map(String::as_str).collect();
    if tags.is_empty() {
        println!("  source: {}  confidence: {:.0}%", cmd.source, cmd.confidence * 100.0);
    } else {
        println!(
            "  source: {}  confidence: {:.0}%  [{}]",
            cmd.source,
            cmd.confidence * 100.0,
            tags.join(", ")
        );
    }

    if let Some(warning) = &safety.warning {
        let label = match safety.risk_level {
            RiskLevel::High => "warning (high risk)",
            RiskLevel::Medium => "warning",
            RiskLevel::Low => "note",
        };
        println!("  {}: {}", label, warning);
    }
}

pub fn print_blocked(cmd: &ResolvedCommand, safety: &SafetyResult) {
    println!();
    for line in &cmd.commands {
        println!("  {}", line);
    }
    println!();
    match &safety.reason {
        Some(reason) => println!("  refused: {}", reason),
        None => println!("  refused: command blocked for safety"),
    }
}

pub fn show_explanation(cmd: &ResolvedCommand) {
    println!();
    if !cmd.explanation.is_empty() {
        println!("explanation: {}", cmd.explanation);
        println!();
    }

    for line in &cmd.commands {
        for part in line.split('|') {
            println!("  {}", part.trim());
        }
        if let Some(flag) = dry_run_flag(line) {
            println!("    (preview with {})", flag);
        }
    }

    if let Some(learning) = &cmd.learning {
        if !learning.breakdown.is_empty() {
            println!();
            println!("breakdown:");
            let width = learning
                .breakdown
                .iter()
                .map(|item| item.part.len())
                .max()
                .unwrap_or(0);
            for item in &learning.breakdown {
                println!("  {:width$}  {}", item.part, item.meaning, width = width);
            }
        }
        if !learning.tips.is_empty() {
            println!();
            println!("tips:");
            for tip in &learning.tips {
                println!("  - {}", tip);
            }
        }
    }
    println!();
}

pub fn prompt_action(dry_run_available: bool) -> Option<Action> {
    if dry_run_available {
        eprint!("[enter] run  [e] edit  [?] explain  [d] dry-run  [q] quit ");
    } else {
        eprint!("[enter] run  [e] edit  [?] explain  [q] quit ");
    }
    io::stderr().flush().ok();

    terminal::enable_raw_mode().ok()?;
    let result = loop {
        match event::poll(Duration::from_millis(100)) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(_) => break None,
        }
        let Ok(Event::Key(key)) = event::read() else {
            continue;
        };
        match key.code {
            KeyCode::Enter | KeyCode::Char('y') => break Some(Action::Run),
            KeyCode::Char('e') => break Some(Action::Edit),
            KeyCode::Char('?') => break Some(Action::Explain),
            KeyCode::Char('d') if dry_run_available => break Some(Action::DryRun),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                break Some(Action::Quit)
            }
            KeyCode::Char('q') | KeyCode::Char('n') | KeyCode::Esc => break Some(Action::Quit),
            _ => {}
        }
    };
    terminal::disable_raw_mode().ok();
    eprintln!();
    result
}

pub fn edit_command(cmd: &str) -> Option<String> {
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let file = tempfile::Builder::new()
        .prefix("cmdr_edit")
        .suffix(".sh")
        .tempfile()
        .ok()?;
    fs::write(file.path(), cmd).ok()?;
    let status = Command::new(&editor).arg(file.path()).status().ok()?;
    if !status.success() {
        return None;
    }
    fs::read_to_string(file.path()).ok()
}

/// Asks for a value for each placeholder on the terminal.
pub fn prompt_variables(variables: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    let stdin = io::stdin();
    read_variables(&mut stdin.lock(), &mut io::stderr(), variables)
}

/// Reads one line per variable. An empty line keeps the default; an empty
/// line for a variable without a default cancels.
fn read_variables(
    input: &mut impl BufRead,
    prompt: &mut impl Write,
    variables: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for (name, default) in variables {
        if default.is_empty() {
            write!(prompt, "  {}: ", name).ok()?;
        } else {
            write!(prompt, "  {} [{}]: ", name, default).ok()?;
        }
        prompt.flush().ok()?;

        let mut line = String::new();
        if input.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let value = line.trim();
        let value = if value.is_empty() { default.as_str() } else { value };
        if value.is_empty() {
            return None;
        }
        values.insert(name.clone(), value.to_string());
    }
    Some(values)
}
