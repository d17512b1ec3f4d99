use crate::types::{ExecutionReport, Platform};
use std::process::{Command, Stdio};
use tracing::debug;

fn shell_command(platform: Platform, cmd: &str) -> Command {
    let mut command = if platform == Platform::Windows {
        let mut c = Command::new("cmd");
        c.arg("/C");
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c");
        c
    };
    command.arg(cmd);
    command
}

/// Runs each command in order through the platform shell, stopping at the
/// first one that fails.
pub fn execute_commands(
    commands: &[String],
    platform: Platform,
    max_lines: usize,
) -> Result<ExecutionReport, Box<dyn std::error::Error>> {
    let mut output_lines = Vec::new();
    let mut all_succeeded = true;

    for cmd in commands {
        debug!(command = %cmd, "executing");
        let result = shell_command(platform, cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        let stdout = String::from_utf8_lossy(&result.stdout);
        let stderr = String::from_utf8_lossy(&result.stderr);

        if !stdout.is_empty() {
            output_lines.extend(stdout.lines().map(String::from));
        }
        if !stderr.is_empty() {
            output_lines.extend(stderr.lines().map(String::from));
        }

        if !result.status.success() {
            debug!(command = %cmd, status = ?result.status.code(), "command failed");
            all_succeeded = false;
            break;
        }
    }

    Ok(ExecutionReport {
        succeeded: all_succeeded,
        output: truncate_output(&output_lines, max_lines),
    })
}

/// Keeps the first and last halves of `lines` when there are more than
/// `max_lines`.
pub fn truncate_output(lines: &[String], max_lines: usize) -> String {
    if lines.len() <= max_lines {
        return lines.join("\n");
    }
    let half = max_lines / 2;
    let mut truncated: Vec<String> = lines[..half].to_vec();
    truncated.push(format!("... [{} lines truncated] ...", lines.len() - half * 2));
    truncated.extend(lines[lines.len() - half..].iter().cloned());
    truncated.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("line {}", i)).collect()
    }

    #[test]
    fn test_short_output_is_untouched() {
        assert_eq!(truncate_output(&lines(3), 10), "line 1\nline 2\nline 3");
    }

    #[test]
    fn test_long_output_keeps_head_and_tail() {
        let out = truncate_output(&lines(20), 4);
        let kept: Vec<&str> = out.lines().collect();
        assert_eq!(kept, vec!["line 1", "line 2", "... [16 lines truncated] ...", "line 19", "line 20"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_commands_in_order() {
        let report = execute_commands(
            &["echo one".to_string(), "echo two".to_string()],
            Platform::Linux,
            100,
        )
        .unwrap();
        assert!(report.succeeded);
        assert_eq!(report.output, "one\ntwo");
    }

    #[cfg(unix)]
    #[test]
    fn test_stops_at_first_failure() {
        let report = execute_commands(
            &["echo before".to_string(), "false".to_string(), "echo after".to_string()],
            Platform::Linux,
            100,
        )
        .unwrap();
        assert!(!report.succeeded);
        assert_eq!(report.output, "before");
    }
}
