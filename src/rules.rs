use crate::types::{OsInfo, Platform, ResolvedCommand, Source};
use regex::Regex;
use std::sync::OnceLock;

pub const RULE_CONFIDENCE: f64 = 0.9;

struct Rule {
    phrases: &'static [&'static str],
    unix: &'static str,
    macos: Option<&'static str>,
    windows: &'static str,
    explanation: &'static str,
    tag: &'static str,
}

impl Rule {
    fn command_for(&self, platform: Platform) -> &'static str {
        match platform {
            Platform::Windows => self.windows,
            Platform::Macos => self.macos.unwrap_or(self.unix),
            Platform::Linux => self.unix,
        }
    }
}

// Checked top to bottom; more specific phrases come first.
const RULES: &[Rule] = &[
    Rule {
        phrases: &["hidden files", "all files including hidden"],
        unix: "ls -la",
        macos: None,
        windows: "dir /a",
        explanation: "List all files, including hidden ones",
        tag: "files",
    },
    Rule {
        phrases: &["list files", "show files", "list all files", "list directory", "what files"],
        unix: "ls -la",
        macos: None,
        windows: "dir",
        explanation: "List files in the current directory",
        tag: "files",
    },
    Rule {
        phrases: &["current directory", "where am i", "working directory"],
        unix: "pwd",
        macos: None,
        windows: "cd",
        explanation: "Print the current working directory",
        tag: "navigation",
    },
    Rule {
        phrases: &["disk space", "disk usage", "free space"],
        unix: "df -h",
        macos: None,
        windows: "wmic logicaldisk get caption,freespace,size",
        explanation: "Show free and used disk space per filesystem",
        tag: "disk",
    },
    Rule {
        phrases: &["folder size", "directory size", "size of this folder"],
        unix: "du -sh .",
        macos: None,
        windows: "dir /s",
        explanation: "Show the total size of the current directory",
        tag: "disk",
    },
    Rule {
        phrases: &["large files", "biggest files", "largest files"],
        unix: "find . -type f -size +100M",
        macos: None,
        windows: "forfiles /s /c \"cmd /c if @fsize gtr 104857600 echo @path\"",
        explanation: "Find files larger than 100 MB below the current directory",
        tag: "disk",
    },
    Rule {
        phrases: &["memory usage", "free memory", "ram usage"],
        unix: "free -h",
        macos: Some("vm_stat"),
        windows: "systeminfo | findstr Memory",
        explanation: "Show memory usage",
        tag: "system",
    },
    Rule {
        phrases: &["running processes", "list processes", "show processes"],
        unix: "ps aux",
        macos: None,
        windows: "tasklist",
        explanation: "List running processes",
        tag: "process",
    },
    Rule {
        phrases: &["ip address", "my ip", "network interfaces"],
        unix: "ip addr",
        macos: Some("ifconfig"),
        windows: "ipconfig",
        explanation: "Show network interfaces and addresses",
        tag: "network",
    },
    Rule {
        phrases: &["open ports", "listening ports"],
        unix: "ss -tuln",
        macos: Some("lsof -iTCP -sTCP:LISTEN -n -P"),
        windows: "netstat -an | findstr LISTENING",
        explanation: "Show listening network ports",
        tag: "network",
    },
    Rule {
        phrases: &["git status", "repo status", "what changed"],
        unix: "git status",
        macos: None,
        windows: "git status",
        explanation: "Show the working tree status",
        tag: "git",
    },
    Rule {
        phrases: &["current branch", "which branch"],
        unix: "git branch --show-current",
        macos: None,
        windows: "git branch --show-current",
        explanation: "Print the name of the current git branch",
        tag: "git",
    },
    Rule {
        phrases: &["git log", "recent commits", "commit history"],
        unix: "git log --oneline -10",
        macos: None,
        windows: "git log --oneline -10",
        explanation: "Show the last ten commits",
        tag: "git",
    },
    Rule {
        phrases: &["who am i", "current user", "my username"],
        unix: "whoami",
        macos: None,
        windows: "whoami",
        explanation: "Print the current user name",
        tag: "system",
    },
    Rule {
        phrases: &["system info", "os version", "kernel version"],
        unix: "uname -a",
        macos: Some("sw_vers"),
        windows: "systeminfo",
        explanation: "Show operating system information",
        tag: "system",
    },
    Rule {
        phrases: &["uptime", "how long has the system been running"],
        unix: "uptime",
        macos: None,
        windows: "net statistics workstation",
        explanation: "Show how long the system has been running",
        tag: "system",
    },
    Rule {
        phrases: &["clear screen", "clear the terminal", "clear terminal"],
        unix: "clear",
        macos: None,
        windows: "cls",
        explanation: "Clear the terminal screen",
        tag: "terminal",
    },
    Rule {
        phrases: &["command history", "shell history"],
        unix: "history",
        macos: None,
        windows: "doskey /history",
        explanation: "Show the shell command history",
        tag: "terminal",
    },
];

fn multi_step_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:then|and|after that|followed by)\b").expect("valid regex"))
}

/// Whether the request asks for several chained steps.
pub fn wants_multiple_steps(input: &str) -> bool {
    multi_step_re().is_match(input)
}

pub fn match_rule(input: &str, os: &OsInfo) -> Option<ResolvedCommand> {
    let normalized = normalize(input);
    let rule = RULES
        .iter()
        .find(|rule| rule.phrases.iter().any(|p| contains_phrase(&normalized, p)))?;

    Some(
        ResolvedCommand::new(vec![rule.command_for(os.platform).to_string()], Source::Rule)
            .with_explanation(rule.explanation)
            .with_confidence(RULE_CONFIDENCE)
            .with_tag("builtin")
            .with_tag(rule.tag),
    )
}

fn normalize(input: &str) -> String {
    input
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    format!(" {} ", normalized).contains(&format!(" {} ", phrase))
}
