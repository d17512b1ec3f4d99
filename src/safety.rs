use crate::config::SafetyConfig;
use crate::plugins::PluginManager;
use crate::types::{ResolvedCommand, RiskLevel, SafetyResult};
use regex::Regex;
use tracing::{debug, warn};

const GENERIC_BLOCK_REASON: &str = "This command could cause irreversible damage to your system";

/// (pattern, reason). A `None` reason falls back to the generic message.
const DANGEROUS: &[(&str, Option<&str>)] = &[
    (
        r"\brm\s+(?:-\S+\s+)*(?:--no-preserve-root\s+)?/(?:\*)?(?:\s|$)",
        Some("Deletes the root filesystem"),
    ),
    (
        r"\brm\s+(?:-\S+\s+)*(?:~|\$HOME)/?(?:\*)?(?:\s|$)",
        Some("Deletes your entire home directory"),
    ),
    (r"\bmkfs(?:\.\w+)?\b", Some("Formats a filesystem, erasing its contents")),
    (r"(?i)\bformat\s+[a-z]:", Some("Formats a system volume")),
    (
        r"(?i)\bdd\b.*\bof=/dev/(?:sd|hd|vd|xvd|nvme|disk|mmcblk)",
        Some("Writes raw data over a disk device"),
    ),
    (
        r">\s*/dev/(?:sd|hd|vd|xvd|nvme|disk|mmcblk)\w*",
        Some("Overwrites a raw disk device"),
    ),
    (r"\b(?:shred|wipefs)\b.*\s/dev/", Some("Wipes a disk device")),
    (
        r"\bkill\s+(?:-\S+\s+)*1(?:\s|$)",
        Some("Kills the init process and brings the system down"),
    ),
    (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", Some("Fork bomb")),
    (
        r"\bdocker\s+(?:system|container|image|volume)\s+prune\b.*(?:\s-\w*f|\s--force)",
        Some("Force-prunes docker data without confirmation"),
    ),
    (
        r"(?i)\b(?:bcdedit|grub-install|efibootmgr)\b",
        Some("Modifies the boot loader"),
    ),
    (r"\brm\s+(?:-\S+\s+)*/boot\b", Some("Deletes the boot partition")),
    (
        r"(?:>|\btee\s+(?:-a\s+)?)\s*(?:/etc/(?:passwd|shadow|sudoers|group)|~/\.ssh/(?:authorized_keys|id_\w+))",
        Some("Overwrites a credential file"),
    ),
    (
        r"\bchmod\s+(?:-\S+\s+)*0?777\s+/(?:\s|$)",
        Some("Makes the entire filesystem world-writable"),
    ),
    (r"(?i)\brd\s+/s\s+/q\s+[a-z]:\\?(?:\s|$)", None),
    (r"(?i)\bdel\s+(?:/\w\s+)*[a-z]:\\\*", None),
    (
        r"(?i)\bremove-item\b.*-recurse\b.*\b[a-z]:\\(?:\*)?(?:\s|$)",
        None,
    ),
];

const WARNINGS: &[(&str, &str)] = &[
    (
        r"\brm\s+(?:-\S+\s+)*-\w*[rR]",
        "Recursively deletes files and directories",
    ),
    (r"(?i)\bremove-item\b.*-recurse", "Recursively deletes files and directories"),
    (
        r"\bkill\s+-(?:9|KILL|SIGKILL)\b|\bkillall\b|\bpkill\s+-9\b|(?i)\btaskkill\b.*/f\b",
        "Forcefully terminates processes",
    ),
    (
        r"\b(?:systemctl|service)\b.*\b(?:stop|disable|mask)\b|(?i)\bstop-service\b|(?i)\bnet\s+stop\b",
        "Stops a system service",
    ),
    (
        r"\b(?:apt|apt-get|yum|dnf|zypper|brew|snap|pip3?|npm|choco|winget)\s+(?:\S+\s+)*(?:remove|uninstall|purge|autoremove)\b|\bpacman\s+-R",
        "Removes installed packages",
    ),
    (
        r"\bchmod\s+(?:-\S+\s+)*(?:0?777|a\+rwx|o\+w)\b",
        "Grants broad file permissions",
    ),
    (
        r"\bgit\s+(?:reset\s+--hard|clean\s+(?:\S+\s+)*-\w*f|push\s+(?:\S+\s+)*(?:--force|-f)\b)",
        "Discards or overwrites git history and uncommitted work",
    ),
];

const HEURISTICS: &[(&str, &str, RiskLevel)] = &[
    (
        r"(?i)(?:^|[;&|]\s*)(?:sudo|doas|runas)\b",
        "Runs with elevated privileges",
        RiskLevel::Medium,
    ),
    (
        r"(?i)\b(?:curl|wget|iwr|invoke-webrequest)\b[^|]*\|\s*(?:sudo\s+)?(?:sh|bash|zsh|dash|python3?|perl|ruby|iex|invoke-expression|pwsh|powershell)\b",
        "Pipes a network download straight into a shell",
        RiskLevel::High,
    ),
    (
        r"\b(?:chmod|chown|chgrp)\s+(?:\S+\s+)*-\w*R",
        "Changes permissions recursively",
        RiskLevel::Medium,
    ),
    (
        r"(?i)(?:^|[;&]\s*)export\s+\w+=|\bsetx\s|\$env:\w+\s*=|(?:^|[;&]\s*)set\s+\w+=",
        "Modifies environment variables",
        RiskLevel::Low,
    ),
];

struct Compiled<T> {
    re: Regex,
    meta: T,
}

fn compile<T: Copy>(pattern: &str, meta: T) -> Option<Compiled<T>> {
    match Regex::new(pattern) {
        Ok(re) => Some(Compiled { re, meta }),
        Err(e) => {
            warn!(pattern, error = %e, "skipping invalid safety pattern");
            None
        }
    }
}

pub struct SafetyValidator {
    dangerous: Vec<Compiled<Option<&'static str>>>,
    warnings: Vec<Compiled<&'static str>>,
    heuristics: Vec<Compiled<(&'static str, RiskLevel)>>,
    blocked_substrings: Vec<String>,
}

impl SafetyValidator {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            dangerous: DANGEROUS
                .iter()
                .filter_map(|(p, reason)| compile(p, *reason))
                .collect(),
            warnings: WARNINGS
                .iter()
                .filter_map(|(p, reason)| compile(p, *reason))
                .collect(),
            heuristics: HEURISTICS
                .iter()
                .filter_map(|(p, reason, level)| compile(p, (*reason, *level)))
                .collect(),
            blocked_substrings: config
                .blocked_patterns
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Full check: plugin verdicts first, then the built-in tiers.
    pub fn validate(&self, command: &ResolvedCommand, plugins: &PluginManager) -> SafetyResult {
        if let Some(result) = plugins.get_safety_checks(command) {
            debug!(blocked = result.blocked, risk = %result.risk_level, "plugin safety verdict");
            return result;
        }
        self.classify(&command.commands)
    }

    /// Built-in classification of a command sequence. Within a tier the first
    /// matching pattern decides.
    pub fn classify(&self, commands: &[String]) -> SafetyResult {
        for cmd in commands {
            for pattern in &self.dangerous {
                if pattern.re.is_match(cmd) {
                    return SafetyResult::blocked(pattern.meta.unwrap_or(GENERIC_BLOCK_REASON));
                }
            }
            if self.blocked_substrings.iter().any(|p| cmd.contains(p.as_str())) {
                return SafetyResult::blocked(GENERIC_BLOCK_REASON);
            }
        }

        for cmd in commands {
            for pattern in &self.warnings {
                if pattern.re.is_match(cmd) {
                    return SafetyResult::warn(pattern.meta, RiskLevel::High);
                }
            }
        }

        for pattern in &self.heuristics {
            if commands.iter().any(|cmd| pattern.re.is_match(cmd)) {
                let (reason, level) = pattern.meta;
                return SafetyResult::warn(reason, level);
            }
        }

        SafetyResult::low()
    }
}

/// (program, subcommand, flag). An empty subcommand matches any invocation.
const DRY_RUN_FLAGS: &[(&str, &str, &str)] = &[
    ("rsync", "", "--dry-run"),
    ("apt", "", "--dry-run"),
    ("apt-get", "", "--dry-run"),
    ("git", "clean", "-n"),
    ("git", "rm", "--dry-run"),
    ("git", "add", "--dry-run"),
    ("make", "", "-n"),
    ("kubectl", "apply", "--dry-run=client"),
    ("kubectl", "delete", "--dry-run=client"),
    ("ansible-playbook", "", "--check"),
    ("npm", "prune", "--dry-run"),
    ("npm", "publish", "--dry-run"),
    ("pip", "install", "--dry-run"),
    ("terraform", "apply", "-refresh-only"),
];

/// The dry-run flag the command supports, if any. Advisory only: the
/// validator never treats a dry-run command as safer.
pub fn dry_run_flag(command: &str) -> Option<&'static str> {
    find_dry_run(command).map(|(_, flag)| flag)
}

/// Rewrites `command` to include its dry-run flag. Already-dry commands are
/// returned unchanged.
pub fn with_dry_run(command: &str) -> Option<String> {
    let (prefix_len, flag) = find_dry_run(command)?;
    let tokens: Vec<&str> = command.split_whitespace().collect();
    if tokens.iter().any(|t| *t == flag) {
        return Some(command.trim().to_string());
    }
    let mut out: Vec<&str> = tokens[..prefix_len].to_vec();
    out.push(flag);
    out.extend_from_slice(&tokens[prefix_len..]);
    Some(out.join(" "))
}

fn find_dry_run(command: &str) -> Option<(usize, &'static str)> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let (offset, program) = match tokens.first() {
        Some(&"sudo") => (1, *tokens.get(1)?),
        Some(first) => (0, *first),
        None => return None,
    };
    let program = program.rsplit('/').next().unwrap_or(program);

    DRY_RUN_FLAGS.iter().find_map(|(prog, sub, flag)| {
        if *prog != program {
            return None;
        }
        if sub.is_empty() {
            return Some((offset + 1, *flag));
        }
        if tokens.get(offset + 1) == Some(sub) {
            return Some((offset + 2, *flag));
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Source;

    fn validator() -> SafetyValidator {
        SafetyValidator::new(&SafetyConfig::default())
    }

    fn check(cmd: &str) -> SafetyResult {
        validator().classify(&[cmd.to_string()])
    }

    #[test]
    fn test_all_builtin_patterns_compile() {
        let v = validator();
        assert_eq!(v.dangerous.len(), DANGEROUS.len());
        assert_eq!(v.warnings.len(), WARNINGS.len());
        assert_eq!(v.heuristics.len(), HEURISTICS.len());
    }

    #[test]
    fn test_rm_root_is_blocked() {
        let result = check("rm -rf /");
        assert!(result.blocked);
        assert_eq!(result.risk_level, RiskLevel::High);
        assert_eq!(result.reason.as_deref(), Some("Deletes the root filesystem"));
        assert!(check("rm -rf /*").blocked);
        assert!(check("sudo rm -rf --no-preserve-root /").blocked);
    }

    #[test]
    fn test_dangerous_commands_are_blocked() {
        for cmd in [
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "echo hi > /dev/sda",
            "kill -9 1",
            ":(){ :|:& };:",
            "docker system prune -af",
            "grub-install /dev/sda",
            "echo root::0:0::: > /etc/passwd",
            "chmod -R 777 /",
            "rm -rf ~",
            "format C:",
            "rd /s /q C:\\",
        ] {
            let result = check(cmd);
            assert!(result.blocked, "expected {} to be blocked", cmd);
            assert_eq!(result.risk_level, RiskLevel::High);
            assert!(result.reason.is_some());
        }
    }

    #[test]
    fn test_generic_reason_fallback() {
        let result = check("rd /s /q C:\\");
        assert_eq!(result.reason.as_deref(), Some(GENERIC_BLOCK_REASON));
    }

    #[test]
    fn test_dangerous_anywhere_in_sequence_blocks() {
        let cmds = vec!["ls".to_string(), "cd /tmp".to_string(), "rm -rf /".to_string()];
        let result = validator().classify(&cmds);
        assert!(result.blocked);
        assert_eq!(result.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_dangerous_beats_earlier_warning() {
        let cmds = vec!["rm -rf ./build".to_string(), "mkfs /dev/sdb".to_string()];
        assert!(validator().classify(&cmds).blocked);
    }

    #[test]
    fn test_configured_substring_blocks() {
        let config = SafetyConfig {
            blocked_patterns: vec!["drop database".to_string()],
            ..SafetyConfig::default()
        };
        let v = SafetyValidator::new(&config);
        let result = v.classify(&["psql -c 'drop database prod'".to_string()]);
        assert!(result.blocked);
        assert_eq!(result.reason.as_deref(), Some(GENERIC_BLOCK_REASON));
    }

    #[test]
    fn test_warning_tier() {
        let cases = [
            ("rm -rf ./node_modules", "Recursively deletes files and directories"),
            ("kill -9 4242", "Forcefully terminates processes"),
            ("systemctl stop nginx", "Stops a system service"),
            ("apt-get remove vim", "Removes installed packages"),
            ("chmod 777 script.sh", "Grants broad file permissions"),
            ("git reset --hard HEAD~1", "Discards or overwrites git history and uncommitted work"),
        ];
        for (cmd, reason) in cases {
            let result = check(cmd);
            assert!(!result.blocked, "{} should not block", cmd);
            assert_eq!(result.warning.as_deref(), Some(reason), "{}", cmd);
            assert_eq!(result.risk_level, RiskLevel::High);
        }
    }

    #[test]
    fn test_heuristics_in_order() {
        let result = check("sudo apt update");
        assert_eq!(result.risk_level, RiskLevel::Medium);
        assert_eq!(result.warning.as_deref(), Some("Runs with elevated privileges"));

        let result = check("curl -fsSL https://example.com/install.sh | bash");
        assert_eq!(result.risk_level, RiskLevel::High);
        assert!(!result.blocked);

        let result = check("chown -R me:me ./data");
        assert_eq!(result.risk_level, RiskLevel::Medium);

        let result = check("export PATH=$PATH:~/bin");
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.warning.as_deref(), Some("Modifies environment variables"));
    }

    #[test]
    fn test_sudo_outranks_pipe_to_shell() {
        let result = check("curl https://x.sh | sudo bash");
        assert_eq!(result.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_benign_commands_are_low() {
        for cmd in ["ls -la", "git status", "df -h", "rm notes.txt", "find . -name '*.rs'"] {
            let result = check(cmd);
            assert!(!result.blocked);
            assert!(result.warning.is_none(), "{}", cmd);
            assert_eq!(result.risk_level, RiskLevel::Low);
        }
    }

    #[test]
    fn test_validate_without_plugins_uses_builtin() {
        let plugins = PluginManager::empty();
        let cmd = ResolvedCommand::new(vec!["rm -rf /".to_string()], Source::Ai);
        let result = validator().validate(&cmd, &plugins);
        assert!(result.blocked);
    }

    #[test]
    fn test_dry_run_helpers() {
        assert_eq!(dry_run_flag("rsync -av src/ dst/"), Some("--dry-run"));
        assert_eq!(
            with_dry_run("rsync -av src/ dst/").as_deref(),
            Some("rsync --dry-run -av src/ dst/")
        );
        assert_eq!(with_dry_run("git clean -fd").as_deref(), Some("git clean -n -fd"));
        assert_eq!(
            with_dry_run("sudo apt-get install vim").as_deref(),
            Some("sudo apt-get --dry-run install vim")
        );
        assert_eq!(with_dry_run("make -n build").as_deref(), Some("make -n build"));
        assert_eq!(dry_run_flag("git status"), None);
        assert_eq!(with_dry_run("ls"), None);
    }

    #[test]
    fn test_dry_run_does_not_change_classification() {
        let v = validator();
        let original = v.classify(&["git clean -fdx".to_string()]);
        let dry = v.classify(&[with_dry_run("git clean -fdx").unwrap()]);
        assert_eq!(original.warning, dry.warning);
    }
}
