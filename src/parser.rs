use crate::types::{LearningContent, ResolvedCommand, Source};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

pub const LEARNING_MARKER: &str = "###LEARN###";
pub const MAX_COMMAND_LEN: usize = 180;

pub const BASE_CONFIDENCE: f64 = 0.65;
pub const UNREQUESTED_CHAIN_CONFIDENCE: f64 = 0.70;
pub const REQUESTED_CHAIN_CONFIDENCE: f64 = 0.75;

const DEFAULT_EXPLANATION: &str = "Generated by the AI backend";
const PLACEHOLDER_TOKENS: [&str; 2] = ["command1", "command2"];

fn variable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

fn conversational_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Flags like `--help` are commands, not chatter.
    RE.get_or_init(|| Regex::new(r"(?i)(?:^|[^-\w])(help|ready)\b").expect("valid regex"))
}

pub fn parse(raw: &str, wants_multiple: bool, learning_mode: bool) -> Option<ResolvedCommand> {
    let (command_part, learning) = split_learning(raw, learning_mode);

    let cleaned = clean(command_part);
    if let Some(reason) = rejection(&cleaned) {
        debug!(reason, text = %cleaned, "rejected model output");
        return None;
    }

    let split = split_chain(&cleaned);
    if wants_multiple && !split.chained {
        debug!(text = %cleaned, "multi-step request answered with a single command");
        return None;
    }
    if split.commands.is_empty() {
        return None;
    }

    let confidence = match (split.chained, wants_multiple) {
        (true, true) => REQUESTED_CHAIN_CONFIDENCE,
        (true, false) => UNREQUESTED_CHAIN_CONFIDENCE,
        _ => BASE_CONFIDENCE,
    };

    let variables = extract_variables(&split.commands);
    let explanation = learning
        .as_ref()
        .map(|l| l.summary.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_EXPLANATION)
        .to_string();

    let mut resolved = ResolvedCommand::new(split.commands, Source::Ai)
        .with_explanation(explanation)
        .with_confidence(confidence)
        .with_tag("ai")
        .with_variables(variables);
    if split.chained {
        resolved = resolved.with_tag("multi-step");
    }
    if learning.is_some() {
        resolved = resolved.with_tag("learning");
    }
    Some(resolved.with_learning(learning))
}

fn split_learning(raw: &str, learning_mode: bool) -> (&str, Option<LearningContent>) {
    if !learning_mode {
        return (raw, None);
    }
    match raw.split_once(LEARNING_MARKER) {
        Some((command, payload)) => (command, parse_learning(payload)),
        None => (raw, None),
    }
}

fn parse_learning(payload: &str) -> Option<LearningContent> {
    let payload = strip_fence_lines(payload);
    let start = payload.find('{')?;
    let end = payload.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str(&payload[start..=end]) {
        Ok(content) => Some(content),
        Err(e) => {
            debug!(error = %e, "dropping unparseable learning payload");
            None
        }
    }
}

fn strip_fence_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drops code fences and backticks and keeps the first non-empty line.
pub fn clean(text: &str) -> String {
    let unfenced = strip_fence_lines(text).replace('`', "");
    let line = unfenced
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let line = line
        .strip_prefix("$ ")
        .or_else(|| line.strip_prefix("> "))
        .unwrap_or(line);
    line.trim().to_string()
}

fn rejection(cleaned: &str) -> Option<&'static str> {
    if cleaned.is_empty() {
        return Some("empty");
    }
    if cleaned.chars().count() > MAX_COMMAND_LEN {
        return Some("too long");
    }
    let lower = cleaned.to_lowercase();
    if PLACEHOLDER_TOKENS.iter().any(|t| lower.contains(t)) {
        return Some("placeholder tokens");
    }
    if cleaned.ends_with('?') {
        return Some("question");
    }
    if conversational_re().is_match(cleaned) {
        return Some("conversational");
    }
    None
}

struct Chain {
    commands: Vec<String>,
    chained: bool,
}

/// Splits on top-level `&&` and `;`. Quoted or escaped separators are part of
/// the command. A top-level `|` marks the text as chained but never splits; a
/// dangling separator with nothing after it does not.
fn split_chain(text: &str) -> Chain {
    let chars: Vec<char> = text.chars().collect();
    let mut commands = Vec::new();
    let mut current = String::new();
    let mut piped = false;
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' && q == '"' && i + 1 < chars.len() {
                    current.push(c);
                    current.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '\\' if i + 1 < chars.len() => {
                    current.push(c);
                    current.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '&' if chars.get(i + 1) == Some(&'&') => {
                    push_fragment(&mut commands, &mut current);
                    i += 2;
                    continue;
                }
                ';' => {
                    push_fragment(&mut commands, &mut current);
                }
                '|' => {
                    piped = true;
                    current.push(c);
                }
                _ => current.push(c),
            },
        }
        i += 1;
    }
    push_fragment(&mut commands, &mut current);

    let chained = piped || commands.len() > 1;
    Chain { commands, chained }
}

fn push_fragment(commands: &mut Vec<String>, current: &mut String) {
    let fragment = current.trim();
    if !fragment.is_empty() {
        commands.push(fragment.to_string());
    }
    current.clear();
}

pub fn extract_variables(commands: &[String]) -> BTreeMap<String, String> {
    let mut variables = BTreeMap::new();
    for cmd in commands {
        for cap in variable_re().captures_iter(cmd) {
            variables
                .entry(cap[1].to_string())
                .or_insert_with(String::new);
        }
    }
    variables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block() {
        let result = parse("```bash\nls -la\n```", false, false).unwrap();
        assert_eq!(result.commands, vec!["ls -la"]);
        assert_eq!(result.source, Source::Ai);
        assert_eq!(result.confidence, BASE_CONFIDENCE);
        assert!(result.variables.is_none());
    }

    #[test]
    fn test_inline_backticks_and_prompt_marker() {
        let result = parse("`$ df -h`", false, false).unwrap();
        assert_eq!(result.commands, vec!["df -h"]);
    }

    #[test]
    fn test_first_non_empty_line_only() {
        let result = parse("\n\n  pwd  \nThis prints the directory.", false, false).unwrap();
        assert_eq!(result.commands, vec!["pwd"]);
    }

    #[test]
    fn test_multi_step_with_variable() {
        let result = parse("git add . && git commit -m {msg}", true, false).unwrap();
        assert_eq!(result.commands, vec!["git add .", "git commit -m {msg}"]);
        let vars = result.variables.unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("msg").map(String::as_str), Some(""));
        assert_eq!(result.confidence, REQUESTED_CHAIN_CONFIDENCE);
        assert!(result.tags.contains("multi-step"));
    }

    #[test]
    fn test_multi_step_without_separator_is_rejected() {
        assert!(parse("git status", true, false).is_none());
    }

    #[test]
    fn test_dangling_separator_is_not_a_chain() {
        assert!(parse("ls &&", true, false).is_none());
        assert!(parse("; git status ;", true, false).is_none());

        let result = parse("ls -la &&", false, false).unwrap();
        assert_eq!(result.commands, vec!["ls -la"]);
        assert_eq!(result.confidence, BASE_CONFIDENCE);
        assert!(!result.tags.contains("multi-step"));
    }

    #[test]
    fn test_pipe_satisfies_multi_step_without_splitting() {
        let result = parse("ps aux | grep node", true, false).unwrap();
        assert_eq!(result.commands, vec!["ps aux | grep node"]);
    }

    #[test]
    fn test_unrequested_chain_is_split() {
        let result = parse("cd src; ls", false, false).unwrap();
        assert_eq!(result.commands, vec!["cd src", "ls"]);
        assert_eq!(result.confidence, UNREQUESTED_CHAIN_CONFIDENCE);
    }

    #[test]
    fn test_quoted_and_escaped_separators_do_not_split() {
        let result = parse(r#"echo "a && b; c""#, false, false).unwrap();
        assert_eq!(result.commands, vec![r#"echo "a && b; c""#]);

        let result = parse(r"find . -name '*.tmp' -exec rm {} \;", false, false).unwrap();
        assert_eq!(result.commands.len(), 1);
        assert!(result.variables.is_none());
    }

    #[test]
    fn test_duplicate_variables_collapse() {
        let result = parse("cp {src} /tmp && ls {src} {dst}", false, false).unwrap();
        let vars = result.variables.unwrap();
        assert_eq!(vars.keys().collect::<Vec<_>>(), vec!["dst", "src"]);
    }

    #[test]
    fn test_rejections() {
        assert!(parse("", false, false).is_none());
        assert!(parse("```\n```", false, false).is_none());
        assert!(parse(&"a".repeat(181), false, false).is_none());
        assert!(parse("command1 && command2", false, false).is_none());
        assert!(parse("Which directory do you mean?", false, false).is_none());
        assert!(parse("I can help with that", false, false).is_none());
        assert!(parse("Ready when you are", false, false).is_none());
    }

    #[test]
    fn test_help_flag_is_not_conversational() {
        let result = parse("ls --help", false, false).unwrap();
        assert_eq!(result.commands, vec!["ls --help"]);
    }

    #[test]
    fn test_length_limit_is_inclusive() {
        let text = format!("echo {}", "x".repeat(MAX_COMMAND_LEN - 5));
        assert_eq!(text.len(), MAX_COMMAND_LEN);
        assert!(parse(&text, false, false).is_some());
    }

    #[test]
    fn test_learning_payload() {
        let raw = "du -sh *\n###LEARN###\n```json\n{\"summary\": \"Shows sizes\", \"breakdown\": [{\"part\": \"-s\", \"meaning\": \"summarize\"}]}\n```";
        let result = parse(raw, false, true).unwrap();
        assert_eq!(result.commands, vec!["du -sh *"]);
        let learning = result.learning.unwrap();
        assert_eq!(learning.summary, "Shows sizes");
        assert_eq!(learning.breakdown[0].part, "-s");
        assert!(learning.tips.is_empty());
        assert_eq!(result.explanation, "Shows sizes");
        assert!(result.tags.contains("learning"));
    }

    #[test]
    fn test_bad_learning_payload_is_omitted() {
        let result = parse("du -sh *\n###LEARN###\n{not json", false, true).unwrap();
        assert_eq!(result.commands, vec!["du -sh *"]);
        assert!(result.learning.is_none());
        assert_eq!(result.explanation, DEFAULT_EXPLANATION);
    }

    #[test]
    fn test_marker_ignored_outside_learning_mode() {
        let result = parse("uptime\n###LEARN###\n{}", false, false).unwrap();
        assert_eq!(result.commands, vec!["uptime"]);
        assert!(result.learning.is_none());
    }
}
