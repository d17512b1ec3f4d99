use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Rule,
    Ai,
    Vault,
    User,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Rule => "rule",
            Source::Ai => "ai",
            Source::Vault => "vault",
            Source::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rule" => Some(Source::Rule),
            "ai" => Some(Source::Ai),
            "vault" => Some(Source::Vault),
            "user" => Some(Source::User),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakdownItem {
    #[serde(default)]
    pub part: String,
    #[serde(default)]
    pub meaning: String,
}

/// Pedagogical payload returned alongside a command in learning mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningContent {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub breakdown: Vec<BreakdownItem>,
    #[serde(default)]
    pub tips: Vec<String>,
}

/// A command sequence produced by one of the resolution tiers.
///
/// `commands` is never empty for a value that leaves the resolver, and
/// `confidence` is always clamped into `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCommand {
    pub commands: Vec<String>,
    pub explanation: String,
    pub tags: BTreeSet<String>,
    pub confidence: f64,
    pub source: Source,
    pub variables: Option<BTreeMap<String, String>>,
    pub learning: Option<LearningContent>,
}

impl ResolvedCommand {
    pub fn new(commands: Vec<String>, source: Source) -> Self {
        Self {
            commands,
            explanation: String::new(),
            tags: BTreeSet::new(),
            confidence: 0.0,
            source,
            variables: None,
            learning: None,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = if variables.is_empty() {
            None
        } else {
            Some(variables)
        };
        self
    }

    pub fn with_learning(mut self, learning: Option<LearningContent>) -> Self {
        self.learning = learning;
        self
    }

    /// True when the value satisfies the invariants a resolver result must hold.
    pub fn is_well_formed(&self) -> bool {
        !self.commands.is_empty()
            && self.commands.iter().all(|c| !c.trim().is_empty())
            && (0.0..=1.0).contains(&self.confidence)
    }

    /// Substitutes `{name}` placeholders using `values`, falling back to the
    /// declared defaults. Unknown placeholders are left untouched.
    pub fn render(&self, values: &BTreeMap<String, String>) -> Vec<String> {
        let Some(defaults) = &self.variables else {
            return self.commands.clone();
        };

        self.commands
            .iter()
            .map(|cmd| {
                let mut out = cmd.clone();
                for (name, default) in defaults {
                    let value = values.get(name).unwrap_or(default);
                    out = out.replace(&format!("{{{}}}", name), value);
                }
                out
            })
            .collect()
    }
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => f.write_str("low"),
            RiskLevel::Medium => f.write_str("medium"),
            RiskLevel::High => f.write_str("high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyResult {
    pub blocked: bool,
    pub warning: Option<String>,
    pub reason: Option<String>,
    pub risk_level: RiskLevel,
}

impl SafetyResult {
    pub fn low() -> Self {
        Self {
            blocked: false,
            warning: None,
            reason: None,
            risk_level: RiskLevel::Low,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            warning: None,
            reason: Some(reason.into()),
            risk_level: RiskLevel::High,
        }
    }

    pub fn warn(warning: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            blocked: false,
            warning: Some(warning.into()),
            reason: None,
            risk_level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Linux,
    Macos,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Macos => "macos",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub platform: Platform,
    pub arch: String,
    pub shell: String,
}

/// A stored command, as kept by the vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub id: i64,
    pub name: Option<String>,
    pub commands: Vec<String>,
    pub description: String,
    pub tags: Vec<String>,
    pub usage_count: u32,
    pub last_used: Option<i64>,
    pub created_at: i64,
    pub confidence: f64,
    pub source: Source,
    pub variables: Option<BTreeMap<String, String>>,
}

impl CommandEntry {
    pub fn to_resolved(&self) -> ResolvedCommand {
        let explanation = match &self.name {
            Some(name) if self.description.is_empty() => format!("Saved command '{}'", name),
            _ => self.description.clone(),
        };
        ResolvedCommand::new(self.commands.clone(), Source::Vault)
            .with_explanation(explanation)
            .with_confidence(self.confidence)
            .with_tags(self.tags.iter().cloned())
            .with_tag("vault")
            .with_variables(self.variables.clone().unwrap_or_default())
    }
}

/// What a single resolution tier produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TierOutcome {
    Resolved(ResolvedCommand),
    Miss,
    /// The tier could not answer because of a failure it recovered from.
    Degraded(String),
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub succeeded: bool,
    pub output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_clamped() {
        let cmd = ResolvedCommand::new(vec!["ls".into()], Source::Ai).with_confidence(1.7);
        assert_eq!(cmd.confidence, 1.0);
        let cmd = cmd.with_confidence(-0.2);
        assert_eq!(cmd.confidence, 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
    }

    #[test]
    fn test_empty_variables_become_none() {
        let cmd = ResolvedCommand::new(vec!["ls".into()], Source::Rule)
            .with_variables(BTreeMap::new());
        assert!(cmd.variables.is_none());
    }

    #[test]
    fn test_render_substitutes_values_and_defaults() {
        let mut vars = BTreeMap::new();
        vars.insert("msg".to_string(), "wip".to_string());
        vars.insert("branch".to_string(), String::new());
        let cmd = ResolvedCommand::new(
            vec![
                "git commit -m {msg}".into(),
                "git push origin {branch}".into(),
                "find . -exec rm {} \\;".into(),
            ],
            Source::Ai,
        )
        .with_variables(vars);

        let mut values = BTreeMap::new();
        values.insert("branch".to_string(), "main".to_string());
        let rendered = cmd.render(&values);
        assert_eq!(rendered[0], "git commit -m wip");
        assert_eq!(rendered[1], "git push origin main");
        assert_eq!(rendered[2], "find . -exec rm {} \\;");
    }

    #[test]
    fn test_well_formed() {
        assert!(ResolvedCommand::new(vec!["ls".into()], Source::Ai)
            .with_confidence(0.5)
            .is_well_formed());
        assert!(!ResolvedCommand::new(vec![], Source::Ai).is_well_formed());
        assert!(!ResolvedCommand::new(vec!["  ".into()], Source::Ai).is_well_formed());
    }

    #[test]
    fn test_vault_entry_converts_to_vault_source() {
        let entry = CommandEntry {
            id: 3,
            name: Some("deploy".into()),
            commands: vec!["make deploy".into()],
            description: String::new(),
            tags: vec!["ops".into()],
            usage_count: 2,
            last_used: None,
            created_at: 0,
            confidence: 0.9,
            source: Source::User,
            variables: None,
        };
        let resolved = entry.to_resolved();
        assert_eq!(resolved.source, Source::Vault);
        assert_eq!(resolved.explanation, "Saved command 'deploy'");
        assert!(resolved.tags.contains("ops"));
        assert!(resolved.tags.contains("vault"));
    }
}
