use crate::ai::AiGateway;
use crate::plugins::PluginManager;
use crate::rules;
use crate::types::{OsInfo, ResolvedCommand, TierOutcome};
use crate::vault::Vault;
use tracing::{debug, info, warn};

pub const DEFAULT_VAULT_MIN_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Plugin,
    Vault,
    Rule,
    Ai,
}

impl Tier {
    fn as_str(&self) -> &'static str {
        match self {
            Tier::Plugin => "plugin",
            Tier::Vault => "vault",
            Tier::Rule => "rule",
            Tier::Ai => "ai",
        }
    }
}

pub struct Resolver {
    plugins: PluginManager,
    vault: Option<Box<dyn Vault>>,
    gateway: AiGateway,
    vault_min_confidence: f64,
}

impl Resolver {
    pub fn new(plugins: PluginManager, vault: Option<Box<dyn Vault>>, gateway: AiGateway) -> Self {
        Self {
            plugins,
            vault,
            gateway,
            vault_min_confidence: DEFAULT_VAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_vault_min_confidence(mut self, min: f64) -> Self {
        self.vault_min_confidence = min;
        self
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub fn plugins_mut(&mut self) -> &mut PluginManager {
        &mut self.plugins
    }

    pub fn gateway(&self) -> &AiGateway {
        &self.gateway
    }

    pub fn vault(&self) -> Option<&dyn Vault> {
        self.vault.as_deref()
    }

    pub fn resolve(
        &mut self,
        input: &str,
        os: &OsInfo,
        learning_mode: bool,
        suggest_mode: bool,
    ) -> Option<ResolvedCommand> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        self.plugins.init();

        let wants_multiple = rules::wants_multiple_steps(input);
        debug!(input, wants_multiple, learning_mode, suggest_mode, "resolving");

        // First well-formed result wins; tier failures are misses, never errors.
        for tier in [Tier::Plugin, Tier::Vault, Tier::Rule, Tier::Ai] {
            let outcome = match tier {
                Tier::Plugin => self.plugin_tier(input, os),
                Tier::Vault if suggest_mode => continue,
                Tier::Vault => self.vault_tier(input),
                Tier::Rule if wants_multiple => continue,
                Tier::Rule => rule_tier(input, os),
                Tier::Ai => self.gateway.resolve(input, os, wants_multiple, learning_mode),
            };

            match outcome {
                TierOutcome::Resolved(cmd) if cmd.is_well_formed() => {
                    info!(tier = tier.as_str(), source = %cmd.source, "resolved");
                    return Some(cmd);
                }
                TierOutcome::Resolved(_) => {
                    warn!(tier = tier.as_str(), "discarding malformed result");
                }
                TierOutcome::Miss => debug!(tier = tier.as_str(), "miss"),
                TierOutcome::Degraded(reason) => {
                    warn!(tier = tier.as_str(), reason = %reason, "tier degraded");
                }
            }
        }

        None
    }

    fn plugin_tier(&self, input: &str, os: &OsInfo) -> TierOutcome {
        if !self.plugins.has_rule_providers() {
            return TierOutcome::Miss;
        }
        match self.plugins.get_rules(input, os) {
            Some(cmd) => TierOutcome::Resolved(cmd),
            None => TierOutcome::Miss,
        }
    }

    fn vault_tier(&self, input: &str) -> TierOutcome {
        let Some(vault) = &self.vault else {
            return TierOutcome::Miss;
        };

        let entries = match vault.search(input) {
            Ok(entries) => entries,
            Err(e) => return TierOutcome::Degraded(format!("vault search failed: {}", e)),
        };
        let Some(best) = entries.into_iter().next() else {
            return TierOutcome::Miss;
        };
        if best.confidence < self.vault_min_confidence {
            debug!(id = best.id, confidence = best.confidence, "vault match below threshold");
            return TierOutcome::Miss;
        }

        if let Err(e) = vault.record_usage(best.id) {
            warn!(id = best.id, error = %e, "failed to record vault usage");
        }
        TierOutcome::Resolved(best.to_resolved())
    }
}

fn rule_tier(input: &str, os: &OsInfo) -> TierOutcome {
    match rules::match_rule(input, os) {
        Some(cmd) => TierOutcome::Resolved(cmd),
        None => TierOutcome::Miss,
    }
}
