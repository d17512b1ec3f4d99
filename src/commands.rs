use crate::ai::{AiBackend, AiGateway, GeminiClient, PROMPT_VERSION};
use crate::cache::CacheManager;
use crate::config::{
    get_cache_path, get_config_path, get_plugin_dir, get_vault_path, save_config, Config,
};
use crate::executor::execute_commands;
use crate::os;
use crate::parser::extract_variables;
use crate::plugins::PluginManager;
use crate::resolver::Resolver;
use crate::safety::{with_dry_run, SafetyValidator};
use crate::types::{OsInfo, ResolvedCommand, SafetyResult, Source};
use crate::ui::{
    edit_command, print_blocked, print_resolved, prompt_action, prompt_variables,
    show_explanation, Action,
};
use crate::vault::{NewEntry, SqliteVault, Vault};
use std::time::Duration;
use std::{env, fs, io::Write, process::Command};
use tracing::{debug, warn};

type CmdResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub explain: bool,
    pub learn: bool,
    pub suggest: bool,
}

pub fn build_resolver(config: &Config) -> Resolver {
    let plugins = if config.plugins.enabled {
        PluginManager::new(
            Some(get_plugin_dir(&config.plugins)),
            Duration::from_millis(config.plugins.timeout_ms),
        )
    } else {
        PluginManager::empty()
    };

    let vault: Option<Box<dyn Vault>> = if config.vault.enabled {
        match SqliteVault::open(&get_vault_path()) {
            Ok(vault) => Some(Box::new(vault)),
            Err(e) => {
                warn!(error = %e, "vault unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let backend = GeminiClient::from_config(&config.llm).map(|c| Box::new(c) as Box<dyn AiBackend>);
    let model_id = backend
        .as_ref()
        .map_or(config.llm.model.as_str(), |b| b.model_id());
    let cache = CacheManager::new(get_cache_path(), &config.cache, model_id, PROMPT_VERSION);

    Resolver::new(plugins, vault, AiGateway::new(backend, cache))
        .with_vault_min_confidence(config.vault.min_confidence)
}

pub fn cmd_query(query: &str, config: &Config, opts: QueryOptions) -> CmdResult {
    let os = os::detect();
    let mut resolver = build_resolver(config);
    let learning = opts.learn || config.behavior.learning_mode;

    eprint!("thinking...");
    std::io::stderr().flush().ok();
    let resolved = resolver.resolve(query, &os, learning, opts.suggest);
    eprint!("\r           \r");

    let Some(resolved) = resolved else {
        println!("could not find a command for this request.");
        if !resolver.gateway().is_configured() {
            println!("  set CMDR_API_KEY (or GEMINI_API_KEY) to enable AI suggestions");
        }
        return Ok(());
    };

    let validator = SafetyValidator::new(&config.safety);
    let safety = validator.validate(&resolved, resolver.plugins());
    if safety.blocked {
        print_blocked(&resolved, &safety);
        return Ok(());
    }

    print_resolved(&resolved, &safety);

    if opts.explain {
        show_explanation(&resolved);
        return Ok(());
    }

    let dry_run_available = dry_run_commands(&resolved.commands).is_some();

    loop {
        match prompt_action(dry_run_available) {
            Some(Action::Run) => {
                let Some(commands) = fill_variables(&resolved) else {
                    println!("cancelled.");
                    break;
                };
                if !approve(&validator, resolver.plugins(), &resolved, &commands) {
                    break;
                }
                run(&resolver, config, &os, query, &resolved, &commands)?;
                break;
            }
            Some(Action::Edit) => {
                let Some(edited) = edit_command(&resolved.commands.join(" && ")) else {
                    continue;
                };
                let lines: Vec<String> = edited
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect();
                if lines.is_empty() {
                    continue;
                }

                let variables = extract_variables(&lines);
                let edited = ResolvedCommand::new(lines, Source::User)
                    .with_explanation(resolved.explanation.clone())
                    .with_confidence(1.0)
                    .with_variables(variables);
                let check = validator.validate(&edited, resolver.plugins());
                if check.blocked {
                    print_blocked(&edited, &check);
                    continue;
                }
                if let Some(warning) = &check.warning {
                    eprintln!("warning: {}", warning);
                }
                let Some(commands) = fill_variables(&edited) else {
                    println!("cancelled.");
                    break;
                };
                if !approve(&validator, resolver.plugins(), &edited, &commands) {
                    break;
                }
                run(&resolver, config, &os, query, &edited, &commands)?;
                break;
            }
            Some(Action::Explain) => show_explanation(&resolved),
            Some(Action::DryRun) => {
                let Some(commands) = fill_variables(&resolved) else {
                    continue;
                };
                let Some(dry) = dry_run_commands(&commands) else {
                    continue;
                };
                if !approve(&validator, resolver.plugins(), &resolved, &dry) {
                    continue;
                }
                for line in &dry {
                    println!("  {}", line);
                }
                let report = execute_commands(&dry, os.platform, config.safety.max_output_lines)?;
                println!("{}", report.output);
            }
            Some(Action::Quit) | None => {
                println!("cancelled.");
                break;
            }
        }
    }

    Ok(())
}

fn fill_variables(cmd: &ResolvedCommand) -> Option<Vec<String>> {
    match &cmd.variables {
        Some(variables) => {
            let values = prompt_variables(variables)?;
            Some(cmd.render(&values))
        }
        None => Some(cmd.commands.clone()),
    }
}

/// Validates the commands that will actually run, which differ from `base`
/// once placeholders are filled in or dry-run flags added.
fn recheck(
    validator: &SafetyValidator,
    plugins: &PluginManager,
    base: &ResolvedCommand,
    commands: &[String],
) -> (ResolvedCommand, SafetyResult) {
    let rendered = ResolvedCommand {
        commands: commands.to_vec(),
        variables: None,
        ..base.clone()
    };
    let check = validator.validate(&rendered, plugins);
    (rendered, check)
}

fn approve(
    validator: &SafetyValidator,
    plugins: &PluginManager,
    base: &ResolvedCommand,
    commands: &[String],
) -> bool {
    let (rendered, check) = recheck(validator, plugins, base, commands);
    if check.blocked {
        print_blocked(&rendered, &check);
        return false;
    }
    // Warnings for the unchanged sequence were already shown.
    if commands != base.commands.as_slice() {
        if let Some(warning) = &check.warning {
            eprintln!("warning: {}", warning);
        }
    }
    true
}

/// The dry-run form of every command, or `None` when any of them has none.
fn dry_run_commands(commands: &[String]) -> Option<Vec<String>> {
    commands.iter().map(|c| with_dry_run(c)).collect()
}

fn run(
    resolver: &Resolver,
    config: &Config,
    os: &OsInfo,
    query: &str,
    resolved: &ResolvedCommand,
    commands: &[String],
) -> CmdResult {
    let report = execute_commands(commands, os.platform, config.safety.max_output_lines)?;
    if !report.output.is_empty() {
        println!("{}", report.output);
    }
    resolver.plugins().on_command_executed(resolved, report.succeeded);

    if !report.succeeded || resolved.source == Source::Vault || !config.behavior.save_to_vault {
        return Ok(());
    }
    if let Some(vault) = resolver.vault() {
        let entry = NewEntry {
            name: None,
            commands: resolved.commands.clone(),
            description: description_for(query, resolved),
            tags: resolved.tags.iter().cloned().collect(),
            confidence: resolved.confidence,
            source: resolved.source,
            variables: resolved.variables.clone(),
        };
        match vault.save(&entry) {
            Ok(id) => debug!(id, "saved command to vault"),
            Err(e) => warn!(error = %e, "failed to save command to vault"),
        }
    }
    Ok(())
}

fn description_for(query: &str, resolved: &ResolvedCommand) -> String {
    if resolved.source == Source::Ai || resolved.explanation.is_empty() {
        query.trim().to_string()
    } else {
        format!("{} ({})", query.trim(), resolved.explanation)
    }
}

pub fn cmd_save(name: &str, commands: &[String], description: Option<&str>, tags: &[String]) -> CmdResult {
    let commands: Vec<String> = commands
        .join(" ")
        .split("&&")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect();
    if commands.is_empty() {
        return Err("nothing to save".into());
    }

    let variables = extract_variables(&commands);
    let vault = SqliteVault::open(&get_vault_path())?;
    let id = vault.add(&NewEntry {
        name: Some(name.to_string()),
        commands,
        description: description.unwrap_or_default().to_string(),
        tags: tags.to_vec(),
        confidence: 1.0,
        source: Source::User,
        variables: if variables.is_empty() { None } else { Some(variables) },
    })?;

    println!("saved '{}' as #{}", name, id);
    Ok(())
}

pub fn cmd_list() -> CmdResult {
    let path = get_vault_path();
    if !path.exists() {
        println!("vault is empty.");
        return Ok(());
    }

    let entries = SqliteVault::open(&path)?.list()?;
    if entries.is_empty() {
        println!("vault is empty.");
        return Ok(());
    }

    for entry in entries {
        let label = entry.name.as_deref().unwrap_or(entry.description.as_str());
        println!(
            "#{:<4} {}  ({}, used {}x)",
            entry.id, label, entry.source, entry.usage_count
        );
        for cmd in &entry.commands {
            println!("      {}", cmd);
        }
    }
    Ok(())
}

pub fn cmd_remove(id: i64) -> CmdResult {
    SqliteVault::open(&get_vault_path())?.remove(id)?;
    println!("removed #{}", id);
    Ok(())
}

pub fn cmd_cache_clear(config: &Config) -> CmdResult {
    let cache = CacheManager::new(get_cache_path(), &config.cache, &config.llm.model, PROMPT_VERSION);
    cache.clear();
    println!("cache cleared.");
    Ok(())
}

pub fn cmd_doctor(config: &Config) -> CmdResult {
    println!("diagnostics:");
    println!();

    let info = os::detect();
    println!("  system ... {} / {} / {}", info.platform, info.arch, info.shell);

    print!("  ai backend ... ");
    std::io::stdout().flush().ok();
    match GeminiClient::from_config(&config.llm) {
        Some(client) => match client.generate("Reply with the single word ok.") {
            Ok(_) => println!("ok ({})", client.model_id()),
            Err(e) => {
                println!("failed");
                println!("    error: {}", e);
            }
        },
        None => {
            println!("not configured");
            println!("    set CMDR_API_KEY or llm.api_key in the config");
        }
    }

    let mut resolver = build_resolver(config);

    print!("  vault ... ");
    std::io::stdout().flush().ok();
    if !config.vault.enabled {
        println!("disabled");
    } else if resolver.vault().is_some() {
        match SqliteVault::open(&get_vault_path()) {
            Ok(vault) => println!("ok ({} entries)", vault.count()),
            Err(e) => println!("failed ({})", e),
        }
    } else {
        println!("unavailable");
        println!("    path: {}", get_vault_path().display());
    }

    let cache = resolver.gateway().cache();
    if config.cache.enabled {
        println!("  cache ... ok ({} entries)", cache.entry_count());
    } else {
        println!("  cache ... disabled");
    }
    println!("    path: {}", cache.path().display());

    print!("  plugins ... ");
    std::io::stdout().flush().ok();
    resolver.plugins_mut().init();
    let loaded = resolver.plugins().loaded();
    if loaded.is_empty() {
        println!("none");
    } else {
        println!("{} loaded", loaded.len());
        for (name, version) in loaded {
            println!("    {} {}", name, version);
        }
    }

    print!("  config ... ");
    std::io::stdout().flush().ok();
    if get_config_path().exists() {
        println!("ok");
    } else {
        println!("using defaults");
    }

    println!();
    Ok(())
}

pub fn cmd_config() -> CmdResult {
    let config_path = get_config_path();

    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        save_config(&Config::default())?;
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    Command::new(&editor).arg(&config_path).status()?;

    Ok(())
}
