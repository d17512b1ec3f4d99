//! Capability providers that can answer requests, veto commands, or observe
//! executions.
//!
//! Plugins come from two places: in-process implementations of [`Plugin`]
//! registered at startup, and compiled executables found in the plugin
//! directory. Executables speak a small JSON protocol: the hook name is the
//! first argument, the request is written to stdin and the reply (or `null`)
//! is read from stdout. Scripts and source files are never loaded.

use crate::error::PluginError;
use crate::types::{OsInfo, ResolvedCommand, RiskLevel, SafetyResult, Source};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SOURCE_EXTENSIONS: &[&str] = &[
    "js", "mjs", "cjs", "ts", "py", "rb", "pl", "lua", "sh", "bash", "zsh", "fish", "ps1", "bat",
    "cmd", "php", "json", "toml", "yaml", "yml", "md", "txt",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub rules: bool,
    pub safety: bool,
    pub observer: bool,
}

pub trait Plugin {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn capabilities(&self) -> Capabilities;

    fn rules(&self, _input: &str, _os: &OsInfo) -> Result<Option<ResolvedCommand>, PluginError> {
        Ok(None)
    }

    fn safety_check(&self, _command: &ResolvedCommand) -> Result<Option<SafetyResult>, PluginError> {
        Ok(None)
    }

    fn on_command_executed(&self, _command: &ResolvedCommand, _success: bool) -> Result<(), PluginError> {
        Ok(())
    }
}

pub struct PluginManager {
    dir: Option<PathBuf>,
    timeout: Duration,
    plugins: Vec<Box<dyn Plugin>>,
    initialized: bool,
}

impl PluginManager {
    pub fn new(dir: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir,
            timeout,
            plugins: Vec::new(),
            initialized: false,
        }
    }

    /// A manager with no plugin directory and nothing registered.
    pub fn empty() -> Self {
        Self::new(None, Duration::from_millis(0))
    }

    /// Adds a plugin unless it lacks a name or version, or its name is taken.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> bool {
        let name = plugin.name().trim();
        let version = plugin.version().trim();
        if name.is_empty() || version.is_empty() {
            warn!("rejecting plugin without a name or version");
            return false;
        }
        if self.plugins.iter().any(|p| p.name() == name) {
            warn!(plugin = name, "duplicate plugin name, keeping the first one loaded");
            return false;
        }
        info!(plugin = name, version, "registered plugin");
        self.plugins.push(plugin);
        true
    }

    /// Loads plugins from the plugin directory. Runs once; later calls are
    /// no-ops.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        let Some(dir) = self.dir.clone() else {
            return;
        };
        for plugin in discover(&dir, self.timeout) {
            self.register(plugin);
        }
    }

    pub fn loaded(&self) -> Vec<(String, String)> {
        self.plugins
            .iter()
            .map(|p| (p.name().to_string(), p.version().to_string()))
            .collect()
    }

    pub fn has_rule_providers(&self) -> bool {
        self.plugins.iter().any(|p| p.capabilities().rules)
    }

    pub fn get_rules(&self, input: &str, os: &OsInfo) -> Option<ResolvedCommand> {
        for plugin in self.plugins.iter().filter(|p| p.capabilities().rules) {
            let result = isolate(plugin.as_ref(), "rules", || plugin.rules(input, os))
                .and_then(|r| r.map(|cmd| checked_rule(plugin.name(), cmd)).transpose());
            match result {
                Ok(Some(cmd)) => {
                    debug!(plugin = plugin.name(), "plugin rule matched");
                    return Some(cmd);
                }
                Ok(None) => {}
                Err(e) => warn!(plugin = plugin.name(), error = %e, "plugin rules hook failed"),
            }
        }
        None
    }

    pub fn get_safety_checks(&self, command: &ResolvedCommand) -> Option<SafetyResult> {
        for plugin in self.plugins.iter().filter(|p| p.capabilities().safety) {
            match isolate(plugin.as_ref(), "safety", || plugin.safety_check(command)) {
                Ok(Some(result)) => return Some(result),
                Ok(None) => {}
                Err(e) => warn!(plugin = plugin.name(), error = %e, "plugin safety hook failed"),
            }
        }
        None
    }

    /// Notifies every observer, whatever the others do.
    pub fn on_command_executed(&self, command: &ResolvedCommand, success: bool) {
        for plugin in self.plugins.iter().filter(|p| p.capabilities().observer) {
            if let Err(e) = isolate(plugin.as_ref(), "executed", || {
                plugin.on_command_executed(command, success)
            }) {
                warn!(plugin = plugin.name(), error = %e, "plugin observer hook failed");
            }
        }
    }
}

fn isolate<T>(
    plugin: &dyn Plugin,
    hook: &str,
    call: impl FnOnce() -> Result<T, PluginError>,
) -> Result<T, PluginError> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(_) => {
            warn!(plugin = plugin.name(), hook, "plugin panicked");
            Err(PluginError::Panicked)
        }
    }
}

fn checked_rule(plugin: &str, mut cmd: ResolvedCommand) -> Result<ResolvedCommand, PluginError> {
    if !cmd.is_well_formed() {
        return Err(PluginError::Malformed(
            "rule result needs commands and a confidence in [0, 1]".to_string(),
        ));
    }
    cmd.source = Source::Rule;
    cmd.tags.insert(format!("plugin:{}", plugin));
    Ok(cmd)
}

fn discover(dir: &Path, timeout: Duration) -> Vec<Box<dyn Plugin>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read plugin directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_loadable(p))
        .collect();
    paths.sort();

    let mut plugins: Vec<Box<dyn Plugin>> = Vec::new();
    for path in paths {
        match ProcessPlugin::describe(&path, timeout) {
            Ok(plugin) => plugins.push(Box::new(plugin)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping plugin"),
        }
    }
    plugins
}

fn is_loadable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    if hidden {
        return false;
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    if ext.as_deref().map_or(false, |e| SOURCE_EXTENSIONS.contains(&e)) {
        debug!(path = %path.display(), "skipping source file in plugin directory");
        return false;
    }
    if is_script(path) {
        debug!(path = %path.display(), "skipping script in plugin directory");
        return false;
    }
    is_executable(path)
}

fn is_script(path: &Path) -> bool {
    let mut head = [0u8; 2];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut head))
        .map(|_| &head == b"#!")
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(windows)]
fn is_executable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("exe"))
}

#[cfg(not(any(unix, windows)))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Deserialize)]
struct RuleReply {
    commands: Vec<String>,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_rule_confidence")]
    confidence: f64,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

fn default_rule_confidence() -> f64 {
    0.9
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SafetyReply {
    blocked: bool,
    warning: Option<String>,
    reason: Option<String>,
    risk_level: RiskLevel,
}

#[derive(Serialize)]
struct CommandPayload<'a> {
    commands: &'a [String],
    explanation: &'a str,
    source: Source,
    confidence: f64,
}

impl<'a> From<&'a ResolvedCommand> for CommandPayload<'a> {
    fn from(cmd: &'a ResolvedCommand) -> Self {
        Self {
            commands: &cmd.commands,
            explanation: &cmd.explanation,
            source: cmd.source,
            confidence: cmd.confidence,
        }
    }
}

/// A compiled plugin executable driven over stdin/stdout.
pub struct ProcessPlugin {
    path: PathBuf,
    name: String,
    version: String,
    capabilities: Capabilities,
    timeout: Duration,
}

impl ProcessPlugin {
    pub fn describe(path: &Path, timeout: Duration) -> Result<Self, PluginError> {
        let out = run_with_timeout(path, &["describe"], "", timeout)?;
        let manifest: Manifest = serde_json::from_str(out.trim())?;
        let capabilities = Capabilities {
            rules: manifest.capabilities.iter().any(|c| c == "rules"),
            safety: manifest.capabilities.iter().any(|c| c == "safety"),
            observer: manifest.capabilities.iter().any(|c| c == "executed"),
        };
        Ok(Self {
            path: path.to_path_buf(),
            name: manifest.name.trim().to_string(),
            version: manifest.version.trim().to_string(),
            capabilities,
            timeout,
        })
    }

    fn call<T: DeserializeOwned>(&self, hook: &str, request: &serde_json::Value) -> Result<Option<T>, PluginError> {
        let out = run_with_timeout(&self.path, &[hook], &request.to_string(), self.timeout)?;
        let out = out.trim();
        if out.is_empty() || out == "null" {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(out)?))
    }
}

impl Plugin for ProcessPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn rules(&self, input: &str, os: &OsInfo) -> Result<Option<ResolvedCommand>, PluginError> {
        let reply: Option<RuleReply> = self.call("rules", &json!({ "input": input, "os": os }))?;
        Ok(reply.map(|r| {
            let mut cmd = ResolvedCommand::new(r.commands, Source::Rule)
                .with_explanation(r.explanation)
                .with_tags(r.tags)
                .with_variables(r.variables);
            // Out-of-range values must surface as malformed, not be clamped away.
            cmd.confidence = r.confidence;
            cmd
        }))
    }

    fn safety_check(&self, command: &ResolvedCommand) -> Result<Option<SafetyResult>, PluginError> {
        let reply: Option<SafetyReply> =
            self.call("safety", &serde_json::to_value(CommandPayload::from(command))?)?;
        Ok(reply.map(|r| SafetyResult {
            blocked: r.blocked,
            warning: r.warning,
            reason: r.reason,
            risk_level: r.risk_level,
        }))
    }

    fn on_command_executed(&self, command: &ResolvedCommand, success: bool) -> Result<(), PluginError> {
        let request = json!({ "command": CommandPayload::from(command), "success": success });
        run_with_timeout(&self.path, &["executed"], &request.to_string(), self.timeout)?;
        Ok(())
    }
}

/// Runs `program args...`, feeding `input` on stdin, and returns stdout. The
/// child is killed once `timeout` elapses.
fn run_with_timeout(
    program: &Path,
    args: &[&str],
    input: &str,
    timeout: Duration,
) -> Result<String, PluginError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(input.as_bytes()) {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        }
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| PluginError::Spawn("stdout not captured".to_string()))?;
    let reader = thread::spawn(move || {
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).map(|_| buf)
    });

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) if status.success() => break,
            Some(status) => return Err(PluginError::Exit(status.to_string())),
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PluginError::Timeout(timeout.as_millis() as u64));
            }
            None => thread::sleep(Duration::from_millis(10)),
        }
    }

    reader
        .join()
        .map_err(|_| PluginError::Protocol("stdout reader panicked".to_string()))?
        .map_err(|e| PluginError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use std::cell::Cell;
    use std::rc::Rc;

    fn linux() -> OsInfo {
        OsInfo {
            platform: Platform::Linux,
            arch: "x86_64".to_string(),
            shell: "bash".to_string(),
        }
    }

    enum Behavior {
        Answer(&'static str),
        Nothing,
        Fail,
        Panic,
        Malformed,
    }

    struct TestPlugin {
        name: &'static str,
        version: &'static str,
        behavior: Behavior,
        calls: Rc<Cell<usize>>,
    }

    impl TestPlugin {
        fn boxed(name: &'static str, behavior: Behavior) -> (Box<dyn Plugin>, Rc<Cell<usize>>) {
            let calls = Rc::new(Cell::new(0));
            let plugin = TestPlugin {
                name,
                version: "1.0.0",
                behavior,
                calls: Rc::clone(&calls),
            };
            (Box::new(plugin), calls)
        }
    }

    impl Plugin for TestPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn version(&self) -> &str {
            self.version
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                rules: true,
                safety: true,
                observer: true,
            }
        }

        fn rules(&self, _input: &str, _os: &OsInfo) -> Result<Option<ResolvedCommand>, PluginError> {
            self.calls.set(self.calls.get() + 1);
            match self.behavior {
                Behavior::Answer(cmd) => Ok(Some(
                    ResolvedCommand::new(vec![cmd.to_string()], Source::Ai).with_confidence(0.9),
                )),
                Behavior::Nothing => Ok(None),
                Behavior::Fail => Err(PluginError::Protocol("bad reply".to_string())),
                Behavior::Panic => panic!("plugin bug"),
                Behavior::Malformed => Ok(Some(ResolvedCommand::new(vec![], Source::Rule))),
            }
        }

        fn safety_check(&self, _command: &ResolvedCommand) -> Result<Option<SafetyResult>, PluginError> {
            match self.behavior {
                Behavior::Answer(reason) => Ok(Some(SafetyResult::blocked(reason))),
                Behavior::Panic => panic!("plugin bug"),
                Behavior::Fail => Err(PluginError::Timeout(10)),
                _ => Ok(None),
            }
        }

        fn on_command_executed(&self, _command: &ResolvedCommand, _success: bool) -> Result<(), PluginError> {
            self.calls.set(self.calls.get() + 1);
            match self.behavior {
                Behavior::Panic => panic!("plugin bug"),
                Behavior::Fail => Err(PluginError::Exit("1".to_string())),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_first_rule_match_short_circuits() {
        let mut manager = PluginManager::empty();
        let (first, first_calls) = TestPlugin::boxed("first", Behavior::Answer("ls"));
        let (second, second_calls) = TestPlugin::boxed("second", Behavior::Answer("pwd"));
        manager.register(first);
        manager.register(second);

        let cmd = manager.get_rules("list", &linux()).unwrap();
        assert_eq!(cmd.commands, vec!["ls"]);
        assert_eq!(cmd.source, Source::Rule);
        assert!(cmd.tags.contains("plugin:first"));
        assert_eq!(first_calls.get(), 1);
        assert_eq!(second_calls.get(), 0);
    }

    #[test]
    fn test_faulty_plugins_are_skipped() {
        let mut manager = PluginManager::empty();
        let (panicky, _) = TestPlugin::boxed("panicky", Behavior::Panic);
        let (failing, _) = TestPlugin::boxed("failing", Behavior::Fail);
        let (malformed, _) = TestPlugin::boxed("malformed", Behavior::Malformed);
        let (good, good_calls) = TestPlugin::boxed("good", Behavior::Answer("uptime"));
        manager.register(panicky);
        manager.register(failing);
        manager.register(malformed);
        manager.register(good);

        let cmd = manager.get_rules("how long up", &linux()).unwrap();
        assert_eq!(cmd.commands, vec!["uptime"]);
        assert_eq!(good_calls.get(), 1);
    }

    #[test]
    fn test_safety_first_non_null_wins() {
        let mut manager = PluginManager::empty();
        let (quiet, _) = TestPlugin::boxed("quiet", Behavior::Nothing);
        let (broken, _) = TestPlugin::boxed("broken", Behavior::Fail);
        let (veto, _) = TestPlugin::boxed("veto", Behavior::Answer("policy says no"));
        let (late, _) = TestPlugin::boxed("late", Behavior::Answer("never seen"));
        manager.register(quiet);
        manager.register(broken);
        manager.register(veto);
        manager.register(late);

        let cmd = ResolvedCommand::new(vec!["ls".to_string()], Source::Ai);
        let result = manager.get_safety_checks(&cmd).unwrap();
        assert!(result.blocked);
        assert_eq!(result.reason.as_deref(), Some("policy says no"));
    }

    #[test]
    fn test_observers_all_run_despite_failures() {
        let mut manager = PluginManager::empty();
        let (a, a_calls) = TestPlugin::boxed("a", Behavior::Panic);
        let (b, b_calls) = TestPlugin::boxed("b", Behavior::Fail);
        let (c, c_calls) = TestPlugin::boxed("c", Behavior::Nothing);
        manager.register(a);
        manager.register(b);
        manager.register(c);

        let cmd = ResolvedCommand::new(vec!["ls".to_string()], Source::Ai);
        manager.on_command_executed(&cmd, true);
        assert_eq!(a_calls.get(), 1);
        assert_eq!(b_calls.get(), 1);
        assert_eq!(c_calls.get(), 1);
    }

    #[test]
    fn test_registration_rules() {
        let mut manager = PluginManager::empty();
        let (first, _) = TestPlugin::boxed("dup", Behavior::Answer("ls"));
        let (second, second_calls) = TestPlugin::boxed("dup", Behavior::Answer("pwd"));
        assert!(manager.register(first));
        assert!(!manager.register(second));

        let nameless = TestPlugin {
            name: " ",
            version: "1.0",
            behavior: Behavior::Nothing,
            calls: Rc::new(Cell::new(0)),
        };
        assert!(!manager.register(Box::new(nameless)));
        let versionless = TestPlugin {
            name: "nover",
            version: "",
            behavior: Behavior::Nothing,
            calls: Rc::new(Cell::new(0)),
        };
        assert!(!manager.register(Box::new(versionless)));

        assert_eq!(manager.loaded(), vec![("dup".to_string(), "1.0.0".to_string())]);
        assert_eq!(manager.get_rules("x", &linux()).unwrap().commands, vec!["ls"]);
        assert_eq!(second_calls.get(), 0);
    }

    #[test]
    fn test_no_plugins_means_no_answers() {
        let manager = PluginManager::empty();
        assert!(!manager.has_rule_providers());
        assert!(manager.get_rules("x", &linux()).is_none());
        let cmd = ResolvedCommand::new(vec!["ls".to_string()], Source::Ai);
        assert!(manager.get_safety_checks(&cmd).is_none());
    }

    #[test]
    fn test_init_is_idempotent_and_tolerates_missing_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut manager = PluginManager::new(Some(dir.path().join("missing")), Duration::from_millis(100));
        manager.init();
        manager.init();
        assert!(manager.loaded().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_discovery_skips_sources_and_scripts() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("tool");
        fs::write(&script, "#!/bin/sh\necho '{}'\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let source = dir.path().join("plugin.py");
        fs::write(&source, "print('hi')").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o755)).unwrap();
        let plain = dir.path().join("data");
        fs::write(&plain, "\x7fELF").unwrap();

        assert!(!is_loadable(&script));
        assert!(!is_loadable(&source));
        assert!(!is_loadable(&plain));

        let mut manager = PluginManager::new(Some(dir.path().to_path_buf()), Duration::from_millis(100));
        manager.init();
        assert!(manager.loaded().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_pipes_stdin() {
        let out = run_with_timeout(Path::new("/bin/sh"), &["-c", "cat"], "hello", Duration::from_secs(5)).unwrap();
        assert_eq!(out, "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_kills_hung_child() {
        let started = Instant::now();
        let err = run_with_timeout(Path::new("/bin/sh"), &["-c", "sleep 5"], "", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, PluginError::Timeout(100)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_reports_exit_status() {
        let err = run_with_timeout(Path::new("/bin/sh"), &["-c", "exit 3"], "", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, PluginError::Exit(_)));
    }

    #[test]
    fn test_safety_reply_uses_camel_case() {
        let reply: SafetyReply =
            serde_json::from_str(r#"{"blocked":false,"warning":"careful","reason":null,"riskLevel":"medium"}"#).unwrap();
        assert_eq!(reply.risk_level, RiskLevel::Medium);
        assert_eq!(reply.warning.as_deref(), Some("careful"));
    }
}
