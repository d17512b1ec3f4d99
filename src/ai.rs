use crate::cache::CacheManager;
use crate::config::LlmConfig;
use crate::error::AiError;
use crate::parser;
use crate::types::{OsInfo, Platform, TierOutcome};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bumped whenever the prompt changes so stale cache entries stop matching.
pub const PROMPT_VERSION: &str = "v3";

pub trait AiBackend {
    fn model_id(&self) -> &str;
    fn generate(&self, prompt: &str) -> Result<String, AiError>;
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

pub struct GeminiClient {
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_output_tokens: u32,
    client: reqwest::blocking::Client,
}

impl GeminiClient {
    /// Returns `None` for any provider other than `gemini`, or when no api
    /// key is configured.
    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        if !config.provider.trim().eq_ignore_ascii_case("gemini") {
            warn!(provider = %config.provider, "unsupported AI provider, AI tier disabled");
            return None;
        }
        let api_key = config.resolved_api_key()?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|e| {
                warn!(%e, "http client build failed; falling back to default client");
                reqwest::blocking::Client::new()
            });
        Some(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            client,
        })
    }
}

impl AiBackend for GeminiClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn generate(&self, prompt: &str) -> Result<String, AiError> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        };

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.as_str())
            .json(&body)
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(AiError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: GenerateResponse = resp.json()?;
        extract_text(parsed)
    }
}

fn extract_text(resp: GenerateResponse) -> Result<String, AiError> {
    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| AiError::ResponseFormat("no candidates".to_string()))?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(AiError::ResponseFormat("empty candidate".to_string()));
    }
    Ok(text)
}

/// The terminal resolution tier: cache, then backend, then parser.
pub struct AiGateway {
    backend: Option<Box<dyn AiBackend>>,
    cache: CacheManager,
}

impl AiGateway {
    pub fn new(backend: Option<Box<dyn AiBackend>>, cache: CacheManager) -> Self {
        Self { backend, cache }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn resolve(
        &self,
        input: &str,
        os: &OsInfo,
        wants_multiple: bool,
        learning_mode: bool,
    ) -> TierOutcome {
        let Some(backend) = &self.backend else {
            info!("no AI provider configured");
            return TierOutcome::Miss;
        };

        if let Some(cached) = self.cache.get(input, os, learning_mode) {
            if let Some(resolved) = parser::parse(&cached, wants_multiple, learning_mode) {
                debug!("answered from cache");
                return TierOutcome::Resolved(resolved.with_tag("cached"));
            }
            debug!("cached response no longer parses, asking the backend");
        }

        let prompt = build_prompt(input, os, wants_multiple, learning_mode);
        let raw = match backend.generate(&prompt) {
            Ok(raw) => raw,
            Err(e) => return TierOutcome::Degraded(format!("AI backend failed: {}", e)),
        };

        match parser::parse(&raw, wants_multiple, learning_mode) {
            Some(resolved) => {
                self.cache.set(input, os, learning_mode, &raw);
                TierOutcome::Resolved(resolved)
            }
            None => {
                debug!(raw = %raw, "model output rejected");
                TierOutcome::Miss
            }
        }
    }
}

pub fn build_prompt(input: &str, os: &OsInfo, wants_multiple: bool, learning_mode: bool) -> String {
    let platform_hint = match os.platform {
        Platform::Windows => "Windows. Prefer commands that work in the given shell (cmd or PowerShell).",
        Platform::Macos => "macOS. Use BSD variants of core utilities.",
        Platform::Linux => "Linux. Use GNU core utilities.",
    };

    let chain_rule = if wants_multiple {
        "The task has several steps. Chain ALL of them into one line using && (or ; where a step may fail)."
    } else {
        "Prefer a single command. Use pipes only when needed."
    };

    let learning_rule = if learning_mode {
        format!(
            "\nAfter the command, output a line containing only {marker} followed by JSON:\n{{\"summary\": \"what it does\", \"breakdown\": [{{\"part\": \"-x\", \"meaning\": \"...\"}}], \"tips\": [\"...\"]}}",
            marker = parser::LEARNING_MARKER
        )
    } else {
        String::new()
    };

    format!(
        r#"You translate requests into shell commands.

SYSTEM: {platform_hint}
ARCH: {arch}
SHELL: {shell}

STRICT RULES:
1. Output ONLY the command on the first line. No prose, no questions.
2. {chain_rule}
3. Use {{name}} for values the user must fill in, e.g. git commit -m {{message}}.
4. Keep the command under {max_len} characters.
5. Never suggest destructive system-wide operations.{learning_rule}

TASK: {input}"#,
        platform_hint = platform_hint,
        arch = os.arch,
        shell = os.shell,
        chain_rule = chain_rule,
        max_len = parser::MAX_COMMAND_LEN,
        learning_rule = learning_rule,
        input = input
    )
}
