use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TEMPERATURE: f64 = 0.2;
pub const DEFAULT_TOP_P: f64 = 0.8;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 1000;
pub const DEFAULT_THINKING_BUDGET: u64 = 512;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a prompt optimization expert. Rewrite the \
user's short prompt into a clearer, more specific and more effective prompt. Principles: \
1. keep the original intent 2. add the details and description that are missing \
3. make the wording precise and logical 4. keep the output concise \
5. stay applicable to any domain or scenario. Output only the optimized prompt, with no extra explanation.";

const PLACEHOLDER_API_KEY: &str = "your_api_key_here";
const USER_PROMPT_PREFIX: &str = "Please optimize this prompt: ";

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("the text to optimize is empty")]
    EmptyInput,

    #[error("{0}")]
    NotAvailable(String),

    #[error("optimizer request failed: {0}")]
    Request(String),

    #[error("optimizer returned an unusable response: {0}")]
    Response(String),
}

/// Rewrites draft text through an external text-generation service.
///
/// Implementations block on network I/O; callers must keep them off any
/// thread that services user input.
pub trait TextOptimizer: Send + Sync {
    fn is_available(&self) -> bool;
    fn status_message(&self) -> String;
    fn optimize(&self, text: &str) -> Result<String, OptimizerError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u64,
    pub thinking_budget: u64,
    pub include_thoughts: bool,
    pub system_instruction: String,
    pub request_timeout: Duration,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            thinking_budget: DEFAULT_THINKING_BUDGET,
            include_thoughts: false,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizerStatus {
    Ready,
    MissingCredential,
    ClientInitFailed(String),
}

impl OptimizerStatus {
    pub fn message(&self) -> String {
        match self {
            Self::Ready => "Prompt optimization is ready".to_string(),
            Self::MissingCredential => {
                "Set GEMINI_API_KEY in the environment or a .env file to enable prompt optimization"
                    .to_string()
            }
            Self::ClientInitFailed(reason) => {
                format!("Prompt optimization client failed to initialize: {reason}")
            }
        }
    }
}

/// Gemini `generateContent` backed optimizer.
pub struct GeminiOptimizer {
    settings: OptimizerSettings,
    status: OptimizerStatus,
    http: Option<HttpClient>,
}

impl GeminiOptimizer {
    pub fn new(settings: OptimizerSettings) -> Self {
        let has_key = settings
            .api_key
            .as_deref()
            .map(str::trim)
            .map(|key| !key.is_empty() && key != PLACEHOLDER_API_KEY)
            .unwrap_or(false);
        if !has_key {
            return Self {
                settings,
                status: OptimizerStatus::MissingCredential,
                http: None,
            };
        }

        match HttpClient::builder()
            .timeout(settings.request_timeout)
            .build()
        {
            Ok(http) => Self {
                settings,
                status: OptimizerStatus::Ready,
                http: Some(http),
            },
            Err(err) => {
                tracing::warn!(error = %err, "optimizer HTTP client construction failed");
                Self {
                    settings,
                    status: OptimizerStatus::ClientInitFailed(err.to_string()),
                    http: None,
                }
            }
        }
    }

    pub fn status(&self) -> &OptimizerStatus {
        &self.status
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    fn endpoint(&self) -> String {
        let base = self.settings.api_base.trim().trim_end_matches('/');
        let model = self.settings.model.trim();
        let model_path = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        format!("{base}/{model_path}:generateContent")
    }
}

impl TextOptimizer for GeminiOptimizer {
    fn is_available(&self) -> bool {
        self.status == OptimizerStatus::Ready && self.http.is_some()
    }

    fn status_message(&self) -> String {
        self.status.message()
    }

    fn optimize(&self, text: &str) -> Result<String, OptimizerError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(OptimizerError::EmptyInput);
        }
        let (Some(http), Some(api_key)) = (self.http.as_ref(), self.settings.api_key.as_deref())
        else {
            return Err(OptimizerError::NotAvailable(self.status_message()));
        };

        let endpoint = self.endpoint();
        let payload = build_generate_payload(&self.settings, trimmed);
        tracing::debug!(model = %self.settings.model, chars = trimmed.chars().count(), "sending optimize request");
        let response = http
            .post(&endpoint)
            .query(&[("key", api_key.trim())])
            .json(&payload)
            .send()
            .map_err(|err| OptimizerError::Request(err.to_string()))?;
        let parsed = response_json_or_error(response)?;
        Ok(extract_response_text(&parsed))
    }
}

pub fn build_generate_payload(settings: &OptimizerSettings, text: &str) -> Value {
    json!({
        "systemInstruction": {
            "parts": [{ "text": settings.system_instruction }],
        },
        "contents": [{
            "role": "user",
            "parts": [{ "text": format!("{USER_PROMPT_PREFIX}{}", text.trim()) }],
        }],
        "generationConfig": {
            "temperature": settings.temperature,
            "topP": settings.top_p,
            "maxOutputTokens": settings.max_output_tokens,
            "thinkingConfig": {
                "thinkingBudget": settings.thinking_budget,
                "includeThoughts": settings.include_thoughts,
            },
        },
    })
}

/// Joined, trimmed text of the first candidate. Reasoning parts are skipped
/// and a reply without text yields an empty string.
pub fn extract_response_text(response: &Value) -> String {
    let parts = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = String::new();
    for part in parts {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
    out.trim().to_string()
}

fn response_json_or_error(response: HttpResponse) -> Result<Value, OptimizerError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| OptimizerError::Request(format!("response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(OptimizerError::Request(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_text(&body, 512)
        )));
    }
    serde_json::from_str(&body).map_err(|err| OptimizerError::Response(err.to_string()))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
