//! AI assistant chat: provider selection, retries and response caching.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sm_core::config::{CacheScope, Config};
use sm_core::error::{ErrorCode, HasErrorCode};
use sm_core::types::SessionId;
use sm_harness::backoff::{Backoff, BackoffConfig};
use sm_telemetry::metrics::{global_metrics, AI_COMPUTE_SECONDS, AI_REQUESTS_TOTAL};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheSettings, CacheStats, LookupSource, ResponseCache};
use crate::fingerprint::FingerprintInput;
use crate::llm::{AnthropicProvider, LlmConfig, LlmError, LlmMessage, LlmProvider, OpenAiProvider};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful system administration assistant. Help the user run server commands safely.";

/// Admin tools that mark a bare one-line code fence as a command.
const COMMAND_PREFIXES: &[&str] = &["sudo", "apt", "yum", "docker", "systemctl"];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AiRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub ai_config: AiRequestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiRequestConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AiResponse {
    pub response: String,
    pub command: Option<String>,
    pub cached: bool,
    /// Model that produced the answer, as reported by the provider.
    pub model: String,
    /// Provider tokens spent on this request. `None` when no call was made.
    pub tokens_used: Option<u64>,
    pub latency_ms: u64,
}

/// What the cache stores per fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatAnswer {
    pub content: String,
    pub model: String,
    pub tokens_used: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("unsupported AI provider `{0}`")]
    UnsupportedProvider(String),

    #[error("no API key supplied for {0} and none configured")]
    MissingApiKey(&'static str),

    #[error("invalid AI request: {0}")]
    Invalid(String),

    #[error("AI provider failed: {0}")]
    Provider(#[from] LlmError),

    #[error("AI request timed out after {0:?}")]
    Timeout(Duration),
}

impl ChatError {
    fn is_retryable(&self) -> bool {
        match self {
            ChatError::Provider(e) => e.is_retryable(),
            ChatError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl HasErrorCode for ChatError {
    fn code(&self) -> ErrorCode {
        match self {
            ChatError::UnsupportedProvider(_) => ErrorCode::UnsupportedProvider,
            ChatError::MissingApiKey(_) => ErrorCode::Unauthorized,
            ChatError::Invalid(_) => ErrorCode::ProtocolError,
            ChatError::Provider(LlmError::RateLimited { .. }) => ErrorCode::RateLimited,
            ChatError::Provider(_) | ChatError::Timeout(_) => ErrorCode::CacheComputeError,
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    /// Accepts `claude` as an alias for `anthropic`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

/// Builds a provider for one request.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind, api_key: &str, endpoint: Option<&str>) -> Arc<dyn LlmProvider>;

    fn requires_api_key(&self) -> bool {
        true
    }
}

/// Real HTTP providers sharing one connection pool.
#[derive(Debug, Clone, Default)]
pub struct HttpProviderFactory {
    client: reqwest::Client,
}

impl HttpProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, kind: ProviderKind, api_key: &str, endpoint: Option<&str>) -> Arc<dyn LlmProvider> {
        match kind {
            ProviderKind::Anthropic => {
                let p = AnthropicProvider::with_client(self.client.clone(), api_key);
                Arc::new(match endpoint {
                    Some(url) => p.with_endpoint(url),
                    None => p,
                })
            }
            ProviderKind::OpenAi => {
                let p = OpenAiProvider::with_client(self.client.clone(), api_key);
                Arc::new(match endpoint {
                    Some(url) => p.with_endpoint(url),
                    None => p,
                })
            }
        }
    }
}

/// Always hands out the same provider and needs no key. Used by tests and
/// by the daemon's mock mode.
#[derive(Clone)]
pub struct FixedProviderFactory {
    provider: Arc<dyn LlmProvider>,
}

impl FixedProviderFactory {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

impl ProviderFactory for FixedProviderFactory {
    fn create(&self, _kind: ProviderKind, _api_key: &str, _endpoint: Option<&str>) -> Arc<dyn LlmProvider> {
        self.provider.clone()
    }

    fn requires_api_key(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub default_provider: String,
    pub enabled_providers: Vec<String>,
    pub anthropic_key_env: String,
    pub openai_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub scope: CacheScope,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        let ai = &config.ai;
        Self {
            timeout: ai.timeout(),
            retry_count: ai.retry_count,
            retry_backoff: Duration::from_millis(ai.retry_backoff_ms),
            default_provider: ai.default_provider.clone(),
            enabled_providers: ai.providers.clone(),
            anthropic_key_env: ai.anthropic_key_env.clone(),
            openai_key_env: ai.openai_key_env.clone(),
            max_tokens: ai.max_tokens,
            temperature: ai.temperature,
            scope: config.cache.scope,
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct AiChatService {
    settings: ChatSettings,
    factory: Arc<dyn ProviderFactory>,
    cache: ResponseCache<ChatAnswer, ChatError>,
}

impl AiChatService {
    pub fn new(
        settings: ChatSettings,
        cache: CacheSettings,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            settings,
            factory,
            cache: ResponseCache::new(cache),
        }
    }

    pub fn from_config(config: &Config, factory: Arc<dyn ProviderFactory>) -> Self {
        Self::new(
            ChatSettings::from_config(config),
            CacheSettings::from_config(&config.cache),
            factory,
        )
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    fn resolve_provider(&self, requested: Option<&str>) -> Result<ProviderKind, ChatError> {
        let name = requested
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.settings.default_provider);
        let kind = ProviderKind::parse(name)
            .ok_or_else(|| ChatError::UnsupportedProvider(name.to_string()))?;
        if !self.settings.enabled_providers.iter().any(|p| {
            ProviderKind::parse(p) == Some(kind)
        }) {
            return Err(ChatError::UnsupportedProvider(name.to_string()));
        }
        Ok(kind)
    }

    fn resolve_key(&self, kind: ProviderKind, supplied: Option<String>) -> Result<String, ChatError> {
        if let Some(key) = supplied.filter(|k| !k.trim().is_empty()) {
            return Ok(key);
        }
        if !self.factory.requires_api_key() {
            return Ok(String::new());
        }
        let env = match kind {
            ProviderKind::Anthropic => &self.settings.anthropic_key_env,
            ProviderKind::OpenAi => &self.settings.openai_key_env,
        };
        std::env::var(env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(ChatError::MissingApiKey(kind.as_str()))
    }

    /// Answer one chat request.
    ///
    /// `principal` scopes the cache entry when `cache.scope = "principal"`.
    /// `session_target` is the `user@host:port` of the request's session, when
    /// the caller found it live.
    pub async fn ask(
        &self,
        request: AiRequest,
        principal: &str,
        session_target: Option<&str>,
    ) -> Result<AiResponse, ChatError> {
        let started = std::time::Instant::now();
        if request.message.trim().is_empty() {
            return Err(ChatError::Invalid("message must not be empty".into()));
        }
        if request.ai_config.model.trim().is_empty() {
            return Err(ChatError::Invalid("ai_config.model must not be empty".into()));
        }

        let cfg = request.ai_config;
        let kind = self.resolve_provider(cfg.provider.as_deref())?;
        let api_key = self.resolve_key(kind, cfg.api_key)?;

        let llm_config = LlmConfig {
            model: cfg.model,
            max_tokens: cfg.max_tokens.unwrap_or(self.settings.max_tokens),
            temperature: cfg.temperature.unwrap_or(self.settings.temperature),
            system_prompt: Some(
                cfg.system_prompt
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            ),
        };
        let context = session_target.map(|t| format!("The user has an active SSH session to {t}."));

        let mut messages = Vec::with_capacity(2);
        if let Some(ctx) = &context {
            messages.push(LlmMessage::system(ctx.clone()));
        }
        messages.push(LlmMessage::user(request.message.clone()));

        let fingerprint = FingerprintInput {
            provider: kind.as_str(),
            model: &llm_config.model,
            prompt: &request.message,
            system_prompt: llm_config.system_prompt.as_deref(),
            context: context.as_deref(),
            temperature: llm_config.temperature,
            max_tokens: llm_config.max_tokens,
            scope: match self.settings.scope {
                CacheScope::Global => None,
                CacheScope::Principal => Some(principal),
            },
        }
        .fingerprint();

        let provider = self.factory.create(kind, &api_key, cfg.endpoint.as_deref());
        let mut backoff = Backoff::new(BackoffConfig::new(
            self.settings.retry_count,
            self.settings.retry_backoff,
        ));
        let mut last_error = ChatError::Timeout(self.settings.timeout);

        while let Some(delay) = backoff.next_delay() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let attempt = self
                .cache
                .get_or_compute(&fingerprint, || {
                    self.compute(provider.as_ref(), &messages, &llm_config)
                })
                .await;

            match attempt {
                Ok(lookup) => {
                    let outcome = match lookup.source {
                        LookupSource::Hit => "hit",
                        LookupSource::Coalesced => "coalesced",
                        LookupSource::Computed => "computed",
                    };
                    global_metrics().increment_counter(
                        AI_REQUESTS_TOTAL,
                        &[("provider", kind.as_str()), ("outcome", outcome)],
                    );
                    debug!(fingerprint = %fingerprint.short(), outcome, "ai request served");
                    let computed = lookup.source == LookupSource::Computed;
                    let answer = lookup.value;
                    return Ok(AiResponse {
                        command: extract_command(&answer.content),
                        response: answer.content,
                        cached: !computed,
                        model: answer.model,
                        tokens_used: computed.then_some(answer.tokens_used),
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt = backoff.attempts(), error = %e, "ai request failed, will retry");
                    last_error = e;
                }
                Err(e) => {
                    backoff.abort();
                    last_error = e;
                }
            }
        }

        global_metrics().increment_counter(
            AI_REQUESTS_TOTAL,
            &[("provider", kind.as_str()), ("outcome", "error")],
        );
        warn!(attempts = backoff.attempts(), error = %last_error, "ai request failed");
        Err(last_error)
    }

    async fn compute(
        &self,
        provider: &dyn LlmProvider,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChatAnswer, ChatError> {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(self.settings.timeout, provider.complete(messages, config))
            .await
            .map_err(|_| ChatError::Timeout(self.settings.timeout))?;
        global_metrics().record_histogram(AI_COMPUTE_SECONDS, started.elapsed().as_secs_f64());

        let response = result?;
        info!(
            provider = provider.name(),
            model = %response.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "ai completion"
        );
        Ok(ChatAnswer {
            tokens_used: response.input_tokens + response.output_tokens,
            content: response.content,
            model: response.model,
        })
    }
}

// ---------------------------------------------------------------------------
// Command extraction
// ---------------------------------------------------------------------------

/// Pull a runnable shell command out of an assistant reply.
///
/// The first ```bash / ```sh block wins. Failing that, the first bare ```
/// block qualifies when it is one line starting with a known admin tool.
pub fn extract_command(response: &str) -> Option<String> {
    let blocks = fenced_blocks(response);

    let shell = blocks
        .iter()
        .find(|(lang, body)| matches!(*lang, "bash" | "sh") && !body.trim().is_empty())
        .map(|(_, body)| body.trim().to_string());
    if shell.is_some() {
        return shell;
    }

    blocks
        .iter()
        .filter(|(lang, _)| lang.is_empty())
        .map(|(_, body)| body.trim())
        .find(|body| {
            !body.contains('\n') && COMMAND_PREFIXES.iter().any(|p| body.starts_with(p))
        })
        .map(str::to_string)
}

/// `(info string, body)` for each closed ``` fence, in order.
fn fenced_blocks(text: &str) -> Vec<(&str, &str)> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(close) = after.find("```") else {
            break;
        };
        let inner = &after[..close];
        let (lang, body) = match inner.find('\n') {
            Some(nl) if !inner[..nl].trim().contains(' ') => (inner[..nl].trim(), &inner[nl + 1..]),
            _ => ("", inner),
        };
        blocks.push((lang, body));
        rest = &after[close + 3..];
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bash_block() {
        let reply = "Restart it:\n```bash\nsudo systemctl restart nginx\n```\nDone.";
        assert_eq!(
            extract_command(reply).as_deref(),
            Some("sudo systemctl restart nginx")
        );
    }

    #[test]
    fn shell_block_beats_earlier_plain_block() {
        let reply = "```\ndocker ps\n```\nthen\n```sh\nls -la\n```";
        assert_eq!(extract_command(reply).as_deref(), Some("ls -la"));
    }

    #[test]
    fn plain_single_line_admin_command() {
        assert_eq!(
            extract_command("Try ```docker ps -a``` to list.").as_deref(),
            Some("docker ps -a")
        );
        assert_eq!(extract_command("```\napt update\n```").as_deref(), Some("apt update"));
    }

    #[test]
    fn plain_block_with_unknown_tool_or_many_lines_is_ignored() {
        assert_eq!(extract_command("```\nls -la\n```"), None);
        assert_eq!(extract_command("```\nsudo a\nsudo b\n```"), None);
        assert_eq!(extract_command("```python\nprint(1)\n```"), None);
        assert_eq!(extract_command("no code here"), None);
        assert_eq!(extract_command("```bash\nunterminated"), None);
    }

    #[test]
    fn provider_aliases() {
        assert_eq!(ProviderKind::parse("claude"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::parse("OpenAI"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::parse("gemini"), None);
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            ChatError::UnsupportedProvider("x".into()).code(),
            ErrorCode::UnsupportedProvider
        );
        assert_eq!(
            ChatError::Provider(LlmError::RateLimited { retry_after_secs: Some(3) }).code(),
            ErrorCode::RateLimited
        );
        assert_eq!(
            ChatError::Provider(LlmError::Timeout).code(),
            ErrorCode::CacheComputeError
        );
    }
}
