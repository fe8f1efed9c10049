use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.shellmux/config.toml`.
///
/// **Security**: This struct NEVER stores API keys or passwords. Secrets are
/// read from environment variables at runtime; config only carries the
/// variable *names*.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound on simultaneously live remote connections (and therefore
    /// on simultaneously Active sessions).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Seconds without input, output or keepalive before a session is closed.
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_timeout: default_session_timeout(),
            general: GeneralConfig::default(),
            server: ServerConfig::default(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            ai: AiConfig::default(),
            security: SecurityConfig::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.shellmux/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "max_sessions must be greater than zero".into(),
            ));
        }
        if self.session_timeout == 0 {
            return Err(ConfigError::Validation(
                "session_timeout must be greater than zero".into(),
            ));
        }
        self.pool.validate()?;
        self.cache.validate()?;
        self.ai.validate()?;
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout)
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shellmux")
            .join("config.toml")
    }
}

fn default_max_sessions() -> usize {
    50
}
fn default_session_timeout() -> u64 {
    1800
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds of client silence before the WebSocket is closed.
    #[serde(default = "default_ws_idle_timeout")]
    pub ws_idle_timeout: u64,
    /// Capacity of each client's outbound message queue.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_idle_timeout: default_ws_idle_timeout(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_ws_idle_timeout() -> u64 {
    300
}
fn default_outbound_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Seconds an idle handle may sit unused before the reaper closes it.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl: u64,
    /// Seconds `acquire` may wait for capacity before failing.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
    /// Seconds allowed for TCP connect + handshake + authentication.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds between reaper passes.
    #[serde(default = "default_reap_interval")]
    pub reap_interval: u64,
    /// Seconds after which a connection is retired even if healthy.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: default_idle_ttl(),
            acquire_timeout: default_acquire_timeout(),
            connect_timeout: default_connect_timeout(),
            reap_interval: default_reap_interval(),
            max_lifetime: default_max_lifetime(),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.acquire_timeout == 0 || self.connect_timeout == 0 {
            return Err(ConfigError::Validation(
                "pool.acquire_timeout and pool.connect_timeout must be greater than zero".into(),
            ));
        }
        if self.reap_interval == 0 {
            return Err(ConfigError::Validation(
                "pool.reap_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl)
    }
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval)
    }
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime)
    }
}

fn default_idle_ttl() -> u64 {
    300
}
fn default_acquire_timeout() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_reap_interval() -> u64 {
    30
}
fn default_max_lifetime() -> u64 {
    3600
}

/// Whether AI cache fingerprints are shared across principals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    #[default]
    Global,
    Principal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Entry lifetime in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
    #[serde(default)]
    pub scope: CacheScope,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl: default_cache_ttl(),
            scope: CacheScope::default(),
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Validation(
                "cache.capacity must be greater than zero".into(),
            ));
        }
        if self.ttl == 0 {
            return Err(ConfigError::Validation(
                "cache.ttl must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

fn default_cache_capacity() -> usize {
    10_000
}
fn default_cache_ttl() -> u64 {
    3600
}

/// AI provider settings. Keys are resolved from the named env vars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Per-attempt compute timeout in seconds.
    #[serde(default = "default_ai_timeout")]
    pub timeout: u64,
    /// Extra attempts after the first failure.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Base delay of the retry backoff, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_anthropic_env")]
    pub anthropic_key_env: String,
    #[serde(default = "default_openai_env")]
    pub openai_key_env: String,
    #[serde(default = "default_ai_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            timeout: default_ai_timeout(),
            retry_count: default_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            providers: default_providers(),
            default_provider: default_provider(),
            anthropic_key_env: default_anthropic_env(),
            openai_key_env: default_openai_env(),
            max_tokens: default_ai_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl AiConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout == 0 {
            return Err(ConfigError::Validation(
                "ai.timeout must be greater than zero".into(),
            ));
        }
        if !self.providers.iter().any(|p| p == &self.default_provider) {
            return Err(ConfigError::Validation(format!(
                "ai.default_provider `{}` is not listed in ai.providers",
                self.default_provider
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn is_enabled(&self, provider: &str) -> bool {
        self.providers.iter().any(|p| p == provider)
    }
}

fn default_ai_timeout() -> u64 {
    30
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_providers() -> Vec<String> {
    vec!["openai".into(), "anthropic".into()]
}
fn default_provider() -> String {
    "anthropic".into()
}
fn default_anthropic_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_openai_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_ai_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Env var holding the pre-shared API key. Auth is disabled when the
    /// variable is unset or empty.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            allowed_origins: Vec::new(),
        }
    }
}

impl SecurityConfig {
    /// Resolve the API key from the environment.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|s| !s.is_empty())
    }
}

fn default_api_key_env() -> String {
    "SHELLMUX_API_KEY".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// `connect` messages allowed per principal per minute.
    #[serde(default = "default_connect_per_minute")]
    pub connect_per_minute: u64,
    /// AI chat requests allowed per principal per minute.
    #[serde(default = "default_ai_per_minute")]
    pub ai_per_minute: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            connect_per_minute: default_connect_per_minute(),
            ai_per_minute: default_ai_per_minute(),
        }
    }
}

fn default_connect_per_minute() -> u64 {
    30
}
fn default_ai_per_minute() -> u64 {
    60
}
