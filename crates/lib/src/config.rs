//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.ponte/config.json`) and
//! environment. Secrets (API keys, tokens) prefer their environment variable
//! over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel settings (e.g. Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Provider settings (chat, vision, embeddings, transcription).
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// FAQ store and matching settings.
    #[serde(default)]
    pub faq: FaqConfig,

    /// Media persistence settings.
    #[serde(default)]
    pub media: MediaConfig,

    /// Unread sweep settings.
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Shared secret required on dashboard connections when the bind is not
    /// loopback. Overridden by PONTE_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            token: None,
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Optional secret for webhook verification
    /// (X-Telegram-Bot-Api-Secret-Token). When set, updates arrive via
    /// POST /webhook/telegram and the long-poll loop is not started.
    pub webhook_secret: Option<String>,
}

/// Provider settings shared by all outbound AI calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: OpenAiConfig,
}

/// OpenAI-compatible provider config (models, endpoint, call policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiConfig {
    /// API key. Overridden by OPENAI_API_KEY env when set.
    pub api_key: Option<String>,
    /// Endpoint base; omit for api.openai.com.
    pub base_url: Option<String>,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    /// Timeout for text calls (chat, detection, translation).
    #[serde(default = "default_text_timeout_secs")]
    pub text_timeout_secs: u64,
    /// Timeout for media calls (vision, embeddings, transcription).
    #[serde(default = "default_media_timeout_secs")]
    pub media_timeout_secs: u64,
    /// Retries after the first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_chat_model() -> String {
    "gpt-4o-2024-08-06".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_text_timeout_secs() -> u64 {
    30
}

fn default_media_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    2
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            chat_model: default_chat_model(),
            vision_model: default_vision_model(),
            embedding_model: default_embedding_model(),
            transcription_model: default_transcription_model(),
            text_timeout_secs: default_text_timeout_secs(),
            media_timeout_secs: default_media_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// FAQ store and matching config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaqConfig {
    /// Remote JSON resource of question→answer pairs. FAQ matching is off
    /// when unset.
    pub url: Option<String>,
    /// Local cache path (default `<config dir>/faq.json`).
    pub cache_path: Option<PathBuf>,
    /// Language the FAQ store is written in (ISO 639-1).
    #[serde(default = "default_pivot_language")]
    pub pivot_language: String,
    /// Fallback language when detection fails.
    #[serde(default = "default_pivot_language")]
    pub default_language: String,
    /// Cosine similarity threshold for a hit.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Persona for the generative fallback; a built-in sales-assistant
    /// prompt is used when unset.
    pub assistant_prompt: Option<String>,
}

fn default_pivot_language() -> String {
    "tr".to_string()
}

fn default_similarity_threshold() -> f32 {
    crate::faq::DEFAULT_SIMILARITY_THRESHOLD
}

impl Default for FaqConfig {
    fn default() -> Self {
        Self {
            url: None,
            cache_path: None,
            pivot_language: default_pivot_language(),
            default_language: default_pivot_language(),
            similarity_threshold: default_similarity_threshold(),
            assistant_prompt: None,
        }
    }
}

/// Media persistence config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConfig {
    /// Directory images are written to (default `<config dir>/media`).
    pub dir: Option<PathBuf>,
    /// Public URL the media directory is served under. Vision calls need
    /// this; without it images are not persisted.
    pub public_base_url: Option<String>,
}

/// Unread sweep config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PONTE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".ponte").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

fn env_or_config(var: &str, from_config: Option<&String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            from_config
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the provider API key: env OPENAI_API_KEY overrides config.
pub fn resolve_openai_key(config: &Config) -> Option<String> {
    env_or_config("OPENAI_API_KEY", config.providers.openai.api_key.as_ref())
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_or_config(
        "TELEGRAM_BOT_TOKEN",
        config.channels.telegram.bot_token.as_ref(),
    )
}

/// Resolve the gateway token: env PONTE_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_or_config("PONTE_GATEWAY_TOKEN", config.gateway.token.as_ref())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve the FAQ cache path: config override, else next to the config file.
pub fn resolve_faq_cache_path(config: &Config, config_path: &std::path::Path) -> PathBuf {
    config.faq.cache_path.clone().unwrap_or_else(|| {
        config_path
            .parent()
            .map(|p| p.join("faq.json"))
            .unwrap_or_else(|| PathBuf::from("faq.json"))
    })
}

/// Resolve the media directory: config override, else next to the config file.
pub fn resolve_media_dir(config: &Config, config_path: &std::path::Path) -> PathBuf {
    config.media.dir.clone().unwrap_or_else(|| {
        config_path
            .parent()
            .map(|p| p.join("media"))
            .unwrap_or_else(|| PathBuf::from("media"))
    })
}

/// Create the config directory, media subdirectory, and a default config
/// file. Returns true when a new file was written.
pub fn init_config(path: &std::path::Path) -> Result<bool> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config dir {}", dir.display()))?;
        std::fs::create_dir_all(dir.join("media"))
            .with_context(|| format!("creating media dir under {}", dir.display()))?;
    }
    if path.exists() {
        return Ok(false);
    }
    let config = Config::default();
    std::fs::write(path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    Ok(true)
}

/// Load config from the default path (or PONTE_CONFIG_PATH). Missing file =>
/// default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 15151);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn provider_defaults() {
        let p = OpenAiConfig::default();
        assert_eq!(p.chat_model, "gpt-4o-2024-08-06");
        assert_eq!(p.vision_model, "gpt-4o-mini");
        assert_eq!(p.embedding_model, "text-embedding-ada-002");
        assert_eq!(p.transcription_model, "whisper-1");
        assert_eq!(p.text_timeout_secs, 30);
        assert_eq!(p.media_timeout_secs, 120);
        assert_eq!(p.max_retries, 2);
    }

    #[test]
    fn config_keys_are_camel_case() {
        let config: Config = serde_json::from_str(
            r#"{
                "gateway": { "port": 9000 },
                "faq": { "pivotLanguage": "en", "similarityThreshold": 0.9 },
                "providers": { "openai": { "chatModel": "gpt-4o" } },
                "sweep": { "intervalSecs": 10 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.faq.pivot_language, "en");
        assert_eq!(config.faq.similarity_threshold, 0.9);
        assert_eq!(config.providers.openai.chat_model, "gpt-4o");
        assert_eq!(config.sweep.interval_secs, 10);
    }

    #[test]
    fn loopback_binds() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind("localhost"));
        assert!(!is_loopback_bind("0.0.0.0"));
    }

    #[test]
    fn init_config_writes_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ponte").join("config.json");
        assert!(init_config(&path).unwrap());
        assert!(!init_config(&path).unwrap());
        assert!(dir.path().join("ponte").join("media").is_dir());
        let (config, _) = load_config(Some(path)).unwrap();
        assert_eq!(config.gateway.port, 15151);
    }

    #[test]
    fn faq_cache_path_defaults_next_to_config() {
        let config = Config::default();
        let path = Path::new("/home/user/.ponte/config.json");
        assert_eq!(
            resolve_faq_cache_path(&config, path),
            PathBuf::from("/home/user/.ponte/faq.json")
        );
        assert_eq!(
            resolve_media_dir(&config, path),
            PathBuf::from("/home/user/.ponte/media")
        );
    }
}
