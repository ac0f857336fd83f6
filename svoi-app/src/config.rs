//! svoibot configuration loader.
//!
//! TOML file, then environment overrides, then validation.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SvoiConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub sticker_sets: Vec<StickerSetConfig>,
    #[serde(default)]
    pub ai: Option<AiConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Chat ids allowed to run admin commands.
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    /// Drop updates that queued up while the bot was offline.
    #[serde(default = "default_skip_pending_updates")]
    pub skip_pending_updates: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            admin_ids: Vec::new(),
            skip_pending_updates: default_skip_pending_updates(),
        }
    }
}

fn default_workers() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_skip_pending_updates() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// `~/.svoibot/stats.db`; `":memory:"` must be asked for explicitly.
fn default_sqlite_path() -> String {
    svoibot_home().join("stats.db").display().to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// How often the user/chat totals are re-read from storage.
    #[serde(default = "default_metrics_update_period_secs")]
    pub update_period_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            update_period_secs: default_metrics_update_period_secs(),
        }
    }
}

fn default_metrics_update_period_secs() -> u64 {
    60
}

impl MetricsConfig {
    pub fn update_period(&self) -> Duration {
        Duration::from_secs(self.update_period_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StickerSetConfig {
    pub name: String,
    #[serde(default)]
    pub exclude_sticker_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    /// Full chat-completions URL.
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    /// Minimum time between two AI replies to the same sender.
    #[serde(default = "default_reset_period_secs")]
    pub reset_period_secs: u64,
    /// Sender placeholders: `{username}`, `{first_name}`, `{last_name}`, or
    /// the Go template forms `{{.Username}}`, `{{.FirstName}}`, `{{.LastName}}`.
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ai_base_url() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_reset_period_secs() -> u64 {
    3600
}

fn default_ai_timeout_secs() -> u64 {
    60
}

impl AiConfig {
    pub fn reset_period(&self) -> Duration {
        Duration::from_secs(self.reset_period_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}

impl SvoiConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("BOT_TOKEN") {
            self.bot.token = v;
        }
        if let Some(v) = var("SQLITE_PATH") {
            self.storage.sqlite_path = v;
        }
        if let Some(v) = var("AI_API_KEY") {
            self.ai.get_or_insert_with(default_ai_config).api_key = Some(v);
        }
        if let Some(v) = var("SVOIBOT_WORKERS") {
            match v.trim().parse::<usize>() {
                Ok(workers) => self.bot.workers = workers,
                Err(e) => tracing::warn!(value = %v, error = %e, "ignoring invalid SVOIBOT_WORKERS"),
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.bot.token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "bot.token is required (or set BOT_TOKEN)"
            ));
        }
        if self.bot.workers == 0 {
            return Err(anyhow::anyhow!("bot.workers must be > 0"));
        }
        if self.bot.queue_capacity == 0 {
            return Err(anyhow::anyhow!("bot.queue_capacity must be > 0"));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("cache.sweep_interval_secs must be > 0"));
        }
        if self.metrics.update_period_secs == 0 {
            return Err(anyhow::anyhow!("metrics.update_period_secs must be > 0"));
        }
        if let Some(set) = self
            .sticker_sets
            .iter()
            .find(|set| set.name.trim().is_empty())
        {
            return Err(anyhow::anyhow!(
                "sticker_sets entries need a name (excludes: {:?})",
                set.exclude_sticker_ids
            ));
        }
        if let Some(ai) = self.enabled_ai() {
            if ai.model.trim().is_empty() {
                return Err(anyhow::anyhow!("ai.model is required when an AI key is set"));
            }
            if ai.base_url.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "ai.base_url is required when an AI key is set"
                ));
            }
            if ai.reset_period_secs == 0 {
                return Err(anyhow::anyhow!("ai.reset_period_secs must be > 0"));
            }
        }
        Ok(())
    }

    /// The `[ai]` section, when it carries an API key.
    pub fn enabled_ai(&self) -> Option<&AiConfig> {
        self.ai.as_ref().filter(|ai| ai.api_key().is_some())
    }
}

fn default_ai_config() -> AiConfig {
    AiConfig {
        base_url: default_ai_base_url(),
        api_key: None,
        model: String::new(),
        fallback_models: Vec::new(),
        reset_period_secs: default_reset_period_secs(),
        system_prompt: String::new(),
        timeout_secs: default_ai_timeout_secs(),
    }
}

fn svoibot_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".svoibot")
}

pub fn default_config_path() -> PathBuf {
    svoibot_home().join("config.toml")
}
