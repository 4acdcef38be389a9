//! Daemon configuration: provider credentials, model registry, auth.
//!
//! The config file (`aihive.json`) is versioned. A migration chain runs on
//! every load and persists the file when anything changed, so loading the
//! same file twice is a fixed point.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Current on-disk schema version. See [`Config::migrate`].
pub const CONFIG_VERSION: u32 = 3;

/// A provider credential entry. Models reference providers by id so one key
/// can serve several model entries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderEntry {
    #[serde(default)]
    pub id: String,
    /// Provider tag: "anthropic" | "openai" | "deepseek" | "moonshot" |
    /// "zhipu" | "minimax" | "qwen" | "openrouter" | "custom"
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub provider: String,
    /// Provider-specific model code, e.g. "deepseek-chat".
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub supports_tools: bool,
    /// Reference into [`Config::providers`]. Empty only on pre-v3 files.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
    /// Legacy per-model key, drained into a ProviderEntry by the v2→3
    /// migration. Kept as a field so old files deserialize.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
}

impl ModelEntry {
    /// Full model tag in `provider/code` form, the shape the LLM layer takes.
    pub fn provider_model(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub config_version: u32,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub data_dir: String,
    #[serde(default)]
    pub workspace_root: String,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,

    #[serde(skip)]
    path: PathBuf,
}

impl Config {
    /// Load the config file, run migrations, and persist if anything changed.
    /// A missing file yields a default config at the current version.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut cfg = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str::<Config>(&data)
                .with_context(|| format!("parse config {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config {
                config_version: CONFIG_VERSION,
                ..Default::default()
            },
            Err(e) => return Err(e).context("read config"),
        };
        cfg.path = path.to_path_buf();

        if cfg.migrate() {
            cfg.save()?;
        }
        Ok(cfg)
    }

    /// Atomic save: write to a temp file next to the target, then rename.
    pub fn save(&self) -> anyhow::Result<()> {
        if self.path.as_os_str().is_empty() {
            anyhow::bail!("config has no backing path");
        }
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data.as_bytes())?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    /// Run the migration chain. Returns true when the config was modified
    /// and should be persisted.
    fn migrate(&mut self) -> bool {
        let started_at = self.config_version;

        if self.config_version < 1 {
            self.migrate_assign_ids();
            self.config_version = 1;
        }
        if self.config_version < 2 {
            self.migrate_tool_flags_and_default();
            self.config_version = 2;
        }
        if self.config_version < 3 {
            self.migrate_extract_providers();
            self.config_version = 3;
        }

        if started_at != self.config_version {
            info!(
                from = started_at,
                to = self.config_version,
                "migrated config schema"
            );
            true
        } else {
            false
        }
    }

    /// v0→1: every model entry gets a stable id.
    fn migrate_assign_ids(&mut self) {
        for m in &mut self.models {
            if m.id.is_empty() {
                m.id = format!("model-{}", &uuid::Uuid::new_v4().to_string()[..8]);
            }
        }
    }

    /// v1→2: flag known tool-capable models and ensure exactly one default.
    fn migrate_tool_flags_and_default(&mut self) {
        for m in &mut self.models {
            if !m.supports_tools && model_code_supports_tools(&m.provider, &m.model) {
                m.supports_tools = true;
            }
        }
        if !self.models.is_empty() && !self.models.iter().any(|m| m.default) {
            self.models[0].default = true;
        }
    }

    /// v2→3: move per-model api keys into shared provider entries. Models
    /// with the same (provider, key) pair share one entry.
    fn migrate_extract_providers(&mut self) {
        for i in 0..self.models.len() {
            if self.models[i].api_key.is_empty() {
                continue;
            }
            let (provider, key) = (
                self.models[i].provider.clone(),
                self.models[i].api_key.clone(),
            );
            let existing = self
                .providers
                .iter()
                .find(|p| p.provider == provider && p.api_key == key)
                .map(|p| p.id.clone());
            let provider_id = match existing {
                Some(id) => id,
                None => {
                    let id = format!("prov-{}", &uuid::Uuid::new_v4().to_string()[..8]);
                    self.providers.push(ProviderEntry {
                        id: id.clone(),
                        provider,
                        api_key: key,
                        base_url: String::new(),
                        status: String::new(),
                    });
                    id
                }
            };
            self.models[i].provider_id = provider_id;
            self.models[i].api_key.clear();
        }
    }

    pub fn default_model(&self) -> Option<&ModelEntry> {
        self.models
            .iter()
            .find(|m| m.default)
            .or_else(|| self.models.first())
    }

    pub fn find_model(&self, id: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn find_provider(&self, id: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Resolve effective credentials for a model: (api_key, base_url).
    /// The model's own base_url wins over the provider's.
    pub fn resolve_credentials(&self, model: &ModelEntry) -> anyhow::Result<(String, String)> {
        let provider = self.find_provider(&model.provider_id).ok_or_else(|| {
            anyhow::anyhow!(
                "model {:?} references unknown provider {:?}",
                model.id,
                model.provider_id
            )
        })?;
        if provider.api_key.is_empty() {
            warn!(model = %model.id, "provider entry has no api key");
        }
        let base_url = if !model.base_url.is_empty() {
            model.base_url.clone()
        } else {
            provider.base_url.clone()
        };
        Ok((provider.api_key.clone(), base_url))
    }

    /// Masked view for the HTTP config surface. Provider keys show
    /// `first4***last4`; the auth token is fully masked.
    pub fn masked(&self) -> serde_json::Value {
        let mut v = serde_json::to_value(self).unwrap_or_default();
        if let Some(token) = v.get_mut("auth_token") {
            if !token.as_str().unwrap_or("").is_empty() {
                *token = serde_json::Value::String("***".into());
            }
        }
        if let Some(providers) = v.get_mut("providers").and_then(|p| p.as_array_mut()) {
            for p in providers {
                if let Some(key) = p.get_mut("api_key") {
                    let masked = mask_secret(key.as_str().unwrap_or(""));
                    *key = serde_json::Value::String(masked);
                }
            }
        }
        v
    }
}

/// Mask a secret for display: long keys keep the first and last 4 chars.
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    if s.len() > 8 {
        format!("{}***{}", &s[..4], &s[s.len() - 4..])
    } else {
        "***".to_string()
    }
}

/// Conservative list of model code prefixes known to handle tool use.
fn model_code_supports_tools(provider: &str, code: &str) -> bool {
    match provider {
        "anthropic" => code.starts_with("claude"),
        "openai" => code.starts_with("gpt-4") || code.starts_with("gpt-5") || code.starts_with('o'),
        "deepseek" => code.starts_with("deepseek"),
        "moonshot" | "kimi" => code.starts_with("moonshot") || code.starts_with("kimi"),
        "zhipu" | "glm" => code.starts_with("glm"),
        "minimax" => code.starts_with("abab") || code.starts_with("MiniMax"),
        "qwen" | "dashscope" => code.starts_with("qwen"),
        _ => false,
    }
}
