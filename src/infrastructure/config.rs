use crate::application::access::AccessOptions;
use crate::application::align::AlignPolicy;
use crate::application::subscription::StreamingOptions;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderSettings,
    pub access: AccessOptions,
    pub cache: CacheSettings,
    pub alignment: AlignmentSettings,
    pub streaming: StreamingOptions,
    pub server: ServerSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ProviderSettings {
    pub host: String,
    pub token: String,
    /// Query text with `${source}`, `${variable}`, `${start}`, `${end}`,
    /// `${pulse}`, `${max_samples}`, `${decimation}` and `${time_format}`.
    pub query_template: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            host: "http://localhost:8086".to_string(),
            token: String::new(),
            query_template: "SELECT ${decimation}(value) AS value FROM \"${variable}\" \
                             WHERE source = '${source}' AND pulse = '${pulse}' \
                             AND time >= ${start} AND time <= ${end} \
                             LIMIT ${max_samples}"
                .to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Memory,
    Blob,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    pub kind: CacheKind,
    /// LRU entries kept by the memory cache.
    pub capacity: usize,
    /// Directory of the blob cache.
    pub dir: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            kind: CacheKind::Memory,
            capacity: 256,
            dir: PathBuf::from("cache"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AlignmentSettings {
    pub policy: AlignPolicy,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// The configuration rendered as TOML with secrets blanked.
    pub fn to_redacted_toml(&self) -> anyhow::Result<String> {
        let mut shown = self.clone();
        if !shown.provider.token.is_empty() {
            shown.provider.token = "***".to_string();
        }
        toml::to_string_pretty(&shown).context("Failed to render configuration")
    }
}

/// Load `config/signals.*` (optional) overlaid with `SIGNALS__*` variables.
pub fn load_config() -> anyhow::Result<AppConfig> {
    load_config_from("config/signals")
}

pub fn load_config_from(path: &str) -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix("SIGNALS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read configuration from {path}"))?;

    settings
        .try_deserialize()
        .context("Invalid signal pipeline configuration")
}

/// Replace template variables in a query string
pub fn prepare_query(query: &str, vars: &HashMap<String, String>) -> String {
    let mut result = query.to_string();
    for (key, value) in vars {
        let placeholder = format!("${{{}}}", key);
        result = result.replace(&placeholder, value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_prepare_query() {
        let mut vars = HashMap::new();
        vars.insert("source".to_string(), "tokamak".to_string());
        vars.insert("variable".to_string(), "ip".to_string());

        let query = "SELECT value FROM \"${variable}\" WHERE source = '${source}' AND ${variable} > 0";
        let result = prepare_query(query, &vars);

        assert_eq!(result, "SELECT value FROM \"ip\" WHERE source = 'tokamak' AND ip > 0");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_config_from("does/not/exist/signals").unwrap();
        assert_eq!(config.access.default_max_samples, 10_000);
        assert_eq!(config.access.fallback_max_samples, 2_000);
        assert_eq!(config.cache.kind, CacheKind::Memory);
        assert_eq!(config.streaming.heartbeat_token, "HEARTBEAT");
        assert_eq!(config.server.addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_file_overrides_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[access]\nhonor_sample_count = true\n\n[cache]\nkind = \"blob\"\ndir = \"/tmp/x\"\n\n[alignment]\npolicy = \"overlap\""
        )
        .unwrap();

        let config = load_config_from(path.to_str().unwrap()).unwrap();
        assert!(config.access.honor_sample_count);
        assert_eq!(config.access.default_max_samples, 10_000);
        assert_eq!(config.cache.kind, CacheKind::Blob);
        assert_eq!(config.alignment.policy, AlignPolicy::Overlap);
    }

    #[test]
    fn test_redacted_toml_hides_token() {
        let mut config = AppConfig::default();
        config.provider.token = "secret".to_string();
        let rendered = config.to_redacted_toml().unwrap();
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[access]"));
    }
}
