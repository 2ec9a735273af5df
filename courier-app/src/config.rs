//! `courier` configuration: a TOML file plus environment overrides.

use courier_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogBackend {
    #[default]
    Demo,
    Gmail,
}

impl CatalogBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            CatalogBackend::Demo => "demo",
            CatalogBackend::Gmail => "gmail",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "demo" => Some(CatalogBackend::Demo),
            "gmail" => Some(CatalogBackend::Gmail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub backend: CatalogBackend,
    #[serde(default)]
    pub gmail_access_token: Option<String>,
    #[serde(default)]
    pub gmail_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// SQLite database for suspended workflows. Unset keeps sessions in memory.
    #[serde(default)]
    pub db_path: Option<String>,
}

impl SessionsConfig {
    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        self.db_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(expand_home)
    }
}

impl CourierConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    /// Loads the file at `path`, or the default location. A missing default
    /// file falls back to built-in defaults; a missing explicit file is an
    /// error.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    config_path = %path.display(),
                    "config file not found; using defaults (run `courier init` to create one)"
                );
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Applies `COURIER_CATALOG`, `GMAIL_ACCESS_TOKEN` and `COURIER_SESSION_DB`.
    /// Blank values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("COURIER_CATALOG") {
            if !v.trim().is_empty() {
                match CatalogBackend::parse(&v) {
                    Some(backend) => self.catalog.backend = backend,
                    None => tracing::warn!(value = %v, "ignoring unknown COURIER_CATALOG"),
                }
            }
        }
        if let Some(v) = lookup("GMAIL_ACCESS_TOKEN") {
            if !v.trim().is_empty() {
                self.catalog.gmail_access_token = Some(v);
            }
        }
        if let Some(v) = lookup("COURIER_SESSION_DB") {
            if !v.trim().is_empty() {
                self.sessions.db_path = Some(v);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.catalog.backend == CatalogBackend::Gmail
            && self
                .catalog
                .gmail_access_token
                .as_deref()
                .is_none_or(|t| t.trim().is_empty())
        {
            return Err(anyhow::anyhow!(
                "catalog.gmail_access_token (or GMAIL_ACCESS_TOKEN) is required for the gmail catalog"
            ));
        }
        if let Some(url) = self.catalog.gmail_base_url.as_deref() {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(anyhow::anyhow!(
                    "catalog.gmail_base_url must be an http(s) URL"
                ));
            }
        }
        self.engine.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }
}

pub fn courier_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".courier")
}

pub fn default_config_path() -> PathBuf {
    courier_home().join("config.toml")
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(rest)
        }
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_is_a_valid_demo_config() {
        let cfg = CourierConfig::from_toml("").expect("parse");
        assert_eq!(cfg.catalog.backend, CatalogBackend::Demo);
        assert!(cfg.sessions.resolved_db_path().is_none());
        assert_eq!(cfg.engine, EngineConfig::default());
        cfg.validate().expect("valid");
    }

    #[test]
    fn bundled_template_parses_and_validates() {
        let cfg = CourierConfig::from_toml(include_str!("../../config-templates/config.toml"))
            .expect("parse template");
        assert_eq!(cfg.catalog.backend, CatalogBackend::Demo);
        assert_eq!(cfg.engine, EngineConfig::default());
        cfg.validate().expect("valid");
    }

    #[test]
    fn env_overrides_select_gmail_and_session_db() {
        let mut cfg = CourierConfig::default();
        cfg.apply_overrides(env(&[
            ("COURIER_CATALOG", "Gmail"),
            ("GMAIL_ACCESS_TOKEN", "ya29.token"),
            ("COURIER_SESSION_DB", "/tmp/courier.db"),
        ]));
        assert_eq!(cfg.catalog.backend, CatalogBackend::Gmail);
        assert_eq!(cfg.catalog.gmail_access_token.as_deref(), Some("ya29.token"));
        assert_eq!(
            cfg.sessions.resolved_db_path(),
            Some(PathBuf::from("/tmp/courier.db"))
        );
        cfg.validate().expect("valid");
    }

    #[test]
    fn blank_and_unknown_overrides_are_ignored() {
        let mut cfg = CourierConfig::default();
        cfg.apply_overrides(env(&[
            ("COURIER_CATALOG", "outlook"),
            ("GMAIL_ACCESS_TOKEN", "   "),
        ]));
        assert_eq!(cfg.catalog.backend, CatalogBackend::Demo);
        assert!(cfg.catalog.gmail_access_token.is_none());
    }

    #[test]
    fn gmail_without_token_is_rejected() {
        let cfg = CourierConfig::from_toml("[catalog]\nbackend = \"gmail\"\n").expect("parse");
        let err = cfg.validate().expect_err("token required");
        assert!(err.to_string().contains("gmail_access_token"));
    }

    #[test]
    fn engine_section_is_validated() {
        let cfg = CourierConfig::from_toml(
            "[engine.routing]\nhigh_threshold = 0.3\nlow_threshold = 0.5\n",
        )
        .expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = CourierConfig::load(Some(dir.path().join("nope.toml")))
            .await
            .expect_err("missing");
        assert!(err.to_string().contains("read config"));
    }

    #[tokio::test]
    async fn loads_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine.safety]\nconfirmation_above = 25\n").expect("write");
        let (cfg, loaded_from) = CourierConfig::load_with_path(Some(path.clone()))
            .await
            .expect("load");
        assert_eq!(loaded_from, path);
        assert_eq!(cfg.engine.safety.confirmation_above, 25);
    }
}
