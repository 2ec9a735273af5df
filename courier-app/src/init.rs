//! `courier init`: writes the config template without touching an existing file.

use anyhow::Result;
use std::path::{Path, PathBuf};

const CONFIG_TEMPLATE: &str = include_str!("../../config-templates/config.toml");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Created(PathBuf),
    Kept(PathBuf),
}

impl InitOutcome {
    pub fn path(&self) -> &Path {
        match self {
            InitOutcome::Created(p) | InitOutcome::Kept(p) => p,
        }
    }
}

pub async fn initialize(path: Option<PathBuf>) -> Result<InitOutcome> {
    let target = path.unwrap_or_else(crate::config::default_config_path);
    initialize_at(&target).await
}

pub async fn initialize_at(target: &Path) -> Result<InitOutcome> {
    match tokio::fs::metadata(target).await {
        Ok(_) => Ok(InitOutcome::Kept(target.to_path_buf())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| anyhow::anyhow!("create config dir {}: {e}", parent.display()))?;
            }
            tokio::fs::write(target, CONFIG_TEMPLATE)
                .await
                .map_err(|e| anyhow::anyhow!("write config template {}: {e}", target.display()))?;
            tracing::info!(config_path = %target.display(), "config template written");
            Ok(InitOutcome::Created(target.to_path_buf()))
        }
        Err(err) => Err(anyhow::anyhow!(
            "inspect config path {}: {err}",
            target.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_template_and_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join(".courier").join("config.toml");

        let outcome = initialize_at(&target).await.expect("init");
        assert_eq!(outcome, InitOutcome::Created(target.clone()));
        let written = std::fs::read_to_string(&target).expect("read back");
        assert_eq!(written, CONFIG_TEMPLATE);
    }

    #[tokio::test]
    async fn never_overwrites_an_existing_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("config.toml");
        std::fs::write(&target, "[catalog]\nbackend = \"gmail\"\n").expect("seed");

        let outcome = initialize_at(&target).await.expect("init");
        assert_eq!(outcome, InitOutcome::Kept(target.clone()));
        let kept = std::fs::read_to_string(&target).expect("read back");
        assert!(kept.contains("gmail"));
    }
}
