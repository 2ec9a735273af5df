//! Startup wiring: catalog backend, session store and engine from config.

use crate::config::{CatalogBackend, CourierConfig};
use anyhow::Result;
use courier_catalog::{GmailCatalog, MailboxCatalog, OperationCatalog, RateLimiter};
use courier_engine::{Engine, InMemorySessionStore, SessionStore, SqliteSessionStore};
use std::sync::Arc;

pub fn build_catalog(cfg: &CourierConfig) -> Result<Arc<dyn OperationCatalog>> {
    match cfg.catalog.backend {
        CatalogBackend::Demo => {
            tracing::info!(catalog = "demo", "using in-memory demo mailbox");
            Ok(Arc::new(MailboxCatalog::demo()))
        }
        CatalogBackend::Gmail => {
            let token = cfg.catalog.gmail_access_token.as_deref().unwrap_or_default();
            let calls = &cfg.engine.catalog;
            let mut gmail = GmailCatalog::new(token, calls.request_timeout())
                .map_err(|e| anyhow::anyhow!("gmail catalog: {e}"))?
                .with_rate_limit(Arc::new(RateLimiter::new(
                    calls.rate_limit_per_second,
                    calls.rate_limit_burst,
                )));
            if let Some(base_url) = cfg.catalog.gmail_base_url.as_deref() {
                gmail = gmail.with_base_url(base_url);
            }
            tracing::info!(catalog = "gmail", "using gmail catalog");
            Ok(Arc::new(gmail))
        }
    }
}

pub async fn build_store(cfg: &CourierConfig) -> Result<Arc<dyn SessionStore>> {
    let Some(path) = cfg.sessions.resolved_db_path() else {
        tracing::info!("session store: in-memory");
        return Ok(Arc::new(InMemorySessionStore::new()));
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow::anyhow!("create session db dir {}: {e}", parent.display()))?;
    }
    let store = SqliteSessionStore::open(&path)
        .map_err(|e| anyhow::anyhow!("open session db {}: {e}", path.display()))?;
    tracing::info!(db_path = %path.display(), "session store: sqlite");
    Ok(Arc::new(store))
}

pub async fn build_engine(cfg: &CourierConfig) -> Result<Engine> {
    let catalog = build_catalog(cfg)?;
    let store = build_store(cfg).await?;
    let engine = Engine::new(catalog, store, cfg.engine.clone())
        .await
        .map_err(|e| anyhow::anyhow!("start engine: {e}"))?;
    Ok(engine)
}
