pub mod consolidate;
pub mod init;
pub mod memory;
pub mod pull;
pub mod run;
pub mod status;

use membase_config::AppConfig;
use membase_core::summarizer::Summarizer;
use membase_engine::{BackendSpec, LlmSummarizer, ManagerBuilder, ManagerOptions, MemoryManager};
use membase_hub::HttpHubClient;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Config file, then env, then the `--account` flag.
pub fn load_config(
    path: Option<&Path>,
    account: Option<String>,
) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => {
            let mut config =
                AppConfig::load_from(path).map_err(|e| format!("Failed to load config: {e}"))?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?,
    };
    if let Some(account) = account.filter(|a| !a.trim().is_empty()) {
        config.account = account;
    }
    Ok(config)
}

fn summarizer(
    config: &AppConfig,
) -> Result<Option<Arc<dyn Summarizer>>, Box<dyn std::error::Error>> {
    let Some(provider) = membase_providers::build_from_config(&config.summarizer)? else {
        return Ok(None);
    };
    let summarizer = LlmSummarizer::new(provider, config.summarizer.model.clone())
        .with_temperature(config.summarizer.temperature)
        .with_max_tokens(config.summarizer.max_tokens);
    Ok(Some(Arc::new(summarizer)))
}

/// How much of the runtime a command needs.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Storage only; writes are still mirrored when auto_upload is set
    Local,
    /// Storage plus a summarizer for a one-off cycle
    Summarize,
    /// Everything, including the periodic loop
    Background,
}

pub fn builder(
    config: &AppConfig,
    mode: Mode,
) -> Result<ManagerBuilder, Box<dyn std::error::Error>> {
    let backend = match config.storage.backend.as_str() {
        "in_memory" => BackendSpec::InMemory,
        _ => BackendSpec::Sqlite {
            root: config.storage.data_root(),
        },
    };

    let options = ManagerOptions {
        batch_size: config.consolidation.batch_size,
        tick_interval: Duration::from_secs(config.consolidation.tick_interval_secs),
        trigger: config.consolidation.trigger,
        consolidate: mode == Mode::Background && config.consolidation.enabled,
        auto_upload: config.hub.auto_upload,
        hub_id: config.hub.hub_id.clone(),
        preload: mode == Mode::Background && config.hub.preload,
        keyword_index: false,
    };
    let mut builder = ManagerBuilder::new(backend).options(options);

    if !config.hub.url.trim().is_empty() {
        let hub = HttpHubClient::new(
            config.hub.url.clone(),
            Duration::from_secs(config.hub.timeout_secs),
        )?;
        builder = builder.hub(Arc::new(hub));
    }

    if mode != Mode::Local {
        match summarizer(config) {
            Ok(Some(summarizer)) => builder = builder.summarizer(summarizer),
            Ok(None) => warn!("Summarizer provider is 'none'; consolidation is off"),
            Err(e) if mode == Mode::Summarize => return Err(e),
            Err(e) => warn!(error = %e, "No summarizer; consolidation is off"),
        }
    }

    Ok(builder)
}

pub async fn open(
    config: &AppConfig,
    mode: Mode,
) -> Result<MemoryManager, Box<dyn std::error::Error>> {
    let manager = builder(config, mode)?.open(&config.account).await?;
    Ok(manager)
}
