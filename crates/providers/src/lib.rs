//! LLM Provider implementations for Membase.
//!
//! All providers implement the `membase_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use membase_config::SummarizerConfig;
use membase_core::error::ProviderError;
use membase_core::provider::Provider;
use std::sync::Arc;

/// Build the summarizer's provider from configuration.
///
/// Returns `Ok(None)` when the provider is `"none"`.
pub fn build_from_config(
    config: &SummarizerConfig,
) -> Result<Option<Arc<dyn Provider>>, ProviderError> {
    let api_key = || {
        config.api_key.clone().ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "{} needs an API key (set MEMBASE_API_KEY or summarizer.api_key)",
                config.provider
            ))
        })
    };

    let provider = match (config.provider.as_str(), config.api_url.as_deref()) {
        ("none", _) => return Ok(None),
        ("ollama", url) => OpenAiCompatProvider::ollama(url)?,
        (name, Some(url)) => OpenAiCompatProvider::new(name, url, api_key()?)?,
        ("openrouter", None) => OpenAiCompatProvider::openrouter(api_key()?)?,
        ("openai", None) => OpenAiCompatProvider::openai(api_key()?)?,
        (other, None) => {
            return Err(ProviderError::NotConfigured(format!(
                "provider '{other}' needs summarizer.api_url"
            )));
        }
    };

    Ok(Some(Arc::new(provider)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_builds_nothing() {
        let config = SummarizerConfig {
            provider: "none".into(),
            ..Default::default()
        };
        assert!(build_from_config(&config).unwrap().is_none());
    }

    #[test]
    fn openai_requires_key() {
        let config = SummarizerConfig::default();
        assert!(matches!(
            build_from_config(&config),
            Err(ProviderError::NotConfigured(_))
        ));

        let config = SummarizerConfig {
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        let provider = build_from_config(&config).unwrap().unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = SummarizerConfig {
            provider: "ollama".into(),
            ..Default::default()
        };
        let provider = build_from_config(&config).unwrap().unwrap();
        assert_eq!(provider.name(), "ollama");
    }
}
