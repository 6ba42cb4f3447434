//! Named provider registry with a default selection

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use super::{GigaChatProvider, GroqProvider, OllamaProvider, Provider, ProviderKind};
use crate::config::ProvidersConfig;
use crate::{Error, Result};

/// Public description of one registered provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub models: Vec<String>,
    pub current_model: String,
    pub is_default: bool,
}

#[derive(Default)]
struct Inner {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    default: Option<String>,
}

/// Thread-safe map of provider name to implementation
///
/// Built once at startup and shared through the application state.
#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled backend and select the default
    ///
    /// A backend that fails to build is logged and skipped. The Ollama
    /// daemon is probed once so a missing daemon shows up at startup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no backend could be registered.
    pub async fn from_config(config: ProvidersConfig) -> Result<Self> {
        let registry = Self::new();

        if let Some(gigachat) = config.gigachat {
            match GigaChatProvider::new(gigachat) {
                Ok(p) => registry.register(ProviderKind::GigaChat.as_str(), Arc::new(p)),
                Err(e) => tracing::error!(provider = "gigachat", error = %e, "failed to build provider"),
            }
        }

        if let Some(groq) = config.groq {
            match GroqProvider::new(groq) {
                Ok(p) => registry.register(ProviderKind::Groq.as_str(), Arc::new(p)),
                Err(e) => tracing::error!(provider = "groq", error = %e, "failed to build provider"),
            }
        }

        if let Some(ollama) = config.ollama {
            match OllamaProvider::new(ollama) {
                Ok(p) => {
                    match p.installed_models().await {
                        Ok(models) => {
                            let current = p.model();
                            if !models.iter().any(|m| *m == current) {
                                tracing::warn!(
                                    model = %current,
                                    installed = models.len(),
                                    "ollama model not pulled"
                                );
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "ollama daemon unreachable"),
                    }
                    registry.register(ProviderKind::Ollama.as_str(), Arc::new(p));
                }
                Err(e) => tracing::error!(provider = "ollama", error = %e, "failed to build provider"),
            }
        }

        if registry.is_empty() {
            return Err(Error::Config(
                "no providers configured; set GIGACHAT_AUTH_KEY, GROQ_API_KEY or enable ollama"
                    .to_string(),
            ));
        }

        if registry.set_default(config.default.as_str()).is_err() {
            tracing::debug!(provider = %config.default, "configured default not registered");
        }
        let default = registry.ensure_default();
        tracing::info!(
            providers = ?registry.names(),
            default = default.as_deref().unwrap_or_default(),
            "provider registry ready"
        );

        Ok(registry)
    }

    /// Register (or replace) a provider under `name`
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let name = name.into();
        tracing::debug!(provider = %name, model = %provider.model(), "provider registered");
        self.write().providers.insert(name, provider);
    }

    /// Make `name` the provider used when a request names none
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] if `name` is not registered.
    pub fn set_default(&self, name: &str) -> Result<()> {
        let mut inner = self.write();
        if !inner.providers.contains_key(name) {
            return Err(Error::ProviderNotFound(name.to_string()));
        }
        inner.default = Some(name.to_string());
        Ok(())
    }

    /// Fall back to the first registered provider when no valid default
    /// is set. Returns the effective default name.
    pub fn ensure_default(&self) -> Option<String> {
        let mut inner = self.write();
        let valid = inner
            .default
            .as_ref()
            .is_some_and(|d| inner.providers.contains_key(d));
        if !valid {
            inner.default = inner.providers.keys().next().cloned();
            if let Some(name) = &inner.default {
                tracing::warn!(provider = %name, "default provider unavailable, falling back");
            }
        }
        inner.default.clone()
    }

    /// Look up a provider; `None` or an empty name means the default
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] for unknown names or when no
    /// default is set.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn Provider>> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => self
                .read()
                .providers
                .get(name)
                .cloned()
                .ok_or_else(|| Error::ProviderNotFound(name.to_string())),
            None => self.default_provider(),
        }
    }

    /// The default provider
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] when no default is set.
    pub fn default_provider(&self) -> Result<Arc<dyn Provider>> {
        let inner = self.read();
        inner
            .default
            .as_ref()
            .and_then(|d| inner.providers.get(d))
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound("no default provider".to_string()))
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.read().providers.keys().cloned().collect()
    }

    #[must_use]
    pub fn default_name(&self) -> Option<String> {
        self.read().default.clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().providers.is_empty()
    }

    /// Describe every provider, sorted by name
    #[must_use]
    pub fn list_info(&self) -> Vec<ProviderInfo> {
        let inner = self.read();
        inner
            .providers
            .iter()
            .map(|(name, provider)| ProviderInfo {
                name: name.clone(),
                models: provider.models(),
                current_model: provider.model(),
                is_default: inner.default.as_deref() == Some(name.as_str()),
            })
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatOptions, ChunkSink, ModelSlot};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Fixed {
        name: &'static str,
        model: ModelSlot,
    }

    impl Fixed {
        fn arc(name: &'static str) -> Arc<dyn Provider> {
            Arc::new(Self {
                name,
                model: ModelSlot::new(format!("{name}-model")),
            })
        }
    }

    #[async_trait]
    impl Provider for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn model(&self) -> String {
            self.model.get()
        }
        fn set_model(&self, model: &str) {
            self.model.set(model);
        }
        fn models(&self) -> Vec<String> {
            vec![self.model.get()]
        }
        fn max_tokens(&self) -> u32 {
            1024
        }
        fn calculate_cost(&self, _input: usize, _output: usize) -> f64 {
            0.0
        }
        async fn chat(
            &self,
            _message: &str,
            _options: &ChatOptions,
            _cancel: &CancellationToken,
            sink: &mut dyn ChunkSink,
        ) -> Result<()> {
            sink.on_chunk(self.name).await
        }
    }

    fn registry() -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        registry.register("ollama", Fixed::arc("ollama"));
        registry.register("groq", Fixed::arc("groq"));
        registry
    }

    #[test]
    fn empty_name_resolves_to_default() {
        let registry = registry();
        registry.set_default("ollama").unwrap();

        assert_eq!(registry.get(None).unwrap().name(), "ollama");
        assert_eq!(registry.get(Some("")).unwrap().name(), "ollama");
        assert_eq!(registry.get(Some("groq")).unwrap().name(), "groq");
    }

    #[test]
    fn unknown_names_are_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.get(Some("openai")),
            Err(Error::ProviderNotFound(_))
        ));
        assert!(registry.set_default("openai").is_err());
        assert!(registry.default_name().is_none());
        assert!(registry.get(None).is_err());
    }

    #[test]
    fn ensure_default_picks_first_sorted_name() {
        let registry = registry();
        assert_eq!(registry.ensure_default().as_deref(), Some("groq"));

        registry.set_default("ollama").unwrap();
        assert_eq!(registry.ensure_default().as_deref(), Some("ollama"));
    }

    #[tokio::test]
    async fn from_config_skips_unconfigured_backends() {
        let config = ProvidersConfig {
            default: ProviderKind::GigaChat,
            gigachat: None,
            groq: Some(crate::providers::GroqConfig {
                api_key: Some("gsk-test".to_string().into()),
                ..Default::default()
            }),
            ollama: None,
        };
        let registry = ProviderRegistry::from_config(config).await.unwrap();
        assert_eq!(registry.names(), ["groq"]);
        assert_eq!(registry.default_name().as_deref(), Some("groq"));
    }

    #[tokio::test]
    async fn from_config_requires_a_backend() {
        let config = ProvidersConfig {
            default: ProviderKind::Ollama,
            gigachat: None,
            groq: None,
            ollama: None,
        };
        assert!(matches!(
            ProviderRegistry::from_config(config).await,
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn listing_is_sorted_and_flags_default() {
        let registry = registry();
        registry.set_default("ollama").unwrap();

        assert_eq!(registry.names(), ["groq", "ollama"]);
        let infos = registry.list_info();
        assert_eq!(infos[0].name, "groq");
        assert!(!infos[0].is_default);
        assert_eq!(infos[1].current_model, "ollama-model");
        assert!(infos[1].is_default);
    }
}
