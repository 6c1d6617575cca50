//! Provider registry and selection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use pf_core::{Error, Result};

use crate::provider::TranscodingProvider;
use crate::types::{ProviderCapabilities, ProviderInfo, TranscodeRequest};

/// A provider together with the metadata captured when it was registered.
pub struct RegisteredProvider {
    pub info: ProviderInfo,
    pub capabilities: ProviderCapabilities,
    pub provider: Arc<dyn TranscodingProvider>,
}

/// Diagnostics view of a registered provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub info: ProviderInfo,
    pub capabilities: ProviderCapabilities,
}

/// Thread-safe map of providers keyed by ID.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<RegisteredProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a provider. Info and capabilities are read once
    /// here and never re-queried during selection.
    pub fn register(&self, provider: Arc<dyn TranscodingProvider>) -> Result<()> {
        let info = provider.info();
        if info.id.trim().is_empty() {
            return Err(Error::Validation("provider ID must not be empty".into()));
        }
        let capabilities = provider.capabilities();

        tracing::info!(
            provider = %info.id,
            priority = info.priority,
            formats = capabilities.formats.len(),
            "Registered transcoding provider"
        );

        let entry = Arc::new(RegisteredProvider {
            info: info.clone(),
            capabilities,
            provider,
        });
        self.providers.write().insert(info.id, entry);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.providers.write().remove(id).is_some();
        if removed {
            tracing::info!(provider = %id, "Unregistered transcoding provider");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Result<Arc<RegisteredProvider>> {
        self.providers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(id.to_string()))
    }

    /// Highest-priority provider supporting `request.container`. Equal
    /// priorities resolve to the lexicographically smallest ID.
    pub fn select_provider(&self, request: &TranscodeRequest) -> Result<Arc<RegisteredProvider>> {
        let providers = self.providers.read();
        let selected = providers
            .values()
            .filter(|p| p.capabilities.supports_container(&request.container))
            .max_by(|a, b| {
                a.info
                    .priority
                    .cmp(&b.info.priority)
                    .then_with(|| b.info.id.cmp(&a.info.id))
            })
            .cloned();

        match selected {
            Some(p) => {
                tracing::debug!(
                    provider = %p.info.id,
                    container = %request.container,
                    "Selected transcoding provider"
                );
                Ok(p)
            }
            None => Err(Error::NoProvidersAvailable(request.container.clone())),
        }
    }

    /// Snapshot of every registered provider, ordered by ID.
    pub fn providers(&self) -> Vec<ProviderSummary> {
        let mut list: Vec<ProviderSummary> = self
            .providers
            .read()
            .values()
            .map(|p| ProviderSummary {
                info: p.info.clone(),
                capabilities: p.capabilities.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        list
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContainerFormat, TranscodeHandle, TranscodingProgress};
    use async_trait::async_trait;
    use pf_core::SessionId;

    struct Stub {
        id: &'static str,
        priority: i32,
        formats: &'static [&'static str],
    }

    #[async_trait]
    impl TranscodingProvider for Stub {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: self.id.into(),
                name: self.id.into(),
                description: String::new(),
                version: "0.0.0".into(),
                author: String::new(),
                priority: self.priority,
            }
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                formats: self
                    .formats
                    .iter()
                    .map(|&f| ContainerFormat::new(f, "video/x-test", &[f], false))
                    .collect(),
                ..Default::default()
            }
        }

        async fn start_transcode(&self, _: &TranscodeRequest) -> Result<TranscodeHandle> {
            Err(Error::Unsupported("stub".into()))
        }

        async fn progress(&self, _: SessionId) -> Result<TranscodingProgress> {
            Err(Error::Unsupported("stub".into()))
        }

        async fn stop_transcode(&self, _: SessionId) -> Result<()> {
            Ok(())
        }
    }

    fn registry(stubs: Vec<Stub>) -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        for s in stubs {
            registry.register(Arc::new(s)).unwrap();
        }
        registry
    }

    #[test]
    fn highest_priority_supporting_container_wins() {
        let registry = registry(vec![
            Stub { id: "software", priority: 10, formats: &["mp4", "webm"] },
            Stub { id: "nvenc", priority: 50, formats: &["mp4"] },
            Stub { id: "vp9-only", priority: 90, formats: &["webm"] },
        ]);

        let req = TranscodeRequest::new("m", "/a.mkv", "MP4");
        assert_eq!(registry.select_provider(&req).unwrap().info.id, "nvenc");

        let req = TranscodeRequest::new("m", "/a.mkv", "webm");
        assert_eq!(registry.select_provider(&req).unwrap().info.id, "vp9-only");
    }

    #[test]
    fn no_match_is_no_providers_available() {
        let registry = registry(vec![Stub { id: "a", priority: 1, formats: &["mp4"] }]);
        let req = TranscodeRequest::new("m", "/a.mkv", "dash");
        assert!(matches!(
            registry.select_provider(&req),
            Err(Error::NoProvidersAvailable(c)) if c == "dash"
        ));
        assert!(matches!(
            ProviderRegistry::new().select_provider(&req),
            Err(Error::NoProvidersAvailable(_))
        ));
    }

    #[test]
    fn ties_break_by_id() {
        let registry = registry(vec![
            Stub { id: "zeta", priority: 5, formats: &["mp4"] },
            Stub { id: "alpha", priority: 5, formats: &["mp4"] },
        ]);
        let req = TranscodeRequest::new("m", "/a.mkv", "mp4");
        assert_eq!(registry.select_provider(&req).unwrap().info.id, "alpha");
    }

    #[test]
    fn register_upserts_and_unregister_removes() {
        let registry = registry(vec![Stub { id: "a", priority: 1, formats: &["mp4"] }]);
        registry
            .register(Arc::new(Stub { id: "a", priority: 7, formats: &["hls"] }))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().info.priority, 7);
        assert_eq!(registry.providers()[0].capabilities.formats[0].format, "hls");

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(matches!(registry.get("a"), Err(Error::ProviderNotFound(_))));
    }

    #[test]
    fn empty_id_is_rejected() {
        let registry = ProviderRegistry::new();
        let err = registry
            .register(Arc::new(Stub { id: "", priority: 1, formats: &["mp4"] }))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(registry.is_empty());
    }
}
