//! Image providers and the registry the orchestrator resolves routes against.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use image::DynamicImage;
use indexmap::IndexMap;

mod dryrun;
mod fal;
mod replicate;

pub use dryrun::DryrunProvider;
pub use fal::FalProvider;
pub use replicate::ReplicateProvider;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    pub seed: Option<i64>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: DynamicImage,
    /// Seed the provider reports having used, when it reports one.
    pub seed: Option<i64>,
}

/// One text-to-image backend. A call produces at most one image; an empty or
/// zero-sized raster is treated as malformed by the caller.
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage>;
}

#[derive(Default, Clone)]
pub struct ImageProviderRegistry {
    providers: IndexMap<String, Arc<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.register_arc(Arc::new(provider));
    }

    pub fn register_arc(&mut self, provider: Arc<dyn ImageProvider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(FalProvider::new());
    providers.register(ReplicateProvider::new());
    providers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_keeps_registration_order() {
        let registry = default_provider_registry();
        assert_eq!(registry.names(), vec!["dryrun", "fal", "replicate"]);
        assert!(registry.get("fal").is_some());
        assert!(registry.get("midjourney").is_none());
    }

    #[test]
    fn registering_same_name_replaces_provider() {
        let mut registry = ImageProviderRegistry::new();
        registry.register(DryrunProvider);
        registry.register(DryrunProvider);
        assert_eq!(registry.names(), vec!["dryrun"]);
    }
}
