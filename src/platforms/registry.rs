use std::collections::BTreeMap;

use super::traits::{Platform, PlatformProvider};
use crate::error::ApiError;

/// Registry of configured platform integrations.
pub struct PlatformRegistry {
    providers: BTreeMap<Platform, Box<dyn PlatformProvider>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    /// Register a provider, replacing any previous one for the same platform.
    pub fn register(&mut self, provider: Box<dyn PlatformProvider>) {
        self.providers.insert(provider.platform(), provider);
    }

    pub fn get(&self, platform: Platform) -> Option<&dyn PlatformProvider> {
        self.providers.get(&platform).map(|p| p.as_ref())
    }

    /// Like `get`, but unconfigured platforms are an error.
    pub fn require(&self, platform: Platform) -> Result<&dyn PlatformProvider, ApiError> {
        self.get(platform)
            .ok_or_else(|| ApiError::PlatformNotConfigured(platform.to_string()))
    }

    /// Registered providers in platform order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn PlatformProvider> {
        self.providers.values().map(|p| p.as_ref())
    }

    pub fn count(&self) -> usize {
        self.providers.len()
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::{LinkedInProvider, MetaProvider};

    #[test]
    fn test_register_and_require() {
        let mut registry = PlatformRegistry::new();
        registry.register(Box::new(MetaProvider::new("id".into(), "secret".into())));
        registry.register(Box::new(LinkedInProvider::new("id".into(), "secret".into())));

        assert_eq!(registry.count(), 2);
        assert!(registry.require(Platform::Meta).is_ok());
        assert!(matches!(
            registry.require(Platform::Snapchat),
            Err(ApiError::PlatformNotConfigured(_))
        ));

        let order: Vec<Platform> = registry.iter().map(|p| p.platform()).collect();
        assert_eq!(order, vec![Platform::Meta, Platform::LinkedIn]);
    }
}
