mod google;
pub mod http;
mod linkedin;
mod meta;
mod registry;
mod snapchat;
mod tiktok;
mod traits;
mod twitter;

pub use google::GoogleProvider;
pub use linkedin::LinkedInProvider;
pub use meta::MetaProvider;
pub use registry::PlatformRegistry;
pub use snapchat::SnapchatProvider;
pub use tiktok::TikTokProvider;
pub(crate) use traits::unsupported;
pub use traits::{AccountIdentity, Asset, AssetType, Platform, PlatformProvider, TokenSet};
pub use twitter::TwitterProvider;

use crate::config::Config;
use tracing::debug;

/// Register every platform that has OAuth app credentials configured.
pub fn register_defaults(registry: &mut PlatformRegistry, config: &Config) {
    for platform in Platform::ALL {
        let Some(app) = config.credentials(platform) else {
            debug!("{platform} not configured, skipping");
            continue;
        };
        let (id, secret) = (app.client_id.clone(), app.client_secret.clone());

        let provider: Box<dyn PlatformProvider> = match platform {
            Platform::Meta => Box::new(MetaProvider::new(id, secret)),
            Platform::Google => Box::new(GoogleProvider::new(
                id,
                secret,
                config.google_developer_token.clone(),
            )),
            Platform::TikTok => Box::new(TikTokProvider::new(id, secret)),
            Platform::LinkedIn => Box::new(LinkedInProvider::new(id, secret)),
            Platform::Twitter => Box::new(TwitterProvider::new(id, secret)),
            Platform::Snapchat => Box::new(SnapchatProvider::new(id, secret)),
        };
        registry.register(provider);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppCredentials;

    #[test]
    fn test_register_defaults_only_configured() {
        let mut config = Config::for_tests();
        config.tiktok = Some(AppCredentials {
            client_id: "app".into(),
            client_secret: "secret".into(),
        });
        config.snapchat = Some(AppCredentials {
            client_id: "app".into(),
            client_secret: "secret".into(),
        });

        let mut registry = PlatformRegistry::new();
        register_defaults(&mut registry, &config);

        assert_eq!(registry.count(), 2);
        assert!(registry.get(Platform::TikTok).is_some());
        assert!(registry.get(Platform::Meta).is_none());
    }

    #[test]
    fn test_every_platform_lists_asset_types() {
        let providers: Vec<Box<dyn PlatformProvider>> = vec![
            Box::new(MetaProvider::new("a".into(), "b".into())),
            Box::new(GoogleProvider::new("a".into(), "b".into(), None)),
            Box::new(TikTokProvider::new("a".into(), "b".into())),
            Box::new(LinkedInProvider::new("a".into(), "b".into())),
            Box::new(TwitterProvider::new("a".into(), "b".into())),
            Box::new(SnapchatProvider::new("a".into(), "b".into())),
        ];
        for provider in providers {
            assert!(!provider.asset_types().is_empty());
            assert!(provider.supports(provider.asset_types()[0]));
        }
    }
}
