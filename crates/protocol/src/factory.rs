//! Core-model factories and the provider registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::{CoreModel, Environment};

/// Current protocol version negotiated at core creation.
pub const API_VERSION: u64 = 20_201_012;

/// Oldest historical protocol version factories still accept.
pub const COMPAT_API_VERSION: u64 = 20_190_417;

/// Protocol versions a conforming factory accepts, newest first.
pub const SUPPORTED_API_VERSIONS: [u64; 2] = [API_VERSION, COMPAT_API_VERSION];

/// Returns `true` when `version` is a protocol version factories accept.
#[must_use]
pub fn api_version_supported(version: u64) -> bool {
    SUPPORTED_API_VERSIONS.contains(&version)
}

/// Builds core-model instances for one provider.
///
/// Instance teardown is by ownership: dropping the returned box releases
/// the core, so an instance can never be destroyed through a foreign
/// provider.
pub trait CoreFactory: Send + Sync {
    /// Provider name the factory registers under.
    fn provider(&self) -> &str;

    /// Variant names this factory can instantiate.
    fn variants(&self) -> &[&str];

    /// Creates a core bound to `env` for its whole lifetime.
    ///
    /// Returns `None` when `api_version` is unsupported or `variant` is
    /// unknown; both are configuration errors the caller reports, never
    /// panics.
    fn create(
        &self,
        api_version: u64,
        env: Arc<dyn Environment>,
        variant: &str,
    ) -> Option<Box<dyn CoreModel>>;
}

/// Error raised when registering a factory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A factory with the same provider name is already registered.
    #[error("provider {0:?} is already registered")]
    DuplicateProvider(String),
}

/// Maps provider names to factories.
///
/// This stands in for dynamic-library symbol resolution: the runner
/// resolves a provider by name and asks the factory for an instance.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: BTreeMap<String, Arc<dyn CoreFactory>>,
}

impl FactoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under its provider name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateProvider`] when the name is taken.
    pub fn register(&mut self, factory: Arc<dyn CoreFactory>) -> Result<(), RegistryError> {
        let name = factory.provider().to_owned();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::DuplicateProvider(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolves a provider by name.
    #[must_use]
    pub fn resolve(&self, provider: &str) -> Option<Arc<dyn CoreFactory>> {
        self.factories.get(provider).cloned()
    }

    /// Registered provider names in sorted order.
    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        api_version_supported, Arc, CoreFactory, FactoryRegistry, RegistryError, API_VERSION,
        COMPAT_API_VERSION, SUPPORTED_API_VERSIONS,
    };
    use crate::{CoreModel, Environment};

    struct NullFactory {
        name: &'static str,
    }

    impl CoreFactory for NullFactory {
        fn provider(&self) -> &str {
            self.name
        }

        fn variants(&self) -> &[&str] {
            &[]
        }

        fn create(
            &self,
            _api_version: u64,
            _env: Arc<dyn Environment>,
            _variant: &str,
        ) -> Option<Box<dyn CoreModel>> {
            None
        }
    }

    #[test]
    fn current_and_compat_versions_are_supported() {
        assert!(api_version_supported(API_VERSION));
        assert!(api_version_supported(COMPAT_API_VERSION));
        assert_eq!(SUPPORTED_API_VERSIONS[0], API_VERSION);
    }

    #[test]
    fn unknown_versions_are_rejected() {
        assert!(!api_version_supported(0));
        assert!(!api_version_supported(API_VERSION + 1));
    }

    #[test]
    fn registry_resolves_by_provider_name() {
        let mut registry = FactoryRegistry::new();
        registry
            .register(Arc::new(NullFactory { name: "alpha" }))
            .expect("first registration succeeds");
        registry
            .register(Arc::new(NullFactory { name: "beta" }))
            .expect("distinct name succeeds");

        assert!(registry.resolve("alpha").is_some());
        assert!(registry.resolve("beta").is_some());
        assert!(registry.resolve("gamma").is_none());
        assert_eq!(registry.providers(), ["alpha", "beta"]);
    }

    #[test]
    fn duplicate_provider_is_rejected() {
        let mut registry = FactoryRegistry::new();
        registry
            .register(Arc::new(NullFactory { name: "alpha" }))
            .expect("first registration succeeds");

        let err = registry
            .register(Arc::new(NullFactory { name: "alpha" }))
            .expect_err("duplicate must be rejected");
        assert_eq!(err, RegistryError::DuplicateProvider("alpha".to_owned()));
    }
}
