//! Adapter Registry
//!
//! Maps each backend to its single-volume and group adapter. Every runtime
//! (and every test) builds its own registry; a backend can be registered
//! only once per instance.

use super::{BackendAdapter, GroupReplicationAdapter, ReplicationAdapter};
use crate::domain::{Backend, ResourceStoreRef};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of backend adapters
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<Backend, Arc<dyn ReplicationAdapter>>>,
    group_adapters: RwLock<HashMap<Backend, Arc<dyn GroupReplicationAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapter for every backend
    pub fn with_defaults(store: ResourceStoreRef) -> Result<Self> {
        let registry = Self::new();
        for backend in Backend::PREFERENCE_ORDER {
            let adapter = Arc::new(BackendAdapter::for_backend(backend, store.clone()));
            registry.register(adapter.clone())?;
            registry.register_group(adapter)?;
        }
        Ok(registry)
    }

    pub fn register(&self, adapter: Arc<dyn ReplicationAdapter>) -> Result<()> {
        let backend = adapter.backend();
        let mut adapters = self.adapters.write();
        if adapters.contains_key(&backend) {
            return Err(Error::AdapterAlreadyRegistered { backend });
        }
        debug!("Registered {} adapter", backend);
        adapters.insert(backend, adapter);
        Ok(())
    }

    pub fn register_group(&self, adapter: Arc<dyn GroupReplicationAdapter>) -> Result<()> {
        let backend = adapter.group_backend();
        let mut adapters = self.group_adapters.write();
        if adapters.contains_key(&backend) {
            return Err(Error::AdapterAlreadyRegistered { backend });
        }
        debug!("Registered {} group adapter", backend);
        adapters.insert(backend, adapter);
        Ok(())
    }

    pub fn adapter(&self, backend: Backend) -> Result<Arc<dyn ReplicationAdapter>> {
        self.adapters
            .read()
            .get(&backend)
            .cloned()
            .ok_or(Error::AdapterNotRegistered { backend })
    }

    pub fn group_adapter(&self, backend: Backend) -> Result<Arc<dyn GroupReplicationAdapter>> {
        self.group_adapters
            .read()
            .get(&backend)
            .cloned()
            .ok_or(Error::AdapterNotRegistered { backend })
    }

    /// Backends with a single-volume adapter, in preference order
    pub fn backends(&self) -> Vec<Backend> {
        let adapters = self.adapters.read();
        Backend::PREFERENCE_ORDER
            .into_iter()
            .filter(|b| adapters.contains_key(b))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::adapters::CephAdapter;
    use crate::store::memory::InMemoryResourceStore;
    use assert_matches::assert_matches;

    fn store() -> ResourceStoreRef {
        Arc::new(InMemoryResourceStore::new())
    }

    #[test]
    fn test_defaults_cover_every_backend() {
        let registry = AdapterRegistry::with_defaults(store()).unwrap();
        assert_eq!(registry.backends(), Backend::PREFERENCE_ORDER.to_vec());
        for backend in Backend::PREFERENCE_ORDER {
            assert_eq!(registry.adapter(backend).unwrap().backend(), backend);
            assert_eq!(registry.group_adapter(backend).unwrap().group_backend(), backend);
        }
    }

    #[test]
    fn test_duplicate_registration_refused() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(CephAdapter::new(store()))).unwrap();

        let err = registry
            .register(Arc::new(CephAdapter::new(store())))
            .unwrap_err();
        assert_matches!(err, Error::AdapterAlreadyRegistered { backend: Backend::Ceph });

        // group side is tracked separately
        registry.register_group(Arc::new(CephAdapter::new(store()))).unwrap();
    }

    #[test]
    fn test_instances_are_independent() {
        let first = AdapterRegistry::with_defaults(store()).unwrap();
        let second = AdapterRegistry::with_defaults(store()).unwrap();
        assert!(first.adapter(Backend::Trident).is_ok());
        assert!(second.adapter(Backend::Trident).is_ok());
    }

    #[test]
    fn test_missing_adapter() {
        let registry = AdapterRegistry::new();
        assert_matches!(
            registry.adapter(Backend::PowerStore),
            Err(Error::AdapterNotRegistered { backend: Backend::PowerStore })
        );
        assert!(registry.group_adapter(Backend::Ceph).is_err());
    }
}
