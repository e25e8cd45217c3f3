//! Endpoint table shared with the routing layer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::broker::BackendAddress;

/// Name to backend address lookup used by the proxy.
///
/// Endpoints come from two places: static entries configured at startup,
/// and dynamic entries registered when the fleet adds an instance the proxy
/// does not know yet. Only dynamic entries are ever unregistered.
pub trait EndpointRegistry: Send + Sync {
    fn contains(&self, name: &str) -> bool;

    fn get(&self, name: &str) -> Option<BackendAddress>;

    /// Register a dynamic endpoint. Returns false if `name` is already known.
    fn register(&self, name: &str, address: BackendAddress) -> bool;

    /// Remove a dynamic endpoint. Static endpoints are left in place and
    /// false is returned.
    fn unregister(&self, name: &str) -> bool;

    /// Every endpoint, sorted by name.
    fn list(&self) -> Vec<(String, BackendAddress)>;
}

#[derive(Default)]
struct Endpoints {
    by_name: BTreeMap<String, BackendAddress>,
    dynamic: BTreeSet<String>,
}

/// In-process endpoint table.
#[derive(Default)]
pub struct InMemoryEndpoints {
    inner: Mutex<Endpoints>,
}

impl InMemoryEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table seeded with static endpoints.
    pub fn with_static(entries: impl IntoIterator<Item = (String, BackendAddress)>) -> Self {
        let endpoints = Self::new();
        {
            let mut inner = endpoints.lock();
            inner.by_name.extend(entries);
        }
        endpoints
    }

    fn lock(&self) -> MutexGuard<'_, Endpoints> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_dynamic(&self, name: &str) -> bool {
        self.lock().dynamic.contains(name)
    }
}

impl EndpointRegistry for InMemoryEndpoints {
    fn contains(&self, name: &str) -> bool {
        self.lock().by_name.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<BackendAddress> {
        self.lock().by_name.get(name).cloned()
    }

    fn register(&self, name: &str, address: BackendAddress) -> bool {
        let mut inner = self.lock();
        if inner.by_name.contains_key(name) {
            return false;
        }
        debug!(instance = %name, address = %address, "Registered endpoint");
        inner.by_name.insert(name.to_string(), address);
        inner.dynamic.insert(name.to_string());
        true
    }

    fn unregister(&self, name: &str) -> bool {
        let mut inner = self.lock();
        if !inner.dynamic.remove(name) {
            return false;
        }
        inner.by_name.remove(name);
        debug!(instance = %name, "Unregistered endpoint");
        true
    }

    fn list(&self) -> Vec<(String, BackendAddress)> {
        self.lock()
            .by_name
            .iter()
            .map(|(name, addr)| (name.clone(), addr.clone()))
            .collect()
    }
}
