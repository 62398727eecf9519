//! Thread-safe mapping from workload name to its supervisor.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use mctl_core::models::WorkloadSpec;

use crate::supervisor::Supervisor;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("workload '{0}' is already registered")]
    Duplicate(String),
}

/// Name-indexed collection of supervisors. Iteration yields a consistent
/// snapshot taken under the lock; the snapshot is sorted by name.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<BTreeMap<String, Arc<Supervisor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, supervisor: Arc<Supervisor>) -> Result<(), RegistryError> {
        let mut map = self.inner.write().expect("registry lock");
        let name = supervisor.name().to_string();
        if map.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        map.insert(name, supervisor);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.inner.write().expect("registry lock").remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.inner.read().expect("registry lock").get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().expect("registry lock").contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent snapshot of all supervisors, sorted by name.
    pub fn snapshot(&self) -> Vec<Arc<Supervisor>> {
        self.inner
            .read()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Atomic spec swap preserving the supervisor instance. Returns false
    /// when the name is unknown.
    pub fn swap(&self, name: &str, spec: WorkloadSpec) -> bool {
        let map = self.inner.read().expect("registry lock");
        match map.get(name) {
            Some(supervisor) => {
                supervisor.replace_spec(spec);
                true
            }
            None => false,
        }
    }
}
