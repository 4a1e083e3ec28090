//! Realm registry.
//!
//! Realms are started when their isolation boundary comes up and stopped
//! when it goes away. Each realm is shared through an `Arc`; its tables and
//! handles are released once the registry and every user have dropped it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::config::AccountConfig;
use crate::error::Result;
use crate::realm::{Realm, RealmId};

/// Central lookup of live realms by id.
pub struct RealmRegistry {
    /// Configuration applied to newly started realms.
    config: AccountConfig,
    realms: RwLock<HashMap<RealmId, Arc<Realm>>>,
}

impl RealmRegistry {
    /// Create a new empty registry.
    pub fn new(config: AccountConfig) -> Self {
        RealmRegistry {
            config,
            realms: RwLock::new(HashMap::new()),
        }
    }

    /// Start a realm, or return the running one with the same id.
    pub fn start(&self, id: RealmId) -> Result<Arc<Realm>> {
        let mut realms = self.realms.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(realm) = realms.get(&id) {
            return Ok(Arc::clone(realm));
        }
        let realm = Arc::new(Realm::new(id, self.config.clone())?);
        realms.insert(id, Arc::clone(&realm));
        debug!(realm = %id, "Registered realm");
        Ok(realm)
    }

    /// Get a running realm by id.
    pub fn get(&self, id: RealmId) -> Option<Arc<Realm>> {
        self.realms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Remove a realm from the registry.
    ///
    /// Returns the removed realm if it existed.
    pub fn stop(&self, id: RealmId) -> Option<Arc<Realm>> {
        let realm = self
            .realms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)?;
        debug!(realm = %id, "Unregistered realm");
        Some(realm)
    }

    /// Ids of all running realms, sorted.
    pub fn ids(&self) -> Vec<RealmId> {
        let mut ids: Vec<_> = self
            .realms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.realms.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RealmRegistry {
    fn default() -> Self {
        Self::new(AccountConfig::default())
    }
}
