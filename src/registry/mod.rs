//! Identity registry - maps module names to wire identifiers
//!
//! Populated at startup as modules register, read-mostly afterwards. The
//! server consults it on the first frame of every connection to decide
//! whether the claimed identifier is known.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use thiserror::Error;

use crate::protocol::Identifier;

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Module name already registered: {0}")]
    DuplicateName(String),

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(Identifier),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Process-wide mapping of module name <-> [`Identifier`].
///
/// Identifiers are allocated sequentially; zero is reserved so an all-zero
/// identifier on the wire is always invalid. Two modules never share an
/// identifier.
pub struct Registry {
    inner: RwLock<Maps>,
    next: AtomicU32,
}

#[derive(Default)]
struct Maps {
    by_name: HashMap<String, Identifier>,
    by_id: HashMap<Identifier, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Maps::default()),
            next: AtomicU32::new(1),
        }
    }

    /// Register a module name and allocate its identifier.
    pub fn register(&self, name: &str) -> RegistryResult<Identifier> {
        let mut maps = self.inner.write().unwrap();

        if maps.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }

        let id = Identifier::from_bytes(self.next.fetch_add(1, Ordering::SeqCst).to_be_bytes());
        maps.by_name.insert(name.to_string(), id);
        maps.by_id.insert(id, name.to_string());

        tracing::debug!("Registered module '{}' as {}", name, id);
        Ok(id)
    }

    /// Resolve an identifier back to the module name that owns it.
    pub fn resolve(&self, id: Identifier) -> RegistryResult<String> {
        let maps = self.inner.read().unwrap();
        maps.by_id
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownIdentifier(id))
    }

    /// Look up the identifier for a registered name.
    pub fn lookup(&self, name: &str) -> Option<Identifier> {
        self.inner.read().unwrap().by_name.get(name).copied()
    }

    /// Whether the identifier belongs to a registered module.
    pub fn contains(&self, id: Identifier) -> bool {
        self.inner.read().unwrap().by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_and_resolve() {
        let registry = Registry::new();

        let core = registry.register("core").unwrap();
        let intel = registry.register("threat-intel").unwrap();

        assert_ne!(core, intel);
        assert!(!core.is_zero());
        assert_eq!(registry.resolve(core).unwrap(), "core");
        assert_eq!(registry.resolve(intel).unwrap(), "threat-intel");
        assert_eq!(registry.lookup("core"), Some(core));
        assert!(registry.contains(intel));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = Registry::new();
        registry.register("core").unwrap();

        assert!(matches!(
            registry.register("core"),
            Err(RegistryError::DuplicateName(name)) if name == "core"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_identifier() {
        let registry = Registry::new();
        let unknown = Identifier::from_bytes([9, 9, 9, 9]);

        assert!(matches!(
            registry.resolve(unknown),
            Err(RegistryError::UnknownIdentifier(id)) if id == unknown
        ));
        assert!(!registry.contains(unknown));
    }

    #[test]
    fn test_concurrent_registration_unique() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                let mut ids = Vec::new();
                for j in 0..50 {
                    ids.push(registry.register(&format!("module-{}-{}", i, j)).unwrap());
                }
                ids
            }));
        }

        let mut all: Vec<Identifier> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_by_key(|id| id.to_bytes());
        all.dedup();

        assert_eq!(all.len(), total);
        assert_eq!(registry.len(), total);
    }
}
