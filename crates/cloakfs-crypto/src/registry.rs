//! Interface-versioned registries for ciphers and name codecs.
//!
//! Components carry an [`Interface`] (name + major/minor/age). A stored
//! implementation satisfies a request when the names match, the stored
//! major is at least the requested one, and the gap is covered by the
//! stored age: the classical library-versioning rule.

use std::sync::Arc;

use crate::cipher::Cipher;
use crate::key::CipherKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub age: u32,
}

impl Interface {
    pub fn new(name: &str, major: u32, minor: u32, age: u32) -> Self {
        Interface {
            name: name.to_owned(),
            major,
            minor,
            age,
        }
    }

    /// Does an implementation carrying `self` satisfy a request for
    /// `requested`?
    pub fn implements(&self, requested: &Interface) -> bool {
        self.name == requested.name
            && self.major >= requested.major
            && self.major - requested.major <= self.age
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}:{}:{})", self.name, self.major, self.minor, self.age)
    }
}

/// A factory produces a component for a requested interface, given the
/// mount cipher and key.
pub type Factory<T> = Box<dyn Fn(&Interface, Arc<dyn Cipher>, CipherKey) -> T + Send + Sync>;

pub struct RegistryEntry<T> {
    pub name: String,
    pub description: String,
    pub iface: Interface,
    factory: Factory<T>,
}

/// A registry of components keyed by short name and by interface.
///
/// Built explicitly at mount setup rather than through global
/// constructors; callers register what they wire.
pub struct Registry<T> {
    entries: Vec<RegistryEntry<T>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Registry {
            entries: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        iface: Interface,
        factory: Factory<T>,
    ) {
        self.entries.push(RegistryEntry {
            name: name.to_owned(),
            description: description.to_owned(),
            iface,
            factory,
        });
    }

    pub fn create_by_name(&self, name: &str, cipher: Arc<dyn Cipher>, key: CipherKey) -> Option<T> {
        let entry = self.entries.iter().find(|e| e.name == name)?;
        Some((entry.factory)(&entry.iface, cipher, key))
    }

    pub fn create_by_interface(
        &self,
        requested: &Interface,
        cipher: Arc<dyn Cipher>,
        key: CipherKey,
    ) -> Option<T> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.iface.implements(requested))?;
        Some((entry.factory)(requested, cipher, key))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &Interface)> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.description.as_str(), &e.iface))
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry::new()
    }
}

/// Cipher factories take a requested key length instead of a cipher.
pub type CipherFactory = Box<dyn Fn(&Interface, usize) -> Arc<dyn Cipher> + Send + Sync>;

pub struct CipherEntry {
    pub name: String,
    pub description: String,
    pub iface: Interface,
    factory: CipherFactory,
}

pub struct CipherRegistry {
    entries: Vec<CipherEntry>,
}

impl CipherRegistry {
    pub fn new() -> Self {
        CipherRegistry {
            entries: Vec::new(),
        }
    }

    /// A registry with the stock AES cipher registered.
    pub fn with_defaults() -> Self {
        let mut reg = CipherRegistry::new();
        reg.register(
            "AES",
            "16 byte block cipher",
            crate::aes::AesCipher::interface(),
            Box::new(|_iface, _key_len| Arc::new(crate::aes::AesCipher::new())),
        );
        reg
    }

    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        iface: Interface,
        factory: CipherFactory,
    ) {
        self.entries.push(CipherEntry {
            name: name.to_owned(),
            description: description.to_owned(),
            iface,
            factory,
        });
    }

    pub fn create_by_name(&self, name: &str, key_len: usize) -> Option<Arc<dyn Cipher>> {
        let entry = self.entries.iter().find(|e| e.name == name)?;
        Some((entry.factory)(&entry.iface, key_len))
    }

    pub fn create_by_interface(
        &self,
        requested: &Interface,
        key_len: usize,
    ) -> Option<Arc<dyn Cipher>> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.iface.implements(requested))?;
        Some((entry.factory)(requested, key_len))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &Interface)> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.description.as_str(), &e.iface))
    }
}

impl Default for CipherRegistry {
    fn default() -> Self {
        CipherRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_version_matching() {
        let stored = Interface::new("nameio/block", 4, 0, 2);

        // exact and age-covered older majors match
        assert!(stored.implements(&Interface::new("nameio/block", 4, 0, 0)));
        assert!(stored.implements(&Interface::new("nameio/block", 3, 0, 0)));
        assert!(stored.implements(&Interface::new("nameio/block", 2, 0, 0)));

        // too old, too new, or differently named do not
        assert!(!stored.implements(&Interface::new("nameio/block", 1, 0, 0)));
        assert!(!stored.implements(&Interface::new("nameio/block", 5, 0, 0)));
        assert!(!stored.implements(&Interface::new("nameio/stream", 4, 0, 0)));
    }

    #[test]
    fn cipher_registry_defaults() {
        let reg = CipherRegistry::with_defaults();
        assert!(reg.create_by_name("AES", 32).is_some());
        assert!(reg.create_by_name("Serpent", 32).is_none());

        let by_iface = reg.create_by_interface(&Interface::new("cipher/aes", 2, 0, 0), 32);
        assert!(by_iface.is_some());
    }

    #[test]
    fn generic_registry_lookup() {
        let mut reg: Registry<u32> = Registry::new();
        reg.register(
            "Fixed",
            "returns a constant",
            Interface::new("test/fixed", 1, 0, 0),
            Box::new(|_, _, _| 7),
        );

        let cipher: Arc<dyn Cipher> = Arc::new(crate::aes::AesCipher::new());
        let key = CipherKey::random();
        assert_eq!(
            reg.create_by_name("Fixed", cipher.clone(), key.clone()),
            Some(7)
        );
        assert_eq!(reg.create_by_name("Missing", cipher, key), None);
    }
}
