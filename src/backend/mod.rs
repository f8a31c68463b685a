pub mod direct;
pub mod hostexpr;
pub mod knownhosts;
#[cfg(feature = "openstack")]
pub mod openstack;
pub mod puppetdb;

use std::collections::BTreeMap;

use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;

use crate::config::Config;
use crate::nodeset::NodeSet;

/// Prefix reserved for alias replacement in the top-level grammar.
pub const ALIAS_PREFIX: &str = "A";

#[derive(Debug, Display, Error)]
pub enum Error {
    /// Direct backend: {0}
    Direct(#[from] direct::Error),
    /// Known-hosts backend: {0}
    KnownHosts(#[from] knownhosts::Error),
    #[cfg(feature = "openstack")]
    /// OpenStack backend: {0}
    OpenStack(#[from] openstack::Error),
    /// PuppetDB backend: {0}
    PuppetDb(#[from] puppetdb::Error),
    /// Backend prefix `{0}` is reserved for aliases.
    ReservedPrefix(String),
    /// Backend prefix `{0}` is already registered by backend `{1}`.
    DuplicatePrefix(String, &'static str),
    /// No backend registered with prefix `{0}`.
    UnknownPrefix(String),
    /// No backend registered with name `{0}`.
    UnknownBackend(String),
}

impl Error {
    /// Whether this is a query-syntax failure (`InvalidQuery` class) rather
    /// than an I/O or registration failure.
    pub fn is_parse(&self) -> bool {
        match self {
            Error::Direct(_) => true,
            Error::KnownHosts(err) => err.is_parse(),
            #[cfg(feature = "openstack")]
            Error::OpenStack(err) => err.is_parse(),
            Error::PuppetDb(err) => err.is_parse(),
            Error::ReservedPrefix(_)
            | Error::DuplicatePrefix(..)
            | Error::UnknownPrefix(_)
            | Error::UnknownBackend(_) => false,
        }
    }
}

/// Contract every backend implements: parse a query string in the backend's
/// own sublanguage and resolve it into a set of fully-qualified host names.
///
/// A backend instance lives for a single `execute` call; the registry
/// constructs a fresh one per subquery, so backends keep no state between
/// calls.
#[async_trait]
pub trait Backend: Send {
    async fn execute(&mut self, query: &str) -> Result<NodeSet, Error>;
}

type Constructor = fn(&Config) -> Box<dyn Backend>;

/// Registration record: grammar prefix, backend name and constructor.
#[derive(Clone, Copy)]
pub struct Descriptor {
    pub prefix: &'static str,
    pub name: &'static str,
    constructor: Constructor,
}

impl Descriptor {
    pub const fn new(prefix: &'static str, name: &'static str, constructor: Constructor) -> Self {
        Descriptor {
            prefix,
            name,
            constructor,
        }
    }

    pub fn build(&self, config: &Config) -> Box<dyn Backend> {
        (self.constructor)(config)
    }
}

/// Process-wide backend table keyed by grammar prefix, filled once at
/// startup and read-only afterwards.
pub struct Registry {
    backends: BTreeMap<&'static str, Descriptor>,
}

impl Registry {
    /// Registry with all compiled-in backends.
    pub fn with_builtins() -> Result<Self, Error> {
        let mut registry = Registry {
            backends: BTreeMap::new(),
        };
        registry.register(Descriptor::new("D", "direct", |config| {
            Box::new(direct::DirectQuery::new(config))
        }))?;
        registry.register(Descriptor::new("K", "knownhosts", |config| {
            Box::new(knownhosts::KnownHostsQuery::new(config))
        }))?;
        registry.register(Descriptor::new("P", "puppetdb", |config| {
            Box::new(puppetdb::PuppetDbQuery::new(config))
        }))?;
        #[cfg(feature = "openstack")]
        registry.register(Descriptor::new("O", "openstack", |config| {
            Box::new(openstack::OpenStackQuery::new(config))
        }))?;
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: Descriptor) -> Result<(), Error> {
        if descriptor.prefix.eq_ignore_ascii_case(ALIAS_PREFIX) {
            return Err(Error::ReservedPrefix(descriptor.prefix.to_owned()));
        }
        if let Some(existing) = self.backends.get(descriptor.prefix) {
            return Err(Error::DuplicatePrefix(
                descriptor.prefix.to_owned(),
                existing.name,
            ));
        }
        self.backends.insert(descriptor.prefix, descriptor);
        Ok(())
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.backends.keys().copied()
    }

    pub fn by_prefix(&self, prefix: &str) -> Result<&Descriptor, Error> {
        self.backends
            .get(prefix)
            .ok_or_else(|| Error::UnknownPrefix(prefix.to_owned()))
    }

    pub fn by_name(&self, name: &str) -> Result<&Descriptor, Error> {
        self.backends
            .values()
            .find(|descriptor| descriptor.name == name)
            .ok_or_else(|| Error::UnknownBackend(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(config: &Config) -> Box<dyn Backend> {
        Box::new(direct::DirectQuery::new(config))
    }

    #[test]
    fn builtins_register_expected_prefixes() {
        let registry = Registry::with_builtins().unwrap();
        let prefixes: Vec<_> = registry.prefixes().collect();
        assert!(prefixes.contains(&"D"));
        assert!(prefixes.contains(&"K"));
        assert!(prefixes.contains(&"P"));
    }

    #[test]
    fn alias_prefix_is_reserved() {
        let mut registry = Registry::with_builtins().unwrap();
        let err = registry
            .register(Descriptor::new("A", "aliasish", noop))
            .unwrap_err();
        assert!(matches!(err, Error::ReservedPrefix(_)));
    }

    #[test]
    fn duplicate_prefix_is_rejected() {
        let mut registry = Registry::with_builtins().unwrap();
        let err = registry
            .register(Descriptor::new("D", "duplicate", noop))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePrefix(..)));
    }

    #[test]
    fn unknown_prefix_and_name_are_reported() {
        let registry = Registry::with_builtins().unwrap();
        assert!(matches!(registry.by_prefix("Z"), Err(Error::UnknownPrefix(_))));
        assert!(matches!(registry.by_name("nope"), Err(Error::UnknownBackend(_))));
        assert_eq!(registry.by_name("direct").unwrap().prefix, "D");
    }
}
