use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;

use crate::config::Config;
use crate::nodeset::{self, NodeSet};

use super::hostexpr::{self, Tree};
use super::Backend;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum Error {
    /// Invalid query: {0}
    Grammar(#[from] hostexpr::Error),
    /// Invalid host expression: {0}
    Hosts(#[from] nodeset::Error),
}

/// Resolves arbitrarily nested boolean combinations of compact host
/// expressions without any I/O. The reliable fallback when the primary
/// selection mechanism is unavailable, and the workhorse of tests.
pub struct DirectQuery;

impl DirectQuery {
    pub fn new(_config: &Config) -> Self {
        DirectQuery
    }

    fn resolve(&self, query: &str) -> Result<NodeSet, Error> {
        let tree = Tree::parse(query, false)?;
        tree.evaluate(&mut |word| NodeSet::parse(word).map_err(Error::from))
    }
}

#[async_trait]
impl Backend for DirectQuery {
    async fn execute(&mut self, query: &str) -> Result<NodeSet, super::Error> {
        Ok(self.resolve(query)?)
    }
}
