//! Topology collaborator.
//!
//! Answers which keyspace/shard targets this tablet serves and what key
//! range each shard covers.

use std::collections::HashMap;

use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::KeyRange;

use crate::config::ServerConfig;

/// Read-only routing metadata.
pub trait Topology: Send + Sync + 'static {
    /// Returns the key range of a served target.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the tablet does not serve the target.
    fn key_range(&self, keyspace: &str, shard: &str) -> TabletResult<KeyRange>;
}

/// A fixed topology: one keyspace with a list of shards.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    keyspace: String,
    shards: HashMap<String, KeyRange>,
}

impl StaticTopology {
    /// Creates a topology serving `shards` of `keyspace`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a shard name is not a key range.
    pub fn new<I, S>(keyspace: impl Into<String>, shards: I) -> TabletResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shards = shards
            .into_iter()
            .map(|name| {
                let name = name.into();
                KeyRange::parse_shard(&name).map(|range| (name, range))
            })
            .collect::<TabletResult<HashMap<_, _>>>()?;
        Ok(Self {
            keyspace: keyspace.into(),
            shards,
        })
    }

    /// Builds the topology described by a server configuration.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a configured shard name is not a key range.
    pub fn from_config(config: &ServerConfig) -> TabletResult<Self> {
        Self::new(config.keyspace.clone(), config.shards.iter().cloned())
    }

    /// The served keyspace.
    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }
}

impl Topology for StaticTopology {
    fn key_range(&self, keyspace: &str, shard: &str) -> TabletResult<KeyRange> {
        if keyspace != self.keyspace {
            return Err(TabletError::invalid_argument(format!(
                "keyspace {keyspace} is not served by this tablet"
            )));
        }
        self.shards.get(shard).copied().ok_or_else(|| {
            TabletError::invalid_argument(format!(
                "shard {keyspace}/{shard} is not served by this tablet"
            ))
        })
    }
}
