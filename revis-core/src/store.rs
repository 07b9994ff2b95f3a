//! Where connection descriptors come from.

use std::fmt;

use async_trait::async_trait;
use revis_model::ConnectionDescriptor;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Result, RevisError};

/// Resolves a connection identity to the descriptor needed to dial it.
///
/// Credential storage and encryption at rest belong to the implementation;
/// the core only ever sees plaintext secrets.
#[async_trait]
pub trait ConnectionStore: Send + Sync + fmt::Debug {
    async fn resolve(&self, identity: &str) -> Result<ConnectionDescriptor>;
}

/// Connection list held in memory, in insertion order.
#[derive(Default)]
pub struct InMemoryConnectionStore {
    connections: RwLock<Vec<ConnectionDescriptor>>,
}

impl fmt::Debug for InMemoryConnectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .connections
            .try_read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryConnectionStore")
            .field("connections", &count)
            .finish()
    }
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ConnectionDescriptor>) -> Self {
        Self {
            connections: RwLock::new(descriptors.into_iter().collect()),
        }
    }

    pub async fn list(&self) -> Vec<ConnectionDescriptor> {
        self.connections.read().await.clone()
    }

    /// Stores `descriptor`, replacing the entry whose identity is `replacing`
    /// (or, failing that, the entry with the same identity as `descriptor`).
    ///
    /// Returns the identity that was replaced, if any, so the caller can close
    /// the runner built from the old descriptor.
    pub async fn upsert(
        &self,
        descriptor: ConnectionDescriptor,
        replacing: Option<&str>,
    ) -> Option<String> {
        let target = replacing
            .map(str::to_string)
            .unwrap_or_else(|| descriptor.identity());
        let mut connections = self.connections.write().await;

        match connections.iter().position(|c| c.identity() == target) {
            Some(index) => {
                info!(
                    "Replacing connection {} with {}",
                    target,
                    descriptor.identity()
                );
                connections[index] = descriptor;
                Some(target)
            }
            None => {
                info!("Adding connection {}", descriptor.identity());
                connections.push(descriptor);
                None
            }
        }
    }

    /// Removes the descriptor with `identity`; `true` if one was present.
    pub async fn remove(&self, identity: &str) -> bool {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|c| c.identity() != identity);
        before != connections.len()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn resolve(&self, identity: &str) -> Result<ConnectionDescriptor> {
        self.connections
            .read()
            .await
            .iter()
            .find(|c| c.identity() == identity)
            .cloned()
            .ok_or_else(|| RevisError::ConnectionNotFound(identity.to_string()))
    }
}
