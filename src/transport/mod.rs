//! Chunk Transport Gateway
//!
//! Moves raw chunk bytes to and from a remote provider. The core only relies on
//! the push/pull contract; which cloud API sits behind it is up to the
//! implementation.

mod memory;

pub use memory::MemoryTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Object not found at {provider}: {object_id}")]
    ObjectNotFound { provider: String, object_id: String },

    #[error("Provider error: {0}")]
    Provider(String),
}

/// Where a chunk's bytes live once transported
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderRef {
    pub provider: String,
    pub object_id: String,
}

#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Store `bytes`, preferably at `provider_hint`, and return their location
    async fn push(&self, provider_hint: &str, bytes: &[u8]) -> Result<ProviderRef, TransportError>;

    /// Fetch the bytes stored at `provider`/`object_id`
    async fn pull(&self, provider: &str, object_id: &str) -> Result<Vec<u8>, TransportError>;

    /// Drop a stored object. Missing objects are not an error.
    async fn discard(&self, provider: &str, object_id: &str) -> Result<(), TransportError>;
}
