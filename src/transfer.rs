//! Chunk transfer - second stage of an upload
//!
//! Runs after the commit transaction has completed: pushes the bytes of every
//! still-pending chunk through the gateway and records the returned location.
//! Already finalized chunks are skipped, so a failed transfer is retried by
//! calling `push_file` again with the same bytes.

use crate::store::{FileChunk, StoreError, VirtualFileStore};
use crate::transport::{ChunkTransport, TransportError};

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Payload is {actual} bytes but virtual file {file_id} is {expected} bytes")]
    SizeMismatch {
        file_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Transport of chunk {chunk_id} failed: {source}")]
    Transport {
        chunk_id: String,
        #[source]
        source: TransportError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a transfer pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Chunks pushed and finalized by this pass
    pub pushed: usize,
    /// Chunks that were already finalized
    pub skipped: usize,
}

pub struct ChunkTransfer {
    store: Arc<VirtualFileStore>,
    transport: Arc<dyn ChunkTransport>,
    default_provider: String,
}

impl ChunkTransfer {
    pub fn new(
        store: Arc<VirtualFileStore>,
        transport: Arc<dyn ChunkTransport>,
        default_provider: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            default_provider: default_provider.into(),
        }
    }

    /// Push the pending chunks of `file_id`, slicing them out of `data`
    pub async fn push_file(&self, file_id: &str, data: &[u8]) -> Result<TransferReport, TransferError> {
        let (file, chunks) = self.store.load_with_chunks(file_id)?;

        if data.len() as u64 != file.size_bytes {
            return Err(TransferError::SizeMismatch {
                file_id: file.id,
                expected: file.size_bytes,
                actual: data.len() as u64,
            });
        }

        let mut hints: HashMap<String, String> = HashMap::new();
        let mut report = TransferReport::default();

        for chunk in chunks {
            if !chunk.is_pending() {
                report.skipped += 1;
                continue;
            }

            if !hints.contains_key(&chunk.owner_user_id) {
                let hint = self
                    .store
                    .member(&file.trip_id, &chunk.owner_user_id)?
                    .and_then(|m| m.provider)
                    .unwrap_or_else(|| self.default_provider.clone());
                hints.insert(chunk.owner_user_id.clone(), hint);
            }
            let hint = &hints[&chunk.owner_user_id];

            let bytes = chunk_slice(data, &chunk)?;
            let location = match self.transport.push(hint, bytes).await {
                Ok(location) => location,
                Err(source) => {
                    tracing::warn!(
                        "Push of chunk {} ({} bytes) to {} failed: {}",
                        chunk.id,
                        chunk.size_bytes,
                        hint,
                        source
                    );
                    return Err(TransferError::Transport {
                        chunk_id: chunk.id,
                        source,
                    });
                }
            };

            let finalized =
                self.store
                    .finalize_transport(&chunk.id, &location.provider, &location.object_id);
            if let Err(e) = finalized {
                // Nothing references the pushed object any more
                if let Err(discard_err) = self
                    .transport
                    .discard(&location.provider, &location.object_id)
                    .await
                {
                    tracing::warn!(
                        "Failed to discard orphaned object {}/{} of chunk {}: {}",
                        location.provider,
                        location.object_id,
                        chunk.id,
                        discard_err
                    );
                }
                return Err(e.into());
            }
            report.pushed += 1;
        }

        tracing::info!(
            "Transferred virtual file {}: {} chunk(s) pushed, {} already stored",
            file.id,
            report.pushed,
            report.skipped
        );
        Ok(report)
    }
}

/// The bytes of `chunk` within the file payload
fn chunk_slice<'a>(data: &'a [u8], chunk: &FileChunk) -> Result<&'a [u8], StoreError> {
    chunk
        .offset_bytes
        .checked_add(chunk.size_bytes)
        .and_then(|end| data.get(chunk.offset_bytes as usize..end as usize))
        .ok_or_else(|| {
            StoreError::Integrity(format!(
                "chunk {} covers {}+{} bytes of a {} byte payload",
                chunk.id,
                chunk.offset_bytes,
                chunk.size_bytes,
                data.len()
            ))
        })
}
