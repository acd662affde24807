//! Ordered reassembly of virtual files
//!
//! The produced stream is single-pass. Re-reading a file means opening it
//! again, which starts from the first chunk.

use super::ReadError;
use crate::store::{FileChunk, VirtualFileStore};
use crate::transport::ChunkTransport;

use futures::{Stream, TryStreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

/// Chunk payloads of one virtual file, in ascending offset order
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ReadError>> + Send>>;

pub struct ReconstructionReader {
    store: Arc<VirtualFileStore>,
    transport: Arc<dyn ChunkTransport>,
}

struct ReadState {
    transport: Arc<dyn ChunkTransport>,
    file_id: String,
    expected_size: u64,
    chunks: VecDeque<FileChunk>,
    yielded: u64,
}

impl ReconstructionReader {
    pub fn new(store: Arc<VirtualFileStore>, transport: Arc<dyn ChunkTransport>) -> Self {
        Self { store, transport }
    }

    /// Open a virtual file for reading.
    ///
    /// Metadata is loaded eagerly, chunk bytes lazily as the stream is polled.
    pub fn open(&self, file_id: &str) -> Result<ChunkStream, ReadError> {
        let (file, chunks) = self.store.load_with_chunks(file_id)?;

        if chunks.is_empty() {
            return Err(ReadError::Corruption(format!(
                "virtual file {} of {} bytes has no chunks",
                file.id, file.size_bytes
            )));
        }

        tracing::debug!(
            "Reading virtual file {} ({} bytes, {} chunk(s))",
            file.id,
            file.size_bytes,
            chunks.len()
        );

        let state = ReadState {
            transport: Arc::clone(&self.transport),
            file_id: file.id,
            expected_size: file.size_bytes,
            chunks: chunks.into(),
            yielded: 0,
        };

        Ok(Box::pin(futures::stream::try_unfold(state, next_chunk)))
    }

    /// Read a whole virtual file into memory
    pub async fn read_to_end(&self, file_id: &str) -> Result<Vec<u8>, ReadError> {
        let mut stream = self.open(file_id)?;
        let mut data = Vec::new();
        while let Some(bytes) = stream.try_next().await? {
            data.extend_from_slice(&bytes);
        }
        Ok(data)
    }
}

async fn next_chunk(mut state: ReadState) -> Result<Option<(Vec<u8>, ReadState)>, ReadError> {
    let Some(chunk) = state.chunks.pop_front() else {
        if state.yielded != state.expected_size {
            return Err(ReadError::Corruption(format!(
                "virtual file {} reconstructed to {} bytes, expected {}",
                state.file_id, state.yielded, state.expected_size
            )));
        }
        return Ok(None);
    };

    if chunk.offset_bytes != state.yielded {
        return Err(ReadError::Corruption(format!(
            "chunk {} of file {} starts at {} but {} bytes precede it",
            chunk.id, state.file_id, chunk.offset_bytes, state.yielded
        )));
    }

    if chunk.end_bytes() > state.expected_size {
        return Err(ReadError::Corruption(format!(
            "chunk {} of file {} ends at {} beyond file size {}",
            chunk.id,
            state.file_id,
            chunk.end_bytes(),
            state.expected_size
        )));
    }

    if chunk.is_pending() {
        return Err(ReadError::NotTransported(chunk.id));
    }

    let bytes = state
        .transport
        .pull(&chunk.provider, &chunk.provider_file_id)
        .await?;

    if bytes.len() as u64 != chunk.size_bytes {
        return Err(ReadError::Corruption(format!(
            "chunk {} returned {} bytes, expected {}",
            chunk.id,
            bytes.len(),
            chunk.size_bytes
        )));
    }

    state.yielded += chunk.size_bytes;
    Ok(Some((bytes, state)))
}
