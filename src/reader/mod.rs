//! Reconstruction Reader - streams a virtual file back out in offset order

mod reconstruct;

pub use reconstruct::{ChunkStream, ReconstructionReader};

use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupted virtual file: {0}")]
    Corruption(String),

    #[error("Chunk {0} has not been transported yet")]
    NotTransported(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ReadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ReadError::NotFound(what),
            StoreError::Integrity(msg) => ReadError::Corruption(msg),
            other => ReadError::Store(other),
        }
    }
}
