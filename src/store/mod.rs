//! Virtual File Store - VirtualFile/FileChunk records and quota bookkeeping
//!
//! Every read-validate-write sequence over member counters runs inside a sled
//! multi-tree transaction, so concurrent commits and deletes against the same
//! members are serialized and re-validated against fresh counters.

mod codec;
mod records;
mod virtual_files;

pub use records::{DeletedFile, FileChunk, NewVirtualFile, VirtualFile, PENDING_PROVIDER};
pub use virtual_files::VirtualFileStore;

use crate::ledger::LedgerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Insufficient storage on member {user_id}: needs {requested} bytes, {remaining} free")]
    InsufficientStorage {
        user_id: String,
        requested: u64,
        remaining: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Plan covers {planned} bytes but file is {size} bytes")]
    PlanMismatch { size: u64, planned: u64 },

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
