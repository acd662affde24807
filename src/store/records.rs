//! Persisted records

use crate::ledger::Released;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider tag and object id of a chunk that is planned but not yet transported
pub const PENDING_PROVIDER: &str = "PENDING";

/// A logical file, physically realized as one or more chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFile {
    /// Unique file ID
    pub id: String,

    /// Trip whose pool holds this file
    pub trip_id: String,

    /// Logical path within the trip
    pub path: String,

    /// Total size (bytes), always > 0
    pub size_bytes: u64,

    /// Optional integrity checksum supplied by the uploader
    pub checksum: Option<String>,

    /// User who uploaded the file
    pub uploaded_by: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Chunk IDs in offset order
    pub chunk_ids: Vec<String>,
}

/// A contiguous byte range of a virtual file, charged to one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub id: String,
    pub virtual_file_id: String,
    /// Member whose quota pays for this chunk
    pub owner_user_id: String,
    /// Backing store tag, `PENDING` until transported
    pub provider: String,
    /// Provider-assigned object ID, `PENDING` until transported
    pub provider_file_id: String,
    pub offset_bytes: u64,
    pub size_bytes: u64,
}

impl FileChunk {
    pub fn is_pending(&self) -> bool {
        self.provider == PENDING_PROVIDER || self.provider_file_id == PENDING_PROVIDER
    }

    /// Exclusive end offset
    pub fn end_bytes(&self) -> u64 {
        self.offset_bytes + self.size_bytes
    }
}

/// Parameters of a file about to be committed
#[derive(Debug, Clone)]
pub struct NewVirtualFile {
    pub trip_id: String,
    pub path: String,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub uploaded_by: String,
}

/// What a delete removed
#[derive(Debug, Clone)]
pub struct DeletedFile {
    pub file: VirtualFile,
    /// Removed chunks, whose provider objects the caller may now discard
    pub chunks: Vec<FileChunk>,
    /// Quota returned to each owning member
    pub releases: Vec<(String, Released)>,
}
