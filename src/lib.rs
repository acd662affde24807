//! TripVault Core - pooled-quota chunk storage
//!
//! Trip members pool their individually quota-limited cloud storage into one
//! shared space. Each uploaded file becomes a virtual file split into chunks,
//! each chunk charged against one member's quota, and streamed back out in
//! offset order.

pub mod ledger;
pub mod planner;
pub mod reader;
pub mod store;
pub mod transfer;
pub mod transport;

use ledger::{Member, ReleasePolicy, TripQuotaSummary};
use planner::{ChunkPlanner, PlanError};
use reader::{ChunkStream, ReadError, ReconstructionReader};
use store::{NewVirtualFile, StoreError, VirtualFile, VirtualFileStore};
use transfer::{ChunkTransfer, TransferError, TransferReport};
use transport::{ChunkTransport, TransportError};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Main error type for TripVault operations
#[derive(Error, Debug)]
pub enum TripVaultError {
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TripVaultError {
    /// The trip does not have enough free quota. Expected and user-facing:
    /// the caller may retry after space is freed.
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            TripVaultError::Plan(PlanError::NoCapacity)
                | TripVaultError::Plan(PlanError::InsufficientPooledCapacity { .. })
                | TripVaultError::Store(StoreError::InsufficientStorage { .. })
        )
    }

    /// Internal invariant broken or stored data inconsistent. Never retried.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            TripVaultError::Plan(PlanError::PlanIntegrity { .. })
                | TripVaultError::Store(StoreError::Integrity(_))
                | TripVaultError::Store(StoreError::PlanMismatch { .. })
                | TripVaultError::Store(StoreError::Ledger(_))
                | TripVaultError::Read(ReadError::Corruption(_))
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TripVaultError::Store(StoreError::NotFound(_)) | TripVaultError::Read(ReadError::NotFound(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, TripVaultError>;

/// Core configuration for a TripVault instance
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TripVaultConfig {
    /// Directory of the metadata database
    pub data_path: PathBuf,

    /// Discard the database when the store is dropped
    pub temporary: bool,

    /// Behavior when a quota release would underflow
    pub release_policy: ReleasePolicy,

    /// Provider hint for members without a linked cloud account
    pub default_provider: String,

    /// Flush the database after every write
    pub flush_on_write: bool,
}

impl Default for TripVaultConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./tripvault_data"),
            temporary: false,
            release_policy: ReleasePolicy::Clamp,
            default_provider: "google_drive".to_string(),
            flush_on_write: false,
        }
    }
}

impl TripVaultConfig {
    /// Load a JSON config; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| TripVaultError::Config(e.to_string()))
    }
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, falling back to
/// `default_filter`. Does nothing if one is already installed.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Entry point for the HTTP/CRUD layer
pub struct TripVault {
    config: TripVaultConfig,
    store: Arc<VirtualFileStore>,
    transport: Arc<dyn ChunkTransport>,
    reader: ReconstructionReader,
    transfer: ChunkTransfer,
}

impl TripVault {
    pub fn new(config: TripVaultConfig, transport: Arc<dyn ChunkTransport>) -> Result<Self> {
        let store = Arc::new(VirtualFileStore::open(&config)?);
        let reader = ReconstructionReader::new(Arc::clone(&store), Arc::clone(&transport));
        let transfer = ChunkTransfer::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            config.default_provider.clone(),
        );

        tracing::info!("Opened TripVault store at {}", config.data_path.display());

        Ok(Self {
            config,
            store,
            transport,
            reader,
            transfer,
        })
    }

    pub fn config(&self) -> &TripVaultConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<VirtualFileStore> {
        &self.store
    }

    // ---------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------

    pub fn upsert_member(
        &self,
        trip_id: &str,
        user_id: &str,
        allocated_bytes: u64,
        provider: Option<&str>,
    ) -> Result<Member> {
        Ok(self
            .store
            .upsert_member(trip_id, user_id, allocated_bytes, provider)?)
    }

    pub fn set_allocation(&self, trip_id: &str, user_id: &str, allocated_bytes: u64) -> Result<Member> {
        Ok(self.store.set_allocation(trip_id, user_id, allocated_bytes)?)
    }

    pub fn member(&self, trip_id: &str, user_id: &str) -> Result<Option<Member>> {
        Ok(self.store.member(trip_id, user_id)?)
    }

    pub fn trip_summary(&self, trip_id: &str) -> Result<TripQuotaSummary> {
        let members = self.store.trip_members(trip_id)?;
        Ok(TripQuotaSummary::from_members(trip_id, &members))
    }

    pub fn list_trip_files(&self, trip_id: &str) -> Result<Vec<VirtualFile>> {
        Ok(self.store.list_trip_files(trip_id)?)
    }

    // ---------------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------------

    /// Plan a file against an unlocked quota snapshot and commit it.
    /// The commit re-validates capacity, so a racing upload surfaces as
    /// `InsufficientStorage` rather than an overcommitted member.
    pub fn plan_and_commit(
        &self,
        trip_id: &str,
        uploader_id: &str,
        path: &str,
        size_bytes: u64,
        checksum: Option<&str>,
    ) -> Result<VirtualFile> {
        let snapshot = self.store.trip_members(trip_id)?;
        let plan = ChunkPlanner::plan(&snapshot, size_bytes)?;

        tracing::debug!(
            "Planned {} bytes for {} in trip {} across {} member(s)",
            size_bytes,
            path,
            trip_id,
            plan.entries.len()
        );

        let file = self.store.commit(
            NewVirtualFile {
                trip_id: trip_id.to_string(),
                path: path.to_string(),
                size_bytes,
                checksum: checksum.map(str::to_string),
                uploaded_by: uploader_id.to_string(),
            },
            &plan,
        )?;
        Ok(file)
    }

    pub fn finalize_chunk_transport(
        &self,
        chunk_id: &str,
        provider: &str,
        provider_object_id: &str,
    ) -> Result<()> {
        self.store
            .finalize_transport(chunk_id, provider, provider_object_id)?;
        Ok(())
    }

    /// Push the pending chunks of a committed file. Safe to call again after
    /// a failure; finalized chunks are skipped.
    pub async fn transport_file(&self, file_id: &str, data: &[u8]) -> Result<TransferReport> {
        Ok(self.transfer.push_file(file_id, data).await?)
    }

    /// Commit `data` as a new virtual file and push its chunks.
    ///
    /// If the push fails the reservation stands; finish it with
    /// `transport_file`.
    pub async fn upload(
        &self,
        trip_id: &str,
        uploader_id: &str,
        path: &str,
        data: &[u8],
        checksum: Option<&str>,
    ) -> Result<VirtualFile> {
        let file = self.plan_and_commit(trip_id, uploader_id, path, data.len() as u64, checksum)?;
        self.transport_file(&file.id, data).await?;
        Ok(file)
    }

    /// Delete a file and return its quota. Provider objects are discarded
    /// afterwards on a best-effort basis.
    pub async fn delete_virtual_file(&self, file_id: &str) -> Result<()> {
        let deleted = self.store.delete(file_id)?;

        for chunk in deleted.chunks.iter().filter(|c| !c.is_pending()) {
            if let Err(e) = self
                .transport
                .discard(&chunk.provider, &chunk.provider_file_id)
                .await
            {
                tracing::warn!(
                    "Failed to discard chunk {} at {}/{}: {}",
                    chunk.id,
                    chunk.provider,
                    chunk.provider_file_id,
                    e
                );
            }
        }
        Ok(())
    }

    pub fn open_for_read(&self, file_id: &str) -> Result<ChunkStream> {
        Ok(self.reader.open(file_id)?)
    }

    pub async fn read_to_end(&self, file_id: &str) -> Result<Vec<u8>> {
        Ok(self.reader.read_to_end(file_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;
    use crate::transport::MemoryTransport;

    fn create_vault(dir: &TempDir) -> (TripVault, Arc<MemoryTransport>) {
        init_tracing("warn");
        let config = TripVaultConfig {
            data_path: dir.path().join("vault"),
            ..Default::default()
        };
        let transport = Arc::new(MemoryTransport::new());
        let vault = TripVault::new(config, transport.clone()).unwrap();
        (vault, transport)
    }

    fn used(vault: &TripVault, user: &str) -> u64 {
        vault.member("trip", user).unwrap().unwrap().used_bytes
    }

    #[tokio::test]
    async fn test_upload_read_delete_cycle() {
        let dir = TempDir::new().unwrap();
        let (vault, transport) = create_vault(&dir);
        vault.upsert_member("trip", "a", 40, Some("google_drive")).unwrap();
        vault.upsert_member("trip", "b", 15, None).unwrap();

        let data: Vec<u8> = (0..55).map(|i| (i * 7 % 256) as u8).collect();
        let file = vault
            .upload("trip", "a", "/trip/map.pdf", &data, None)
            .await
            .unwrap();
        assert_eq!(used(&vault, "a"), 40);
        assert_eq!(used(&vault, "b"), 15);
        assert_eq!(transport.object_count(), 2);

        let parts: Vec<Vec<u8>> = vault.open_for_read(&file.id).unwrap().try_collect().await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.concat(), data);

        vault.delete_virtual_file(&file.id).await.unwrap();
        assert_eq!(used(&vault, "a"), 0);
        assert_eq!(used(&vault, "b"), 0);
        assert_eq!(transport.object_count(), 0);

        let err = vault.open_for_read(&file.id).err().unwrap();
        assert!(err.is_not_found());
        let err = vault.delete_virtual_file(&file.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_scenario_single_owner() {
        let dir = TempDir::new().unwrap();
        let (vault, _) = create_vault(&dir);
        vault.upsert_member("trip", "m1", 100, None).unwrap();
        vault.upsert_member("trip", "m2", 50, None).unwrap();
        vault.upsert_member("trip", "m3", 10, None).unwrap();

        let file = vault.plan_and_commit("trip", "m2", "/a.bin", 60, None).unwrap();
        assert_eq!(file.chunk_ids.len(), 1);
        assert_eq!(used(&vault, "m1"), 60);
        assert_eq!(used(&vault, "m2"), 0);
        assert_eq!(used(&vault, "m3"), 0);
    }

    #[tokio::test]
    async fn test_scenario_insufficient_pool() {
        let dir = TempDir::new().unwrap();
        let (vault, _) = create_vault(&dir);
        vault.upsert_member("trip", "m1", 30, None).unwrap();
        vault.upsert_member("trip", "m2", 10, None).unwrap();

        // Bring usage to (25, 10)
        vault.plan_and_commit("trip", "m1", "/x", 25, None).unwrap();
        vault.plan_and_commit("trip", "m1", "/y", 10, None).unwrap();
        assert_eq!(used(&vault, "m1"), 25);
        assert_eq!(used(&vault, "m2"), 10);

        let err = vault.plan_and_commit("trip", "m1", "/z", 50, None).unwrap_err();
        assert!(matches!(
            err,
            TripVaultError::Plan(PlanError::InsufficientPooledCapacity { requested: 50, available: 5 })
        ));
        assert!(err.is_capacity_error());
        assert!(!err.is_integrity_error());

        vault.set_allocation("trip", "m1", 25).unwrap();
        let err = vault.plan_and_commit("trip", "m1", "/z", 1, None).unwrap_err();
        assert!(matches!(err, TripVaultError::Plan(PlanError::NoCapacity)));
        assert!(err.is_capacity_error());
    }

    #[tokio::test]
    async fn test_corruption_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let (vault, transport) = create_vault(&dir);
        vault.upsert_member("trip", "m1", 100, None).unwrap();

        let file = vault.upload("trip", "m1", "/c", b"hello", None).await.unwrap();
        let chunk = vault.store().chunk(&file.chunk_ids[0]).unwrap().unwrap();
        transport.overwrite(&chunk.provider, &chunk.provider_file_id, b"hello world".to_vec());

        let err = vault.read_to_end(&file.id).await.unwrap_err();
        assert!(err.is_integrity_error());
        assert!(!err.is_capacity_error());
    }

    #[tokio::test]
    async fn test_failed_transport_keeps_reservation() {
        let dir = TempDir::new().unwrap();
        let (vault, transport) = create_vault(&dir);
        vault.upsert_member("trip", "m1", 100, None).unwrap();

        transport.fail_next_pushes(1);
        let err = vault.upload("trip", "m1", "/d", b"payload", None).await.unwrap_err();
        assert!(matches!(err, TripVaultError::Transfer(_)));
        assert_eq!(used(&vault, "m1"), 7);

        let files = vault.list_trip_files("trip").unwrap();
        assert_eq!(files.len(), 1);
        let report = vault.transport_file(&files[0].id, b"payload").await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(vault.read_to_end(&files[0].id).await.unwrap(), b"payload".to_vec());
    }

    #[tokio::test]
    async fn test_manual_finalize() {
        let dir = TempDir::new().unwrap();
        let (vault, transport) = create_vault(&dir);
        vault.upsert_member("trip", "m1", 100, None).unwrap();

        let file = vault.plan_and_commit("trip", "m1", "/e", 3, None).unwrap();
        let location = transport.push("dropbox", b"abc").await.unwrap();
        vault
            .finalize_chunk_transport(&file.chunk_ids[0], &location.provider, &location.object_id)
            .unwrap();

        assert_eq!(vault.read_to_end(&file.id).await.unwrap(), b"abc".to_vec());
    }

    #[test]
    fn test_trip_summary() {
        let dir = TempDir::new().unwrap();
        let (vault, _) = create_vault(&dir);
        vault.upsert_member("trip", "m1", 30, None).unwrap();
        vault.upsert_member("trip", "m2", 20, None).unwrap();
        vault.plan_and_commit("trip", "m1", "/f", 35, None).unwrap();

        let summary = vault.trip_summary("trip").unwrap();
        assert_eq!(summary.member_count, 2);
        assert_eq!(summary.total_allocated, 50);
        assert_eq!(summary.total_used, 35);
        assert_eq!(summary.total_free, 15);
        assert_eq!(summary.largest_free_slot, 15);
    }

    #[test]
    fn test_config_from_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "data_path": "/var/lib/tripvault", "release_policy": "strict" }"#,
        )
        .unwrap();

        let config = TripVaultConfig::from_json_file(&path).unwrap();
        assert_eq!(config.data_path, PathBuf::from("/var/lib/tripvault"));
        assert_eq!(config.release_policy, ReleasePolicy::Strict);
        assert_eq!(config.default_provider, "google_drive");
        assert!(!config.flush_on_write);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            TripVaultConfig::from_json_file(&path),
            Err(TripVaultError::Config(_))
        ));
    }
}
