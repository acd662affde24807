//! VirtualFileStore - commit, finalize and delete of virtual files

use super::codec::{
    decode, encode, finish, member_key, trip_file_key, trip_prefix, tx_decode, tx_encode,
    CHUNKS_TREE, FILES_TREE, MEMBERS_TREE, TRIP_FILES_TREE,
};
use super::{DeletedFile, FileChunk, NewVirtualFile, StoreError, VirtualFile, PENDING_PROVIDER};
use crate::ledger::{Member, ReleasePolicy};
use crate::planner::AllocationPlan;
use crate::TripVaultConfig;

use sled::transaction::{abort, ConflictableTransactionError};
use sled::Transactional;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

/// Commit stage at which a test can force the transaction to abort
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFault {
    /// File and chunk rows written, ledger not yet charged
    AfterRows,
    /// Rows and ledger charges written, transaction not yet committed
    AfterCharges,
}

/// Persistent store of members, virtual files and chunks
pub struct VirtualFileStore {
    db: sled::Db,
    members: sled::Tree,
    files: sled::Tree,
    chunks: sled::Tree,
    /// Per-trip index of file ids
    trip_files: sled::Tree,
    release_policy: ReleasePolicy,
    flush_on_write: bool,
    #[cfg(test)]
    fault: Option<CommitFault>,
}

impl VirtualFileStore {
    /// Open (or create) the store described by `config`
    pub fn open(config: &TripVaultConfig) -> Result<Self, StoreError> {
        if !config.temporary {
            std::fs::create_dir_all(&config.data_path)?;
        }

        let db = sled::Config::new()
            .path(&config.data_path)
            .temporary(config.temporary)
            .open()?;

        Ok(Self {
            members: db.open_tree(MEMBERS_TREE)?,
            files: db.open_tree(FILES_TREE)?,
            chunks: db.open_tree(CHUNKS_TREE)?,
            trip_files: db.open_tree(TRIP_FILES_TREE)?,
            db,
            release_policy: config.release_policy,
            flush_on_write: config.flush_on_write,
            #[cfg(test)]
            fault: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, fault: Option<CommitFault>) {
        self.fault = fault;
    }

    #[cfg(test)]
    fn fault_at(
        &self,
        stage: CommitFault,
    ) -> sled::transaction::ConflictableTransactionResult<(), StoreError> {
        if self.fault == Some(stage) {
            return abort(StoreError::Integrity(format!("injected fault at {:?}", stage)));
        }
        Ok(())
    }

    fn maybe_flush(&self) -> Result<(), StoreError> {
        if self.flush_on_write {
            self.db.flush()?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Members
    // ---------------------------------------------------------------------

    /// Add a member to a trip, or update the allocation of an existing one.
    /// Usage and join order of an existing member are kept.
    pub fn upsert_member(
        &self,
        trip_id: &str,
        user_id: &str,
        allocated_bytes: u64,
        provider: Option<&str>,
    ) -> Result<Member, StoreError> {
        let key = member_key(trip_id, user_id);
        let join_seq = self.db.generate_id()?;

        let member = finish(self.members.transaction(|members| {
            let member = match members.get(&key)? {
                Some(raw) => {
                    let mut existing: Member = tx_decode(&raw)?;
                    existing.allocated_bytes = allocated_bytes;
                    if let Some(provider) = provider {
                        existing.provider = Some(provider.to_string());
                    }
                    existing
                }
                None => Member {
                    trip_id: trip_id.to_string(),
                    user_id: user_id.to_string(),
                    join_seq,
                    allocated_bytes,
                    used_bytes: 0,
                    provider: provider.map(str::to_string),
                },
            };
            members.insert(key.as_slice(), tx_encode(&member)?)?;
            Ok(member)
        }))?;

        self.maybe_flush()?;
        tracing::debug!(
            "Member {} of trip {} allocates {} bytes",
            user_id,
            trip_id,
            allocated_bytes
        );
        Ok(member)
    }

    /// Change an existing member's quota ceiling. Lowering it below current
    /// usage is allowed; the member simply stops receiving new chunks.
    pub fn set_allocation(
        &self,
        trip_id: &str,
        user_id: &str,
        allocated_bytes: u64,
    ) -> Result<Member, StoreError> {
        let key = member_key(trip_id, user_id);

        let member = finish(self.members.transaction(|members| {
            let mut member: Member = match members.get(&key)? {
                Some(raw) => tx_decode(&raw)?,
                None => {
                    return abort(StoreError::NotFound(format!(
                        "member {} of trip {}",
                        user_id, trip_id
                    )))
                }
            };
            member.allocated_bytes = allocated_bytes;
            members.insert(key.as_slice(), tx_encode(&member)?)?;
            Ok(member)
        }))?;

        self.maybe_flush()?;
        Ok(member)
    }

    pub fn member(&self, trip_id: &str, user_id: &str) -> Result<Option<Member>, StoreError> {
        match self.members.get(member_key(trip_id, user_id))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Unlocked snapshot of a trip's members, in join order
    pub fn trip_members(&self, trip_id: &str) -> Result<Vec<Member>, StoreError> {
        let mut members = Vec::new();
        for raw in self.members.scan_prefix(trip_prefix(trip_id)).values() {
            members.push(decode::<Member>(&raw?)?);
        }
        members.sort_by_key(|m| m.join_seq);
        Ok(members)
    }

    // ---------------------------------------------------------------------
    // Virtual files
    // ---------------------------------------------------------------------

    /// Apply `plan` for a new file: create the file and its pending chunks and
    /// charge each planned member, all in one transaction.
    ///
    /// Capacity is re-validated against current counters, so a plan built from
    /// a stale snapshot fails with `InsufficientStorage` instead of
    /// overcommitting.
    pub fn commit(
        &self,
        new_file: NewVirtualFile,
        plan: &AllocationPlan,
    ) -> Result<VirtualFile, StoreError> {
        let planned = plan.total_bytes();
        if planned != new_file.size_bytes
            || plan.entries.is_empty()
            || plan.entries.iter().any(|e| e.size_bytes == 0)
        {
            return Err(StoreError::PlanMismatch {
                size: new_file.size_bytes,
                planned,
            });
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let chunk_records: Vec<FileChunk> = plan
            .with_offsets()
            .into_iter()
            .map(|(offset, entry)| FileChunk {
                id: uuid::Uuid::new_v4().to_string(),
                virtual_file_id: file_id.clone(),
                owner_user_id: entry.user_id.clone(),
                provider: PENDING_PROVIDER.to_string(),
                provider_file_id: PENDING_PROVIDER.to_string(),
                offset_bytes: offset,
                size_bytes: entry.size_bytes,
            })
            .collect();

        let file = VirtualFile {
            id: file_id,
            trip_id: new_file.trip_id,
            path: new_file.path,
            size_bytes: new_file.size_bytes,
            checksum: new_file.checksum,
            uploaded_by: new_file.uploaded_by,
            created_at: chrono::Utc::now(),
            chunk_ids: chunk_records.iter().map(|c| c.id.clone()).collect(),
        };

        // A member may appear more than once in a hand-built plan
        let mut charges: BTreeMap<&str, u64> = BTreeMap::new();
        for entry in &plan.entries {
            *charges.entry(entry.user_id.as_str()).or_insert(0) += entry.size_bytes;
        }

        let encoded_file = encode(&file)?;
        let index_key = trip_file_key(&file.trip_id, &file.id);
        let encoded_chunks = chunk_records
            .iter()
            .map(|c| encode(c).map(|bytes| (c.id.as_bytes(), bytes)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        let trees = (&self.members, &self.files, &self.chunks, &self.trip_files);
        finish(trees.transaction(|(members, files, chunks, trip_files)| {
            let mut charged = Vec::with_capacity(charges.len());
            for (user_id, bytes) in &charges {
                let key = member_key(&file.trip_id, user_id);
                let mut member: Member = match members.get(&key)? {
                    Some(raw) => tx_decode(&raw)?,
                    None => {
                        return abort(StoreError::NotFound(format!(
                            "member {} of trip {}",
                            user_id, file.trip_id
                        )))
                    }
                };

                let remaining = member.remaining();
                if remaining < *bytes {
                    return abort(StoreError::InsufficientStorage {
                        user_id: user_id.to_string(),
                        requested: *bytes,
                        remaining,
                    });
                }

                member.charge(*bytes);
                charged.push((key, member));
            }

            files.insert(file.id.as_bytes(), encoded_file.clone())?;
            trip_files.insert(index_key.as_slice(), file.id.as_bytes())?;
            for (chunk_id, encoded) in &encoded_chunks {
                chunks.insert(*chunk_id, encoded.clone())?;
            }

            #[cfg(test)]
            self.fault_at(CommitFault::AfterRows)?;

            for (key, member) in &charged {
                members.insert(key.as_slice(), tx_encode(member)?)?;
            }

            #[cfg(test)]
            self.fault_at(CommitFault::AfterCharges)?;

            Ok(())
        }))?;

        self.maybe_flush()?;
        tracing::info!(
            "Committed virtual file {} ({} bytes) in trip {} as {} chunk(s)",
            file.id,
            file.size_bytes,
            file.trip_id,
            chunk_records.len()
        );
        Ok(file)
    }

    /// Record where a chunk's bytes now live. Re-finalizing overwrites.
    pub fn finalize_transport(
        &self,
        chunk_id: &str,
        provider: &str,
        provider_file_id: &str,
    ) -> Result<FileChunk, StoreError> {
        let (chunk, previous) = finish(self.chunks.transaction(|chunks| {
            let mut chunk: FileChunk = match chunks.get(chunk_id.as_bytes())? {
                Some(raw) => tx_decode(&raw)?,
                None => return abort(StoreError::NotFound(format!("chunk {}", chunk_id))),
            };

            let previous = if chunk.is_pending() {
                None
            } else {
                Some((chunk.provider.clone(), chunk.provider_file_id.clone()))
            };

            chunk.provider = provider.to_string();
            chunk.provider_file_id = provider_file_id.to_string();
            chunks.insert(chunk_id.as_bytes(), tx_encode(&chunk)?)?;
            Ok((chunk, previous))
        }))?;

        self.maybe_flush()?;
        match previous {
            Some((old_provider, old_id)) if old_provider != provider || old_id != provider_file_id => {
                tracing::debug!(
                    "Chunk {} re-finalized: {}/{} -> {}/{}",
                    chunk_id,
                    old_provider,
                    old_id,
                    provider,
                    provider_file_id
                );
            }
            _ => tracing::debug!("Chunk {} stored at {}/{}", chunk_id, provider, provider_file_id),
        }
        Ok(chunk)
    }

    /// Remove a file and its chunks, returning their quota to the owners
    pub fn delete(&self, file_id: &str) -> Result<DeletedFile, StoreError> {
        let policy = self.release_policy;

        let trees = (&self.members, &self.files, &self.chunks, &self.trip_files);
        let deleted = finish(trees.transaction(
            |(members, files, chunks, trip_files)| {
                let file: VirtualFile = match files.get(file_id.as_bytes())? {
                    Some(raw) => tx_decode(&raw)?,
                    None => {
                        return abort(StoreError::NotFound(format!("virtual file {}", file_id)))
                    }
                };

                let mut removed = Vec::with_capacity(file.chunk_ids.len());
                for chunk_id in &file.chunk_ids {
                    match chunks.remove(chunk_id.as_bytes())? {
                        Some(raw) => removed.push(tx_decode::<FileChunk>(&raw)?),
                        None => tracing::warn!("Chunk {} of file {} already gone", chunk_id, file.id),
                    }
                }

                let mut owners: HashMap<&str, Member> = HashMap::new();
                let mut releases = Vec::with_capacity(removed.len());
                for chunk in &removed {
                    let member = match owners.entry(chunk.owner_user_id.as_str()) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => {
                            match members.get(member_key(&file.trip_id, &chunk.owner_user_id))? {
                                Some(raw) => entry.insert(tx_decode(&raw)?),
                                None if policy == ReleasePolicy::Strict => {
                                    return abort(StoreError::Integrity(format!(
                                        "owner {} of chunk {} is no longer in trip {}",
                                        chunk.owner_user_id, chunk.id, file.trip_id
                                    )))
                                }
                                None => {
                                    tracing::warn!(
                                        "Owner {} of chunk {} is no longer in trip {}",
                                        chunk.owner_user_id,
                                        chunk.id,
                                        file.trip_id
                                    );
                                    continue;
                                }
                            }
                        }
                    };

                    let released = member
                        .release(chunk.size_bytes, policy)
                        .map_err(|e| ConflictableTransactionError::Abort(StoreError::Ledger(e)))?;
                    releases.push((chunk.owner_user_id.clone(), released));
                }

                for member in owners.values() {
                    members.insert(
                        member_key(&member.trip_id, &member.user_id),
                        tx_encode(member)?,
                    )?;
                }
                drop(owners);
                files.remove(file_id.as_bytes())?;
                trip_files.remove(trip_file_key(&file.trip_id, &file.id))?;

                Ok(DeletedFile {
                    file,
                    chunks: removed,
                    releases,
                })
            },
        ))?;

        self.maybe_flush()?;
        tracing::info!(
            "Deleted virtual file {} ({} bytes, {} chunk(s))",
            deleted.file.id,
            deleted.file.size_bytes,
            deleted.chunks.len()
        );
        Ok(deleted)
    }

    pub fn virtual_file(&self, file_id: &str) -> Result<Option<VirtualFile>, StoreError> {
        match self.files.get(file_id.as_bytes())? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn chunk(&self, chunk_id: &str) -> Result<Option<FileChunk>, StoreError> {
        match self.chunks.get(chunk_id.as_bytes())? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Consistent read of a file and its chunks, ordered by offset
    pub fn load_with_chunks(
        &self,
        file_id: &str,
    ) -> Result<(VirtualFile, Vec<FileChunk>), StoreError> {
        finish((&self.files, &self.chunks).transaction(|(files, chunks)| {
            let file: VirtualFile = match files.get(file_id.as_bytes())? {
                Some(raw) => tx_decode(&raw)?,
                None => return abort(StoreError::NotFound(format!("virtual file {}", file_id))),
            };

            let mut loaded = Vec::with_capacity(file.chunk_ids.len());
            for chunk_id in &file.chunk_ids {
                match chunks.get(chunk_id.as_bytes())? {
                    Some(raw) => loaded.push(tx_decode::<FileChunk>(&raw)?),
                    None => {
                        return abort(StoreError::Integrity(format!(
                            "chunk {} of file {} is missing",
                            chunk_id, file.id
                        )))
                    }
                }
            }
            loaded.sort_by_key(|c| c.offset_bytes);

            Ok((file, loaded))
        }))
    }

    /// Files of a trip, oldest first
    pub fn list_trip_files(&self, trip_id: &str) -> Result<Vec<VirtualFile>, StoreError> {
        let mut found = Vec::new();
        for file_id in self.trip_files.scan_prefix(trip_prefix(trip_id)).values() {
            // Deleted between the index scan and this read
            if let Some(raw) = self.files.get(file_id?)? {
                found.push(decode::<VirtualFile>(&raw)?);
            }
        }
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.path.cmp(&b.path)));
        Ok(found)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[cfg(test)]
    pub(crate) fn put_member(&self, member: &Member) -> Result<(), StoreError> {
        self.members.insert(
            member_key(&member.trip_id, &member.user_id),
            encode(member)?,
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_chunk(&self, chunk: &FileChunk) -> Result<(), StoreError> {
        self.chunks.insert(chunk.id.as_bytes(), encode(chunk)?)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn remove_member(&self, trip_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.members.remove(member_key(trip_id, user_id))?;
        Ok(())
    }
}
