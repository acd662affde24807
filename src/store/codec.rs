//! Record encoding and key layout for the sled trees

use super::StoreError;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};

pub(super) const MEMBERS_TREE: &str = "members";
pub(super) const FILES_TREE: &str = "virtual_files";
pub(super) const CHUNKS_TREE: &str = "file_chunks";
pub(super) const TRIP_FILES_TREE: &str = "trip_files";

const KEY_SEPARATOR: char = '\u{0}';

/// Members are keyed `trip_id \0 user_id` so a trip's members share a prefix
pub(super) fn member_key(trip_id: &str, user_id: &str) -> Vec<u8> {
    format!("{}{}{}", trip_id, KEY_SEPARATOR, user_id).into_bytes()
}

/// Index entries are keyed `trip_id \0 file_id`
pub(super) fn trip_file_key(trip_id: &str, file_id: &str) -> Vec<u8> {
    format!("{}{}{}", trip_id, KEY_SEPARATOR, file_id).into_bytes()
}

pub(super) fn trip_prefix(trip_id: &str) -> Vec<u8> {
    format!("{}{}", trip_id, KEY_SEPARATOR).into_bytes()
}

pub(super) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(super) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Encode inside a transaction, aborting it on failure
pub(super) fn tx_encode<T: Serialize>(
    value: &T,
) -> Result<Vec<u8>, ConflictableTransactionError<StoreError>> {
    encode(value).map_err(ConflictableTransactionError::Abort)
}

/// Decode inside a transaction, aborting it on failure
pub(super) fn tx_decode<T: DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, ConflictableTransactionError<StoreError>> {
    decode(bytes).map_err(ConflictableTransactionError::Abort)
}

/// Flatten a transaction outcome into a store result
pub(super) fn finish<T>(result: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(StoreError::Database(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_keys_share_trip_prefix() {
        let key = member_key("trip-1", "alice");
        assert!(key.starts_with(&trip_prefix("trip-1")));
        assert!(!key.starts_with(&trip_prefix("trip-")));
    }

    #[test]
    fn test_trip_file_keys_share_trip_prefix() {
        let key = trip_file_key("trip-1", "file-a");
        assert!(key.starts_with(&trip_prefix("trip-1")));
        assert!(!trip_file_key("trip-10", "file-a").starts_with(&trip_prefix("trip-1")));
    }
}
