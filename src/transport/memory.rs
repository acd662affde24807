//! In-process transport, used by tests and local development

use super::{ChunkTransport, ProviderRef, TransportError};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Keeps chunk bytes in memory, keyed by provider and object id
#[derive(Default)]
pub struct MemoryTransport {
    objects: DashMap<(String, String), Vec<u8>>,
    sequence: AtomicU64,
    pushes: AtomicUsize,
    failing_pushes: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` pushes fail with a provider error
    pub fn fail_next_pushes(&self, count: usize) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }

    /// Successful pushes so far
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn contains(&self, provider: &str, object_id: &str) -> bool {
        self.objects
            .contains_key(&(provider.to_string(), object_id.to_string()))
    }

    /// Replace stored bytes in place, for corruption scenarios
    pub fn overwrite(&self, provider: &str, object_id: &str, bytes: Vec<u8>) {
        self.objects
            .insert((provider.to_string(), object_id.to_string()), bytes);
    }
}

#[async_trait]
impl ChunkTransport for MemoryTransport {
    async fn push(&self, provider_hint: &str, bytes: &[u8]) -> Result<ProviderRef, TransportError> {
        let should_fail = self
            .failing_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::Provider(format!(
                "injected push failure at {}",
                provider_hint
            )));
        }

        // Sequence keeps ids unique when two chunks carry identical bytes
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seq.to_le_bytes());
        hasher.update(bytes);
        let object_id = bs58::encode(hasher.finalize().as_bytes()).into_string();

        self.objects
            .insert((provider_hint.to_string(), object_id.clone()), bytes.to_vec());
        self.pushes.fetch_add(1, Ordering::SeqCst);

        Ok(ProviderRef {
            provider: provider_hint.to_string(),
            object_id,
        })
    }

    async fn pull(&self, provider: &str, object_id: &str) -> Result<Vec<u8>, TransportError> {
        self.objects
            .get(&(provider.to_string(), object_id.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::ObjectNotFound {
                provider: provider.to_string(),
                object_id: object_id.to_string(),
            })
    }

    async fn discard(&self, provider: &str, object_id: &str) -> Result<(), TransportError> {
        self.objects
            .remove(&(provider.to_string(), object_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_pull_discard() {
        let transport = MemoryTransport::new();

        let location = transport.push("google_drive", b"chunk bytes").await.unwrap();
        assert_eq!(location.provider, "google_drive");
        assert_eq!(
            transport.pull("google_drive", &location.object_id).await.unwrap(),
            b"chunk bytes".to_vec()
        );

        transport.discard("google_drive", &location.object_id).await.unwrap();
        assert!(matches!(
            transport.pull("google_drive", &location.object_id).await,
            Err(TransportError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_identical_bytes_get_distinct_ids() {
        let transport = MemoryTransport::new();
        let a = transport.push("p", b"same").await.unwrap();
        let b = transport.push("p", b"same").await.unwrap();
        assert_ne!(a.object_id, b.object_id);
        assert_eq!(transport.object_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let transport = MemoryTransport::new();
        transport.fail_next_pushes(1);

        assert!(transport.push("p", b"x").await.is_err());
        assert!(transport.push("p", b"x").await.is_ok());
        assert_eq!(transport.push_count(), 1);
    }
}
