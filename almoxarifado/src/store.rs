//! Cautela persistence.
//!
//! The custody service only talks to storage through [`CautelaStore`];
//! [`InMemoryCautelaStore`] backs tests and single-process deployments.

use async_trait::async_trait;
use custody_policy::ActorId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{Cautela, CautelaStatus};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Cautela {0} not found")]
    NotFound(Uuid),

    #[error("Cautela {0} already exists")]
    AlreadyExists(Uuid),

    /// Optimistic concurrency check failed
    #[error("Cautela {id} was modified concurrently (expected rev {expected}, found {found})")]
    Conflict { id: Uuid, expected: u32, found: u32 },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persistence for cautela records.
#[async_trait]
pub trait CautelaStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, cautela: Cautela) -> Result<(), StoreError>;

    /// Fetch a record by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Cautela>, StoreError>;

    /// Replace a record if its `rev` matches the stored one.
    ///
    /// Returns the stored record with `rev` incremented.
    async fn update(&self, cautela: Cautela) -> Result<Cautela, StoreError>;

    /// Every record for a requester, newest first.
    async fn list_for_requester(&self, requester: &ActorId) -> Result<Vec<Cautela>, StoreError>;

    /// Every record in a status, newest first.
    async fn list_by_status(&self, status: CautelaStatus) -> Result<Vec<Cautela>, StoreError>;
}

/// In-process store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCautelaStore {
    cautelas: Arc<RwLock<HashMap<Uuid, Cautela>>>,
}

impl InMemoryCautelaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(mut cautelas: Vec<Cautela>) -> Vec<Cautela> {
        cautelas.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        cautelas
    }
}

#[async_trait]
impl CautelaStore for InMemoryCautelaStore {
    async fn insert(&self, cautela: Cautela) -> Result<(), StoreError> {
        let mut cautelas = self.cautelas.write().await;
        if cautelas.contains_key(&cautela.id) {
            return Err(StoreError::AlreadyExists(cautela.id));
        }
        cautelas.insert(cautela.id, cautela);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Cautela>, StoreError> {
        Ok(self.cautelas.read().await.get(&id).cloned())
    }

    async fn update(&self, mut cautela: Cautela) -> Result<Cautela, StoreError> {
        let mut cautelas = self.cautelas.write().await;
        let stored = cautelas
            .get_mut(&cautela.id)
            .ok_or(StoreError::NotFound(cautela.id))?;

        if stored.rev != cautela.rev {
            return Err(StoreError::Conflict {
                id: cautela.id,
                expected: cautela.rev,
                found: stored.rev,
            });
        }

        cautela.rev += 1;
        *stored = cautela.clone();
        Ok(cautela)
    }

    async fn list_for_requester(&self, requester: &ActorId) -> Result<Vec<Cautela>, StoreError> {
        let cautelas = self.cautelas.read().await;
        Ok(Self::newest_first(
            cautelas
                .values()
                .filter(|c| &c.requester.id == requester)
                .cloned()
                .collect(),
        ))
    }

    async fn list_by_status(&self, status: CautelaStatus) -> Result<Vec<Cautela>, StoreError> {
        let cautelas = self.cautelas.read().await;
        Ok(Self::newest_first(
            cautelas
                .values()
                .filter(|c| c.status == status)
                .cloned()
                .collect(),
        ))
    }
}
