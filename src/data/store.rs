//! Actor persistence interface
//!
//! The federation core never owns actor rows. It reads them through
//! [`ActorStore`] and asks the store to create remote actors, relying on the
//! store's uniqueness guarantee on the canonical ActivityPub ID.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::models::*;
use crate::error::AppError;

/// Persistence collaborator for actor records
#[async_trait]
pub trait ActorStore: Send + Sync {
    /// Local actor by kind and name (names compare case-insensitively)
    async fn find_local_actor(
        &self,
        kind: ActorKind,
        name: &str,
    ) -> Result<Option<ActorRecord>, AppError>;

    /// Remote actor by canonical ActivityPub ID
    async fn find_remote_actor(&self, ap_id: &str) -> Result<Option<ActorRecord>, AppError>;

    /// Remote actor by `name@host`.
    ///
    /// A user and a community on one host may share a name; `kind` narrows
    /// the match. With `None` the earliest stored match is returned.
    async fn find_remote_actor_by_handle(
        &self,
        name: &str,
        host: &str,
        kind: Option<ActorKind>,
    ) -> Result<Option<ActorRecord>, AppError>;

    /// Persist a remote actor.
    ///
    /// Must be idempotent on `ap_id`: when a row with the same canonical ID
    /// already exists (including one inserted concurrently), that row is
    /// returned and no duplicate is created.
    async fn create_remote_actor(&self, actor: &NewRemoteActor) -> Result<ActorRecord, AppError>;

    /// Any actor by ID
    async fn find_by_id(&self, id: &ActorId) -> Result<Option<ActorRecord>, AppError>;
}

/// In-memory actor store
///
/// Used by tests and by tools that do not need durable state.
#[derive(Default)]
pub struct MemoryActorStore {
    actors: RwLock<HashMap<ActorId, ActorRecord>>,
}

impl MemoryActorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local actor (normally done by account registration).
    pub async fn insert_local_actor(
        &self,
        kind: ActorKind,
        name: &str,
        public_key: Option<PublicKeyMaterial>,
    ) -> ActorRecord {
        let record = ActorRecord {
            id: ActorId::new(),
            kind,
            name: name.to_string(),
            home: ActorHome::Local,
            ap_id: None,
            inbox: None,
            shared_inbox: None,
            public_key,
            private: false,
            created_at: Utc::now(),
        };
        self.actors
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }

    /// Remove an actor; returns whether it existed.
    pub async fn delete(&self, id: &ActorId) -> bool {
        self.actors.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.actors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actors.read().await.is_empty()
    }
}

#[async_trait]
impl ActorStore for MemoryActorStore {
    async fn find_local_actor(
        &self,
        kind: ActorKind,
        name: &str,
    ) -> Result<Option<ActorRecord>, AppError> {
        let actors = self.actors.read().await;
        Ok(actors
            .values()
            .find(|a| a.is_local() && a.kind == kind && a.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn find_remote_actor(&self, ap_id: &str) -> Result<Option<ActorRecord>, AppError> {
        let actors = self.actors.read().await;
        Ok(actors
            .values()
            .find(|a| a.ap_id.as_deref() == Some(ap_id))
            .cloned())
    }

    async fn find_remote_actor_by_handle(
        &self,
        name: &str,
        host: &str,
        kind: Option<ActorKind>,
    ) -> Result<Option<ActorRecord>, AppError> {
        let actors = self.actors.read().await;
        Ok(actors
            .values()
            .filter(|a| {
                matches!(&a.home, ActorHome::Remote(h) if h.eq_ignore_ascii_case(host))
                    && a.name.eq_ignore_ascii_case(name)
                    && kind.is_none_or(|k| a.kind == k)
            })
            .min_by_key(|a| a.created_at)
            .cloned())
    }

    async fn create_remote_actor(&self, actor: &NewRemoteActor) -> Result<ActorRecord, AppError> {
        // Check and insert under one write lock so concurrent creators agree.
        let mut actors = self.actors.write().await;
        if let Some(existing) = actors
            .values()
            .find(|a| a.ap_id.as_deref() == Some(actor.ap_id.as_str()))
        {
            return Ok(existing.clone());
        }

        let record = ActorRecord {
            id: ActorId::new(),
            kind: actor.kind,
            name: actor.name.clone(),
            home: ActorHome::Remote(actor.domain.clone()),
            ap_id: Some(actor.ap_id.clone()),
            inbox: Some(actor.inbox.clone()),
            shared_inbox: actor.shared_inbox.clone(),
            public_key: Some(actor.public_key.clone()),
            private: actor.private,
            created_at: Utc::now(),
        };
        actors.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: &ActorId) -> Result<Option<ActorRecord>, AppError> {
        Ok(self.actors.read().await.get(id).cloned())
    }
}
