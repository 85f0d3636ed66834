//! fedcore - actor resolution and HTTP-signature federation core
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Resolution Cache                          │
//! │  - reference -> actor ID, TTL, re-read on hit               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Actor Resolver                            │
//! │  - local / remote URL / handle classification               │
//! │  - discovery (actor documents, WebFinger)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - ActorStore (SQLite via sqlx, in-memory)                  │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Signed Delivery Client                       │
//! │  - HTTP Signatures (rsa-sha256), Digest                     │
//! │  - bounded queue + retrying worker pool                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `federation`: keys, signatures, delivery, resolution
//! - `data`: actor models and stores
//! - `config`: Configuration management
//! - `metrics`: Prometheus metrics
//! - `error`: Error types

pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use data::{ActorRecord, ActorStore};
use error::AppError;
use federation::{
    ActorDiscovery, ActorResolver, DeliveryClient, DeliveryObserver, DeliveryQueueReceiver,
    DeliveryTransport, DeliveryWorkerPool, ResolutionCache, ResolutionPolicy,
};

/// Federation services shared across callers
///
/// Cheap to clone; every component is behind an `Arc`.
#[derive(Clone)]
pub struct FederationState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Actor persistence
    pub store: Arc<dyn ActorStore>,

    /// Cached actor resolution
    pub resolution_cache: Arc<ResolutionCache>,

    /// Signed request dispatch
    pub delivery: DeliveryClient,

    transport: Arc<dyn DeliveryTransport>,
}

impl FederationState {
    /// Initialize federation state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build HTTP discovery and transport
    /// 3. Wire resolver, cache and delivery queue
    ///
    /// Returns the queue receiver so the caller decides where delivery
    /// workers run.
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(
        config: config::AppConfig,
    ) -> Result<(Self, DeliveryQueueReceiver), AppError> {
        tracing::info!("Initializing federation state...");

        let store = data::SqliteActorStore::connect(&config.database.path).await?;
        tracing::info!("Database connected");

        let discovery = federation::HttpDiscovery::new(
            &config.delivery.user_agent,
            config.resolution.allow_private_hosts,
        )?;
        let transport = federation::HttpTransport::new()?;

        let parts = Self::with_parts(
            config,
            Arc::new(store),
            Arc::new(discovery),
            Arc::new(transport),
        );
        tracing::info!("Federation state initialized successfully");
        Ok(parts)
    }

    /// Wire state from explicit collaborators.
    pub fn with_parts(
        config: config::AppConfig,
        store: Arc<dyn ActorStore>,
        discovery: Arc<dyn ActorDiscovery>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> (Self, DeliveryQueueReceiver) {
        let resolver = ActorResolver::new(store.clone(), discovery, &config);
        let resolution_cache = ResolutionCache::new(Arc::new(resolver), config.resolution.cache_ttl());

        let (queue, receiver) = federation::delivery_queue(config.delivery.queue_capacity);
        let delivery = DeliveryClient::new(transport.clone(), queue, &config.delivery);

        let state = Self {
            config: Arc::new(config),
            store,
            resolution_cache: Arc::new(resolution_cache),
            delivery,
            transport,
        };
        (state, receiver)
    }

    /// Resolve a reference through the cache.
    pub async fn resolve(
        &self,
        reference: &str,
        policy: &ResolutionPolicy,
    ) -> Result<ActorRecord, AppError> {
        self.resolution_cache.resolve(reference, policy).await
    }

    /// Start the delivery worker pool on the current runtime.
    pub fn spawn_delivery_workers(
        &self,
        receiver: DeliveryQueueReceiver,
        observer: Arc<dyn DeliveryObserver>,
    ) -> DeliveryWorkerPool {
        DeliveryWorkerPool::spawn(
            receiver,
            self.transport.clone(),
            observer,
            &self.config.delivery,
        )
    }
}
