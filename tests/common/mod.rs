//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use fedcore::data::{ActorKind, SqliteActorStore};
use fedcore::error::AppError;
use fedcore::federation::{
    ActorDiscovery, ActorDocument, ActorEndpoints, DeliveryQueueReceiver, DeliveryTransport,
    DocumentPublicKey, KeyPair, SignedMessage, classify_status, generate_keypair,
};
use fedcore::{FederationState, config};
use tempfile::TempDir;
use url::Url;

pub const LOCAL_DOMAIN: &str = "test.example.com";

/// One keypair per test binary
pub fn test_keypair() -> &'static KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair().unwrap())
}

/// Create test configuration
pub fn test_config(db_path: std::path::PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            domain: LOCAL_DOMAIN.to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig { path: db_path },
        resolution: config::ResolutionConfig {
            cache_ttl_seconds: 3600,
            fetch_timeout_seconds: 5,
            blocked_instances: vec!["blocked.example".to_string()],
            allow_private_hosts: false,
        },
        delivery: config::DeliveryConfig {
            queue_capacity: 16,
            workers: 2,
            max_concurrent: 4,
            max_attempts: 3,
            base_delay_ms: 5,
            max_delay_ms: 50,
            request_timeout_seconds: 5,
            user_agent: config::default_user_agent(),
        },
        keys: config::KeyConfig { rsa_bits: 2048 },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Actor document as a remote server would publish it
pub fn actor_document(actor_type: &str, host: &str, path: &str, name: &str) -> ActorDocument {
    let id = format!("https://{}/{}/{}", host, path, name);
    ActorDocument {
        id: id.clone(),
        actor_type: actor_type.to_string(),
        preferred_username: Some(name.to_string()),
        name: Some(name.to_string()),
        inbox: Some(format!("{}/inbox", id)),
        endpoints: Some(ActorEndpoints {
            shared_inbox: Some(format!("https://{}/inbox", host)),
        }),
        public_key: Some(DocumentPublicKey {
            id: format!("{}#main-key", id),
            owner: Some(id),
            public_key_pem: test_keypair().public_key_pem.clone(),
        }),
        manually_approves_followers: false,
    }
}

/// In-process stand-in for remote servers
#[derive(Default)]
pub struct FakeDiscovery {
    documents: Mutex<HashMap<String, ActorDocument>>,
    webfinger: Mutex<HashMap<(String, Option<ActorKind>), String>>,
    pub fetch_calls: AtomicUsize,
    pub webfinger_calls: AtomicUsize,
}

impl FakeDiscovery {
    pub fn add_actor(&self, document: ActorDocument) {
        self.documents
            .lock()
            .unwrap()
            .insert(document.id.clone(), document);
    }

    pub fn add_webfinger(&self, name: &str, host: &str, actor_url: &str) {
        self.add_typed_webfinger(name, host, None, actor_url);
    }

    /// Webfinger link advertised for one kind, like servers that publish a
    /// user and a community under one name
    pub fn add_typed_webfinger(
        &self,
        name: &str,
        host: &str,
        kind: Option<ActorKind>,
        actor_url: &str,
    ) {
        self.webfinger
            .lock()
            .unwrap()
            .insert((format!("{}@{}", name, host), kind), actor_url.to_string());
    }

    pub fn webfingers(&self) -> usize {
        self.webfinger_calls.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActorDiscovery for FakeDiscovery {
    async fn fetch_actor_document(
        &self,
        url: &Url,
        _timeout: Duration,
    ) -> Result<ActorDocument, AppError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        // Give concurrent resolvers a chance to interleave.
        tokio::task::yield_now().await;

        self.documents
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| AppError::RemoteFetch {
                transient: false,
                message: format!("Connection failed: {}", url),
            })
    }

    async fn webfinger(
        &self,
        name: &str,
        host: &str,
        kind: Option<ActorKind>,
        _timeout: Duration,
    ) -> Result<Url, AppError> {
        self.webfinger_calls.fetch_add(1, Ordering::SeqCst);
        let handle = format!("{}@{}", name, host);
        let links = self.webfinger.lock().unwrap();
        let href = links
            .get(&(handle.clone(), kind))
            .or_else(|| links.get(&(handle, None)))
            .cloned()
            .ok_or_else(|| AppError::RemoteFetch {
                transient: false,
                message: "HTTP 404 Not Found".to_string(),
            })?;
        Url::parse(&href).map_err(|e| AppError::MalformedDocument(e.to_string()))
    }
}

/// Records every message and answers with a fixed status
pub struct RecordingTransport {
    pub sent: Mutex<Vec<SignedMessage>>,
    status: u16,
}

impl RecordingTransport {
    pub fn new(status: u16) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            status,
        }
    }

    pub fn sent(&self) -> Vec<SignedMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    async fn send(&self, message: &SignedMessage) -> Result<u16, AppError> {
        self.sent.lock().unwrap().push(message.clone());
        classify_status(self.status)
    }
}

/// Federation state over a temporary SQLite database
pub struct TestFederation {
    pub state: FederationState,
    pub receiver: Option<DeliveryQueueReceiver>,
    pub store: Arc<SqliteActorStore>,
    pub discovery: Arc<FakeDiscovery>,
    pub transport: Arc<RecordingTransport>,
    pub _temp_dir: TempDir,
}

impl TestFederation {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path().join("test.db"));
        adjust(&mut config);

        let store = Arc::new(SqliteActorStore::connect(&config.database.path).await.unwrap());
        let discovery = Arc::new(FakeDiscovery::default());
        let transport = Arc::new(RecordingTransport::new(202));

        let (state, receiver) = FederationState::with_parts(
            config,
            store.clone(),
            discovery.clone(),
            transport.clone(),
        );

        Self {
            state,
            receiver: Some(receiver),
            store,
            discovery,
            transport,
            _temp_dir: temp_dir,
        }
    }
}
