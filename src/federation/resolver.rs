//! Actor reference resolver
//!
//! Turns a reference string into a stored actor record. Remote actors are
//! discovered and persisted on demand; local actors are only ever looked up.
//!
//! Resolution order for each reference shape:
//! 1. Local URL: store lookup by kind and name
//! 2. Remote URL: store lookup by canonical URL, then fetch + validate + create
//! 3. Handle: local kinds in turn when the host is ours, otherwise store
//!    lookup by handle and kind, then webfinger and continue as a remote URL
//!
//! A user and a community may share a name on one host. The kind filter, or
//! failing that the handle's sigil, decides which one a handle means. `!` only
//! ever names communities and is binding; `@` is used for every kind of actor
//! by some servers and only orders the candidates.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use super::discovery::ActorDiscovery;
use super::reference::ActorReference;
use crate::config::AppConfig;
use crate::data::{ActorKind, ActorRecord, ActorStore};
use crate::error::AppError;
use crate::metrics;

/// Restricts which actor kinds a resolution may return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KindFilter {
    #[default]
    Any,
    CommunityOnly,
    FeedOnly,
}

impl KindFilter {
    pub fn accepts(&self, kind: ActorKind) -> bool {
        match self {
            Self::Any => true,
            Self::CommunityOnly => kind == ActorKind::Community,
            Self::FeedOnly => kind == ActorKind::Feed,
        }
    }

    /// The only kind this filter lets through, if it names one
    pub fn required_kind(&self) -> Option<ActorKind> {
        match self {
            Self::Any => None,
            Self::CommunityOnly => Some(ActorKind::Community),
            Self::FeedOnly => Some(ActorKind::Feed),
        }
    }
}

/// Kind a handle must resolve to, from the filter or a `!` sigil
fn required_handle_kind(filter: KindFilter, hint: Option<ActorKind>) -> Option<ActorKind> {
    filter
        .required_kind()
        .or(hint.filter(|kind| *kind == ActorKind::Community))
}

/// Kinds to try for a handle, most wanted first
fn candidate_kinds(filter: KindFilter, hint: Option<ActorKind>) -> Vec<ActorKind> {
    if let Some(kind) = required_handle_kind(filter, hint) {
        return vec![kind];
    }
    let mut kinds = vec![ActorKind::User, ActorKind::Community, ActorKind::Feed];
    if let Some(hint) = hint {
        kinds.retain(|k| *k != hint);
        kinds.insert(0, hint);
    }
    kinds
}

/// Per-call resolution options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionPolicy {
    /// Discover and persist remote actors that are not stored yet
    pub create_if_not_found: bool,
    pub filter: KindFilter,
    /// Overrides the configured fetch timeout
    pub timeout: Option<Duration>,
}

impl ResolutionPolicy {
    /// Store lookups only; never touches the network.
    pub fn lookup_only() -> Self {
        Self::default()
    }

    pub fn create_if_not_found() -> Self {
        Self {
            create_if_not_found: true,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: KindFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Resolves references against the store, discovering remote actors
pub struct ActorResolver {
    store: Arc<dyn ActorStore>,
    discovery: Arc<dyn ActorDiscovery>,
    local_domain: String,
    blocked_instances: HashSet<String>,
    default_timeout: Duration,
}

impl ActorResolver {
    pub fn new(
        store: Arc<dyn ActorStore>,
        discovery: Arc<dyn ActorDiscovery>,
        config: &AppConfig,
    ) -> Self {
        Self::with_settings(
            store,
            discovery,
            config.server.local_domain(),
            config.resolution.fetch_timeout(),
        )
        .with_blocked_instances(config.resolution.blocked_instances.iter().cloned())
    }

    pub fn with_settings(
        store: Arc<dyn ActorStore>,
        discovery: Arc<dyn ActorDiscovery>,
        local_domain: impl Into<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            discovery,
            local_domain: local_domain.into().to_ascii_lowercase(),
            blocked_instances: HashSet::new(),
            default_timeout,
        }
    }

    /// Hosts whose actors always resolve to `NotFound`
    pub fn with_blocked_instances<I>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.blocked_instances = hosts
            .into_iter()
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        self
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    pub fn store(&self) -> &Arc<dyn ActorStore> {
        &self.store
    }

    /// Resolve a reference string.
    ///
    /// # Errors
    /// - `NotFound`: unparseable, absent (and not created), blocked, or
    ///   filtered out
    /// - `RemoteFetch`: the remote could not be reached
    /// - `MalformedDocument`: the remote answered with an unusable document
    pub async fn resolve(
        &self,
        reference: &str,
        policy: &ResolutionPolicy,
    ) -> Result<ActorRecord, AppError> {
        let result = match ActorReference::parse(reference, &self.local_domain) {
            Ok(parsed) => self.resolve_reference(&parsed, policy).await,
            Err(e) => {
                metrics::ACTOR_RESOLUTIONS_TOTAL
                    .with_label_values(&["invalid", "not_found"])
                    .inc();
                return Err(e);
            }
        };

        if let Err(e) = &result {
            if !matches!(e, AppError::NotFound) {
                tracing::warn!(reference, error = %e, "Actor resolution failed");
                metrics::record_error(e, "resolve_actor");
            }
        }
        result
    }

    /// Resolve an already-parsed reference.
    pub async fn resolve_reference(
        &self,
        reference: &ActorReference,
        policy: &ResolutionPolicy,
    ) -> Result<ActorRecord, AppError> {
        let label = match reference {
            ActorReference::LocalUrl { .. } => "local_url",
            ActorReference::RemoteUrl(_) => "remote_url",
            ActorReference::Handle { .. } => "handle",
        };

        let result = self
            .lookup_or_create(reference, policy)
            .await
            .and_then(|record| {
                if policy.filter.accepts(record.kind) {
                    Ok(record)
                } else {
                    tracing::debug!(
                        %reference,
                        kind = record.kind.as_str(),
                        filter = ?policy.filter,
                        "Resolved actor filtered out"
                    );
                    Err(AppError::NotFound)
                }
            });

        let status = match &result {
            Ok(_) => "found",
            Err(e) => e.kind(),
        };
        metrics::ACTOR_RESOLUTIONS_TOTAL
            .with_label_values(&[label, status])
            .inc();
        result
    }

    async fn lookup_or_create(
        &self,
        reference: &ActorReference,
        policy: &ResolutionPolicy,
    ) -> Result<ActorRecord, AppError> {
        if let Some(host) = reference.remote_host() {
            if self.is_blocked(&host) {
                tracing::debug!(%reference, "Reference points at a blocked instance");
                return Err(AppError::NotFound);
            }
        }

        match reference {
            ActorReference::LocalUrl { kind, name } => self
                .store
                .find_local_actor(*kind, name)
                .await?
                .ok_or(AppError::NotFound),

            ActorReference::Handle { name, host, kind } if *host == self.local_domain => {
                for kind in candidate_kinds(policy.filter, *kind) {
                    if let Some(record) = self.store.find_local_actor(kind, name).await? {
                        return Ok(record);
                    }
                }
                Err(AppError::NotFound)
            }

            ActorReference::Handle { name, host, kind } => {
                let required = required_handle_kind(policy.filter, *kind);
                let wanted = required.or(*kind);
                if let Some(record) = self.find_by_handle(name, host, wanted, required).await? {
                    return Ok(record);
                }
                if !policy.create_if_not_found {
                    return Err(AppError::NotFound);
                }

                let url = self
                    .webfinger(name, host, wanted, self.timeout(policy))
                    .await?;
                if url.host_str().is_some_and(|h| self.is_blocked(h)) {
                    tracing::debug!(%reference, %url, "WebFinger points at a blocked instance");
                    return Err(AppError::NotFound);
                }
                self.remote_url(&url, policy).await
            }

            ActorReference::RemoteUrl(url) => self.remote_url(url, policy).await,
        }
    }

    /// Stored remote actor for a handle.
    ///
    /// `wanted` is tried first; other kinds only match when nothing is
    /// `required`, so `@news@host` still finds a stored feed.
    async fn find_by_handle(
        &self,
        name: &str,
        host: &str,
        wanted: Option<ActorKind>,
        required: Option<ActorKind>,
    ) -> Result<Option<ActorRecord>, AppError> {
        let found = self
            .store
            .find_remote_actor_by_handle(name, host, wanted)
            .await?;
        if found.is_some() || wanted.is_none() || required.is_some() {
            return Ok(found);
        }
        self.store
            .find_remote_actor_by_handle(name, host, None)
            .await
    }

    async fn remote_url(
        &self,
        url: &Url,
        policy: &ResolutionPolicy,
    ) -> Result<ActorRecord, AppError> {
        if let Some(record) = self.store.find_remote_actor(url.as_str()).await? {
            return Ok(record);
        }
        // References often add a trailing slash the stored id lacks.
        let trimmed = url.as_str().trim_end_matches('/');
        if trimmed != url.as_str() {
            if let Some(record) = self.store.find_remote_actor(trimmed).await? {
                return Ok(record);
            }
        }
        if !policy.create_if_not_found {
            return Err(AppError::NotFound);
        }
        self.fetch_and_create(url, self.timeout(policy)).await
    }

    async fn fetch_and_create(&self, url: &Url, timeout: Duration) -> Result<ActorRecord, AppError> {
        let document = tokio::time::timeout(timeout, self.discovery.fetch_actor_document(url, timeout))
            .await
            .map_err(|_| AppError::RemoteFetch {
                transient: true,
                message: format!("Fetching {} timed out after {:?}", url, timeout),
            })??;

        let actor = document.validate(url)?;

        // The document may name a canonical id that differs from the
        // requested spelling and is already stored.
        if actor.ap_id != url.as_str() {
            if let Some(record) = self.store.find_remote_actor(&actor.ap_id).await? {
                return Ok(record);
            }
        }

        let record = self.store.create_remote_actor(&actor).await?;
        metrics::ACTORS_CREATED_TOTAL
            .with_label_values(&[record.kind.as_str()])
            .inc();
        tracing::info!(
            ap_id = %actor.ap_id,
            kind = record.kind.as_str(),
            id = %record.id,
            "Remote actor stored"
        );
        Ok(record)
    }

    async fn webfinger(
        &self,
        name: &str,
        host: &str,
        kind: Option<ActorKind>,
        timeout: Duration,
    ) -> Result<Url, AppError> {
        let result = tokio::time::timeout(
            timeout,
            self.discovery.webfinger(name, host, kind, timeout),
        )
        .await;

        match result {
            Ok(Ok(url)) => Ok(url),
            Ok(Err(e)) => {
                tracing::debug!(name, host, error = %e, "WebFinger lookup failed");
                Err(AppError::NotFound)
            }
            Err(_) => {
                tracing::debug!(name, host, "WebFinger lookup timed out");
                Err(AppError::NotFound)
            }
        }
    }

    fn timeout(&self, policy: &ResolutionPolicy) -> Duration {
        policy.timeout.unwrap_or(self.default_timeout)
    }

    fn is_blocked(&self, host: &str) -> bool {
        if self.blocked_instances.is_empty() {
            return false;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let bare = host.split(':').next().unwrap_or(&host);
        self.blocked_instances.contains(&host) || self.blocked_instances.contains(bare)
    }
}
