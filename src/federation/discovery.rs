//! Remote actor discovery
//!
//! Fetches ActivityPub actor documents and resolves webfinger addresses.
//! [`ActorDiscovery`] is the seam the resolver talks to; [`HttpDiscovery`] is
//! the reqwest-backed implementation used in production.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use super::keys::parse_public_key;
use super::reference::url_authority;
use super::webfinger::{WebFingerResponse, webfinger_url};
use crate::data::{ActorKind, NewRemoteActor, PublicKeyMaterial};
use crate::error::AppError;
use crate::metrics;

/// Redirect hops followed per fetch; each hop passes the destination guard
const MAX_REDIRECTS: usize = 3;

const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Network collaborator for actor discovery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActorDiscovery: Send + Sync {
    /// Fetch and decode the actor document at `url`.
    async fn fetch_actor_document(
        &self,
        url: &Url,
        timeout: Duration,
    ) -> Result<ActorDocument, AppError>;

    /// Resolve `name@host` to the actor's canonical URL, preferring an actor
    /// of `kind` when the host publishes several under one name.
    async fn webfinger(
        &self,
        name: &str,
        host: &str,
        kind: Option<ActorKind>,
        timeout: Duration,
    ) -> Result<Url, AppError>;
}

/// The subset of an ActivityPub actor document this crate reads
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub actor_type: String,
    pub preferred_username: Option<String>,
    pub name: Option<String>,
    pub inbox: Option<String>,
    pub endpoints: Option<ActorEndpoints>,
    pub public_key: Option<DocumentPublicKey>,
    #[serde(default)]
    pub manually_approves_followers: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorEndpoints {
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPublicKey {
    pub id: String,
    pub owner: Option<String>,
    pub public_key_pem: String,
}

impl ActorDocument {
    /// Check the document against the URL it was fetched from and turn it
    /// into a record the store can persist.
    ///
    /// # Errors
    /// `MalformedDocument` when the type is unsupported, the `id` lives on a
    /// different host than `requested`, or the inbox or public key is missing
    /// or unusable.
    pub fn validate(&self, requested: &Url) -> Result<NewRemoteActor, AppError> {
        let malformed = |msg: String| AppError::MalformedDocument(msg);

        let kind = ActorKind::from_activity_type(&self.actor_type)
            .ok_or_else(|| malformed(format!("Unsupported actor type: {}", self.actor_type)))?;

        let id = Url::parse(&self.id).map_err(|e| malformed(format!("Invalid actor id: {}", e)))?;
        let domain = url_authority(&id)
            .ok_or_else(|| malformed("Actor id has no host".to_string()))?
            .to_ascii_lowercase();
        let requested_domain = url_authority(requested)
            .ok_or_else(|| malformed("Requested URL has no host".to_string()))?
            .to_ascii_lowercase();
        if domain != requested_domain {
            return Err(malformed(format!(
                "Actor id host {} does not match requested host {}",
                domain, requested_domain
            )));
        }

        let inbox = self
            .inbox
            .as_deref()
            .ok_or_else(|| malformed("Missing inbox".to_string()))?;
        Url::parse(inbox).map_err(|e| malformed(format!("Invalid inbox: {}", e)))?;

        let public_key = self
            .public_key
            .as_ref()
            .ok_or_else(|| malformed("Missing publicKey".to_string()))?;
        parse_public_key(&public_key.public_key_pem)
            .map_err(|e| malformed(format!("Unusable publicKeyPem: {}", e)))?;
        let key_host = Url::parse(&public_key.id)
            .ok()
            .and_then(|key_url| url_authority(&key_url))
            .map(|host| host.to_ascii_lowercase());
        if key_host.as_deref() != Some(domain.as_str()) {
            return Err(malformed(format!(
                "Public key {} is not hosted by {}",
                public_key.id, domain
            )));
        }

        let name = self
            .preferred_username
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| last_path_segment(&id))
            .ok_or_else(|| malformed("Actor has no usable name".to_string()))?;

        Ok(NewRemoteActor {
            ap_id: id.to_string(),
            kind,
            name,
            domain,
            inbox: inbox.to_string(),
            shared_inbox: self.endpoints.as_ref().and_then(|e| e.shared_inbox.clone()),
            public_key: PublicKeyMaterial {
                key_id: public_key.id.clone(),
                pem: public_key.public_key_pem.clone(),
            },
            private: kind == ActorKind::Community && self.manually_approves_followers,
        })
    }
}

fn last_path_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(str::to_string)
}

// =============================================================================
// HTTP implementation
// =============================================================================

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Absolute destination of a redirect response
fn redirect_target(current: &Url, headers: &reqwest::header::HeaderMap) -> Result<Url, AppError> {
    let location = headers
        .get(reqwest::header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| permanent(format!("Redirect from {} without Location", current)))?;
    current
        .join(location)
        .map_err(|e| permanent(format!("Invalid redirect from {}: {}", current, e)))
}

fn permanent(message: String) -> AppError {
    AppError::RemoteFetch {
        transient: false,
        message,
    }
}

fn transient(message: String) -> AppError {
    AppError::RemoteFetch {
        transient: true,
        message,
    }
}

/// Map a transport error onto transient/permanent.
///
/// Timeouts are worth retrying; connection refusals and DNS failures are not.
fn classify_request_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        transient(format!("Request timed out: {}", err))
    } else if err.is_connect() {
        permanent(format!("Connection failed: {}", err))
    } else {
        transient(format!("Request failed: {}", err))
    }
}

fn classify_status(status: reqwest::StatusCode) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("HTTP {}", status);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(transient(message))
    } else {
        Err(permanent(message))
    }
}

/// reqwest-backed discovery with SSRF protection
pub struct HttpDiscovery {
    client: reqwest::Client,
    allow_private_hosts: bool,
}

impl HttpDiscovery {
    pub fn new(user_agent: &str, allow_private_hosts: bool) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, allow_private_hosts))
    }

    /// Wrap an existing client.
    ///
    /// Redirects are followed here, one guarded hop at a time, so the client
    /// should be built with `redirect::Policy::none()`.
    pub fn with_client(client: reqwest::Client, allow_private_hosts: bool) -> Self {
        Self {
            client,
            allow_private_hosts,
        }
    }

    /// Reject non-http(s) URLs and, unless allowed, hosts that are or resolve
    /// to loopback/private addresses.
    async fn guard_destination(&self, url: &Url) -> Result<(), AppError> {
        match url.scheme() {
            "http" | "https" => {}
            scheme => return Err(permanent(format!("Unsupported URL scheme: {}", scheme))),
        }
        let host = url
            .host_str()
            .ok_or_else(|| permanent("Missing host".to_string()))?;

        if self.allow_private_hosts {
            return Ok(());
        }
        if is_disallowed_host(host) {
            return Err(permanent(format!("Destination not allowed: {}", host)));
        }

        let port = url
            .port_or_known_default()
            .ok_or_else(|| permanent("Missing port".to_string()))?;
        let lookup_name = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.');
        let lookup = tokio::net::lookup_host((lookup_name, port))
            .await
            .map_err(|e| permanent(format!("Failed to resolve {}: {}", host, e)))?;

        let mut resolved_any = false;
        for addr in lookup {
            resolved_any = true;
            if is_disallowed_ip(addr.ip()) {
                return Err(permanent(format!("Destination not allowed: {}", host)));
            }
        }
        if !resolved_any {
            return Err(permanent(format!("No DNS records for {}", host)));
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        url: &Url,
        accept: &str,
        timeout: Duration,
    ) -> Result<T, AppError> {
        let started = Instant::now();
        let result = self.get_json_inner(url, accept, timeout).await;

        let status = match &result {
            Ok(_) => "success",
            Err(AppError::RemoteFetch {
                transient: true, ..
            }) => "transient",
            Err(AppError::MalformedDocument(_)) => "malformed",
            Err(_) => "permanent",
        };
        metrics::observe_remote_fetch(operation, status, started.elapsed());
        if let Err(e) = &result {
            tracing::debug!(%url, operation, error = %e, "Remote fetch failed");
        }
        result
    }

    async fn get_json_inner<T: serde::de::DeserializeOwned>(
        &self,
        url: &Url,
        accept: &str,
        timeout: Duration,
    ) -> Result<T, AppError> {
        let mut current = url.clone();
        for _ in 0..=MAX_REDIRECTS {
            self.guard_destination(&current).await?;

            let response = self
                .client
                .get(current.clone())
                .header(reqwest::header::ACCEPT, accept)
                .timeout(timeout)
                .send()
                .await
                .map_err(classify_request_error)?;

            if response.status().is_redirection() {
                let next = redirect_target(&current, response.headers())?;
                tracing::debug!(from = %current, to = %next, "Following redirect");
                current = next;
                continue;
            }
            classify_status(response.status())?;

            let body = response.bytes().await.map_err(classify_request_error)?;
            return serde_json::from_slice(&body).map_err(|e| {
                AppError::MalformedDocument(format!("Invalid JSON from {}: {}", current, e))
            });
        }
        Err(permanent(format!("Too many redirects from {}", url)))
    }
}

#[async_trait]
impl ActorDiscovery for HttpDiscovery {
    async fn fetch_actor_document(
        &self,
        url: &Url,
        timeout: Duration,
    ) -> Result<ActorDocument, AppError> {
        self.get_json("actor_document", url, ACTIVITY_ACCEPT, timeout)
            .await
    }

    async fn webfinger(
        &self,
        name: &str,
        host: &str,
        kind: Option<ActorKind>,
        timeout: Duration,
    ) -> Result<Url, AppError> {
        let endpoint = webfinger_url(name, host)
            .map_err(|e| permanent(format!("Invalid webfinger host {}: {}", host, e)))?;
        let response: WebFingerResponse = self
            .get_json("webfinger", &endpoint, "application/jrd+json, application/json", timeout)
            .await?;

        let href = response.actor_href_for(kind).ok_or_else(|| {
            AppError::MalformedDocument(format!("No ActivityPub link for {}@{}", name, host))
        })?;
        Url::parse(href)
            .map_err(|e| AppError::MalformedDocument(format!("Invalid actor link {}: {}", href, e)))
    }
}
