//! Signed activity delivery
//!
//! Builds HTTP-signed requests for remote inboxes and either sends them
//! immediately or hands them to the outbound queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::queue::DeliveryQueue;
use super::reference::url_authority;
use super::signature::{
    REQUEST_TARGET, RSA_SHA256, build_signing_string, calculate_digest, http_date_now,
    serialize_signature_header, sign,
};
use crate::config::DeliveryConfig;
use crate::error::AppError;
use crate::metrics;

/// ActivityStreams JSON-LD context
pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Default media type for activities
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Key the message is signed with
#[derive(Clone)]
pub struct SigningCredentials {
    /// Key ID URI (e.g. `https://example.com/users/alice#main-key`)
    pub key_id: String,
    /// PKCS#8 or PKCS#1 PEM
    pub private_key_pem: String,
}

impl std::fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("key_id", &self.key_id)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// What to send
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub uri: String,
    pub method: String,
    /// JSON body; objects without `@context` get the ActivityStreams one
    pub body: Option<serde_json::Value>,
    pub content_type: String,
    /// Overrides the configured request timeout
    pub timeout: Option<Duration>,
}

impl OutboundRequest {
    /// POST an activity to an inbox
    pub fn post(uri: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            uri: uri.into(),
            method: "POST".to_string(),
            body: Some(body),
            content_type: ACTIVITY_JSON.to_string(),
            timeout: None,
        }
    }

    /// Signed GET (e.g. authorized fetch of a remote object)
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: "GET".to_string(),
            body: None,
            content_type: ACTIVITY_JSON.to_string(),
            timeout: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully signed request, ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub uri: Url,
    pub method: String,
    /// Header name/value pairs in the order they were produced
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl SignedMessage {
    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Sign `request` with `credentials`.
///
/// # Errors
/// - `InvalidDestination`: URI is unparseable, not http(s), or hostless
/// - `Crypto`: the private key is unusable
pub fn build_signed_message(
    request: &OutboundRequest,
    credentials: &SigningCredentials,
    user_agent: &str,
    timeout: Duration,
) -> Result<SignedMessage, AppError> {
    let uri = Url::parse(&request.uri)
        .map_err(|e| AppError::InvalidDestination(format!("{}: {}", request.uri, e)))?;
    match uri.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidDestination(format!(
                "Unsupported scheme: {}",
                scheme
            )));
        }
    }
    let host = url_authority(&uri)
        .ok_or_else(|| AppError::InvalidDestination(format!("Missing host: {}", request.uri)))?;

    let body = request
        .body
        .as_ref()
        .map(|value| {
            let mut value = value.clone();
            if let Some(object) = value.as_object_mut() {
                object
                    .entry("@context")
                    .or_insert_with(|| serde_json::json!(ACTIVITY_STREAMS_CONTEXT));
            }
            serde_json::to_vec(&value)
        })
        .transpose()
        .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

    let mut path = uri.path().to_string();
    if let Some(query) = uri.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut headers = vec![
        ("Host".to_string(), host),
        ("Date".to_string(), http_date_now()),
    ];
    let mut covered = vec![REQUEST_TARGET, "host", "date"];
    if let Some(body) = &body {
        headers.push(("Digest".to_string(), calculate_digest(body)));
        headers.push(("Content-Type".to_string(), request.content_type.clone()));
        covered.extend(["digest", "content-type"]);
    } else {
        headers.push(("Accept".to_string(), request.content_type.clone()));
    }
    headers.push(("User-Agent".to_string(), user_agent.to_string()));

    let signing_string = build_signing_string(&request.method, &path, &headers, &covered)?;
    let signature = sign(&signing_string, &credentials.private_key_pem)?;
    headers.push((
        "Signature".to_string(),
        serialize_signature_header(&credentials.key_id, RSA_SHA256, &covered, &signature),
    ));

    Ok(SignedMessage {
        uri,
        method: request.method.to_ascii_uppercase(),
        headers,
        body,
        timeout,
    })
}

/// Classify a response status: 2xx is success; 5xx, 429 and 408 are worth
/// retrying; everything else is final.
pub fn classify_status(status: u16) -> Result<u16, AppError> {
    match status {
        200..=299 => Ok(status),
        500..=599 | 429 | 408 => Err(AppError::Delivery {
            retryable: true,
            status: Some(status),
            message: format!("Remote answered HTTP {}", status),
        }),
        _ => Err(AppError::Delivery {
            retryable: false,
            status: Some(status),
            message: format!("Remote rejected delivery: HTTP {}", status),
        }),
    }
}

/// Puts a signed message on the wire
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Send once. Returns the 2xx status, or a classified `Delivery` error.
    async fn send(&self, message: &SignedMessage) -> Result<u16, AppError>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn send(&self, message: &SignedMessage) -> Result<u16, AppError> {
        let method = reqwest::Method::from_bytes(message.method.as_bytes())
            .map_err(|e| AppError::Validation(format!("Invalid method {}: {}", message.method, e)))?;

        let mut request = self
            .client
            .request(method, message.uri.clone())
            .timeout(message.timeout);
        for (name, value) in &message.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &message.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| {
            // Refused connections and DNS failures will not heal on retry.
            let retryable = !e.is_connect();
            AppError::Delivery {
                retryable,
                status: None,
                message: format!("Failed to deliver to {}: {}", message.uri, e),
            }
        })?;

        classify_status(response.status().as_u16())
    }
}

/// How `signed_request` dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Send now and report the remote's answer
    Sync,
    /// Enqueue for the worker pool and return immediately
    Async,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

/// Signs and dispatches outbound requests
#[derive(Clone)]
pub struct DeliveryClient {
    transport: Arc<dyn DeliveryTransport>,
    queue: DeliveryQueue,
    user_agent: String,
    default_timeout: Duration,
}

impl DeliveryClient {
    pub fn new(
        transport: Arc<dyn DeliveryTransport>,
        queue: DeliveryQueue,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            transport,
            queue,
            user_agent: config.user_agent.clone(),
            default_timeout: config.request_timeout(),
        }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Sign `request` and deliver it.
    ///
    /// Returns the signed message in both modes. In [`DeliveryMode::Sync`]
    /// the call waits for the remote (bounded by the timeout) and fails with
    /// its classified error; in [`DeliveryMode::Async`] it fails only when
    /// the queue rejects the message.
    pub async fn signed_request(
        &self,
        request: OutboundRequest,
        credentials: &SigningCredentials,
        mode: DeliveryMode,
    ) -> Result<SignedMessage, AppError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let message = build_signed_message(&request, credentials, &self.user_agent, timeout)?;

        match mode {
            DeliveryMode::Async => {
                self.queue.enqueue(message.clone()).inspect_err(|e| {
                    tracing::warn!(uri = %message.uri, error = %e, "Delivery not queued");
                    metrics::record_error(e, "enqueue_delivery");
                })?;
                tracing::debug!(uri = %message.uri, "Delivery queued");
                Ok(message)
            }
            DeliveryMode::Sync => {
                let result = send_with_timeout(self.transport.as_ref(), &message).await;
                metrics::DELIVERY_ATTEMPTS_TOTAL
                    .with_label_values(&[mode.as_str(), attempt_label(&result)])
                    .inc();

                match result {
                    Ok(status) => {
                        tracing::info!(uri = %message.uri, status, "Successfully delivered activity");
                        Ok(message)
                    }
                    Err(e) => {
                        tracing::warn!(uri = %message.uri, error = %e, "Delivery failed");
                        metrics::record_error(&e, "deliver");
                        Err(e)
                    }
                }
            }
        }
    }
}

/// One transport call bounded by the message timeout
pub(crate) async fn send_with_timeout(
    transport: &dyn DeliveryTransport,
    message: &SignedMessage,
) -> Result<u16, AppError> {
    tokio::time::timeout(message.timeout, transport.send(message))
        .await
        .map_err(|_| AppError::Delivery {
            retryable: true,
            status: None,
            message: format!("Delivery to {} timed out", message.uri),
        })?
}

pub(crate) fn attempt_label(result: &Result<u16, AppError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) if e.is_retryable() => "retryable",
        Err(_) => "permanent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::federation::keys::tests::test_keypair;
    use crate::federation::queue::{DeliveryQueueReceiver, delivery_queue};
    use crate::federation::signature::verify;

    fn credentials() -> SigningCredentials {
        SigningCredentials {
            key_id: "https://example.com/users/testuser#main-key".to_string(),
            private_key_pem: test_keypair().private_key_pem.clone(),
        }
    }

    fn client(
        transport: MockDeliveryTransport,
        capacity: usize,
    ) -> (DeliveryClient, DeliveryQueueReceiver) {
        let (queue, receiver) = delivery_queue(capacity);
        let client = DeliveryClient::new(Arc::new(transport), queue, &valid_config().delivery);
        (client, receiver)
    }

    #[test]
    fn post_message_carries_signed_headers_and_context() {
        let message = build_signed_message(
            &OutboundRequest::post(
                "https://remote.example.com/inbox",
                serde_json::json!({ "type": "Create", "id": "https://example.com/activities/1" }),
            ),
            &credentials(),
            "fedcore/test",
            Duration::from_secs(5),
        )
        .unwrap();

        let names: Vec<&str> = message.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["Host", "Date", "Digest", "Content-Type", "User-Agent", "Signature"]
        );
        assert_eq!(message.header("host"), Some("remote.example.com"));
        assert!(message.header("date").unwrap().ends_with(" GMT"));

        let body: serde_json::Value =
            serde_json::from_slice(message.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["@context"], ACTIVITY_STREAMS_CONTEXT);
        assert_eq!(
            message.header("digest").unwrap(),
            calculate_digest(message.body.as_deref().unwrap())
        );

        let signature = message.header("signature").unwrap();
        assert!(signature.contains("keyId=\"https://example.com/users/testuser#main-key\""));
        assert!(signature.contains("headers=\"(request-target) host date digest content-type\""));
    }

    #[test]
    fn signature_verifies_against_public_key() {
        let message = build_signed_message(
            &OutboundRequest::post("https://remote.example.com/inbox?x=1", serde_json::json!({})),
            &credentials(),
            "fedcore/test",
            Duration::from_secs(5),
        )
        .unwrap();

        let parsed =
            crate::federation::signature::parse_signature(message.header("signature").unwrap())
                .unwrap();
        let order: Vec<&str> = parsed.covered_headers.iter().map(String::as_str).collect();
        let signing_string =
            build_signing_string("POST", "/inbox?x=1", &message.headers, &order).unwrap();

        assert_eq!(
            verify(&parsed.signature, &signing_string, &test_keypair().public_key_pem),
            Ok(())
        );
    }

    #[test]
    fn existing_context_is_left_alone() {
        let message = build_signed_message(
            &OutboundRequest::post(
                "https://remote.example.com/inbox",
                serde_json::json!({ "@context": ["https://w3id.org/security/v1"], "type": "Follow" }),
            ),
            &credentials(),
            "fedcore/test",
            Duration::from_secs(5),
        )
        .unwrap();

        let body: serde_json::Value =
            serde_json::from_slice(message.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["@context"], serde_json::json!(["https://w3id.org/security/v1"]));
    }

    #[test]
    fn bodyless_get_covers_request_target_host_date() {
        let message = build_signed_message(
            &OutboundRequest::get("http://localhost:3000/u/alice"),
            &credentials(),
            "fedcore/test",
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(message.header("host"), Some("localhost:3000"));
        assert!(message.header("digest").is_none());
        assert!(message.body.is_none());
        assert!(
            message
                .header("signature")
                .unwrap()
                .contains("headers=\"(request-target) host date\"")
        );
    }

    #[test]
    fn invalid_destinations_are_rejected() {
        for uri in ["not a uri", "mailto:alice@example.com", "ftp://example.com/inbox"] {
            assert!(
                matches!(
                    build_signed_message(
                        &OutboundRequest::post(uri, serde_json::json!({})),
                        &credentials(),
                        "fedcore/test",
                        Duration::from_secs(5),
                    ),
                    Err(AppError::InvalidDestination(_))
                ),
                "{uri} should be rejected"
            );
        }
    }

    #[test]
    fn corrupt_key_is_a_crypto_error() {
        let credentials = SigningCredentials {
            key_id: "https://example.com/users/testuser#main-key".to_string(),
            private_key_pem: "garbage".to_string(),
        };
        assert!(matches!(
            build_signed_message(
                &OutboundRequest::post("https://remote.example.com/inbox", serde_json::json!({})),
                &credentials,
                "fedcore/test",
                Duration::from_secs(5),
            ),
            Err(AppError::Crypto(_))
        ));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(202).unwrap(), 202);
        for status in [500, 503, 429, 408] {
            assert!(classify_status(status).unwrap_err().is_retryable(), "{status}");
        }
        for status in [400, 401, 403, 404, 410] {
            assert!(!classify_status(status).unwrap_err().is_retryable(), "{status}");
        }
    }

    #[tokio::test]
    async fn sync_mode_sends_once_and_returns_message() {
        let mut transport = MockDeliveryTransport::new();
        transport
            .expect_send()
            .withf(|message| message.uri.as_str() == "https://remote.example.com/inbox")
            .times(1)
            .returning(|_| Ok(202));
        let (client, _receiver) = client(transport, 4);

        let message = client
            .signed_request(
                OutboundRequest::post("https://remote.example.com/inbox", serde_json::json!({})),
                &credentials(),
                DeliveryMode::Sync,
            )
            .await
            .unwrap();
        assert_eq!(message.method, "POST");
        assert_eq!(client.queue().len(), 0);
    }

    #[tokio::test]
    async fn sync_mode_surfaces_classified_failure() {
        let mut transport = MockDeliveryTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| classify_status(410));
        let (client, _receiver) = client(transport, 4);

        let result = client
            .signed_request(
                OutboundRequest::post("https://remote.example.com/inbox", serde_json::json!({})),
                &credentials(),
                DeliveryMode::Sync,
            )
            .await;
        assert!(matches!(
            result,
            Err(AppError::Delivery {
                retryable: false,
                status: Some(410),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn async_mode_enqueues_without_sending() {
        let mut transport = MockDeliveryTransport::new();
        transport.expect_send().never();
        let (client, _receiver) = client(transport, 1);
        let request =
            OutboundRequest::post("https://remote.example.com/inbox", serde_json::json!({}));

        client
            .signed_request(request.clone(), &credentials(), DeliveryMode::Async)
            .await
            .unwrap();
        assert_eq!(client.queue().len(), 1);

        assert!(matches!(
            client
                .signed_request(request, &credentials(), DeliveryMode::Async)
                .await,
            Err(AppError::QueueFull)
        ));
    }
}
