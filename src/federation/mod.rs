//! ActivityPub federation module
//!
//! Handles:
//! - RSA key material
//! - HTTP Signatures (signing, verification, header codec)
//! - Signed activity delivery (sync and queued)
//! - Actor reference resolution and caching
//! - WebFinger

mod delivery;
mod discovery;
pub(crate) mod keys;
mod queue;
mod reference;
mod resolution_cache;
mod resolver;
mod signature;
mod webfinger;

pub use delivery::{
    ACTIVITY_JSON, ACTIVITY_STREAMS_CONTEXT, DeliveryClient, DeliveryMode, DeliveryTransport,
    HttpTransport, OutboundRequest, SignedMessage, SigningCredentials, build_signed_message,
    classify_status,
};
pub use discovery::{ActorDiscovery, ActorDocument, ActorEndpoints, DocumentPublicKey, HttpDiscovery};
pub use keys::{KeyPair, MIN_RSA_BITS, generate_keypair, generate_keypair_with_bits};
pub use queue::{
    DeliveryObserver, DeliveryOutcome, DeliveryQueue, DeliveryQueueReceiver, DeliveryStatus,
    DeliveryWorkerPool, RetryPolicy, TracingObserver, delivery_queue,
};
pub use reference::{ActorReference, normalize_reference};
pub use resolution_cache::{CacheStats, ResolutionCache};
pub use resolver::{ActorResolver, KindFilter, ResolutionPolicy};
pub use signature::{
    REQUEST_TARGET, RSA_SHA256, SignatureParameters, VerificationError, build_signing_string,
    calculate_digest, format_http_date, http_date_now, key_id_matches_actor, parse_signature,
    serialize_signature_header, sign, verify, verify_request,
};
pub use webfinger::{WebFingerLink, WebFingerResponse, webfinger_url};
