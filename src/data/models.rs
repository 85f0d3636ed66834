//! Data models
//!
//! Actor records as seen by the federation core. The persistence layer
//! owns them; this crate only reads them and asks for remote ones to be
//! created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Actor ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Actor kind
// =============================================================================

/// What an actor is on this platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    User,
    Community,
    Feed,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Community => "community",
            Self::Feed => "feed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "community" => Some(Self::Community),
            "feed" => Some(Self::Feed),
            _ => None,
        }
    }

    /// Local URL path segment: `/u/`, `/c/`, `/f/`
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::User => "u",
            Self::Community => "c",
            Self::Feed => "f",
        }
    }

    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment {
            "u" => Some(Self::User),
            "c" => Some(Self::Community),
            "f" => Some(Self::Feed),
            _ => None,
        }
    }

    /// Map an ActivityStreams actor `type` onto a platform kind.
    pub fn from_activity_type(activity_type: &str) -> Option<Self> {
        match activity_type {
            "Person" | "Service" | "Application" | "Organization" => Some(Self::User),
            "Group" => Some(Self::Community),
            "Feed" => Some(Self::Feed),
            _ => None,
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Where an actor lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "host", rename_all = "lowercase")]
pub enum ActorHome {
    Local,
    Remote(String),
}

impl ActorHome {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

/// Public key advertised by an actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyMaterial {
    /// Key ID URI (usually `{actor}#main-key`)
    pub key_id: String,
    /// SPKI PEM
    pub pem: String,
}

/// An actor record as held by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub id: ActorId,
    pub kind: ActorKind,
    /// Preferred username / community name
    pub name: String,
    pub home: ActorHome,
    /// Canonical ActivityPub ID; absent for local actors
    pub ap_id: Option<String>,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub public_key: Option<PublicKeyMaterial>,
    /// Only meaningful for communities
    pub private: bool,
    pub created_at: DateTime<Utc>,
}

impl ActorRecord {
    pub fn is_local(&self) -> bool {
        self.home.is_local()
    }

    /// Inbox deliveries should go to; prefers the shared inbox.
    pub fn delivery_inbox(&self) -> Option<&str> {
        self.shared_inbox.as_deref().or(self.inbox.as_deref())
    }
}

/// Validated remote actor, ready to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRemoteActor {
    /// Canonical ActivityPub ID (unique)
    pub ap_id: String,
    pub kind: ActorKind,
    pub name: String,
    /// Lowercased host of `ap_id`
    pub domain: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key: PublicKeyMaterial,
    pub private: bool,
}
