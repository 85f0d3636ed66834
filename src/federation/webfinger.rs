//! WebFinger protocol types
//!
//! Used to discover ActivityPub actor URIs from `user@domain` addresses.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::data::ActorKind;

/// Link types that point at an ActivityPub actor document
const ACTOR_LINK_TYPES: [&str; 2] = [
    "application/activity+json",
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
];

/// Link property carrying the ActivityStreams type of the linked actor
const ACTOR_TYPE_PROPERTY: &str = "https://www.w3.org/ns/activitystreams#type";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
}

impl WebFingerLink {
    fn is_actor_link(&self) -> bool {
        self.rel == "self"
            && self
                .link_type
                .as_deref()
                .is_some_and(|t| ACTOR_LINK_TYPES.iter().any(|known| t.starts_with(known)))
    }

    /// Actor kind advertised in the link properties, if any
    fn actor_kind(&self) -> Option<ActorKind> {
        self.properties
            .as_ref()?
            .get(ACTOR_TYPE_PROPERTY)?
            .as_str()
            .and_then(ActorKind::from_activity_type)
    }
}

impl WebFingerResponse {
    /// `href` of the first `rel="self"` link carrying an ActivityPub media type
    pub fn actor_href(&self) -> Option<&str> {
        self.actor_href_for(None)
    }

    /// Like [`Self::actor_href`], preferring the link whose advertised type
    /// maps to `kind`.
    ///
    /// Servers that let a user and a community share a name publish one link
    /// per actor under the same subject. Links without a type property still
    /// match when no typed link does.
    pub fn actor_href_for(&self, kind: Option<ActorKind>) -> Option<&str> {
        let candidates: Vec<&WebFingerLink> = self
            .links
            .iter()
            .filter(|link| link.is_actor_link() && link.href.is_some())
            .collect();

        let chosen = match kind {
            None => candidates.first(),
            Some(kind) => candidates
                .iter()
                .find(|link| link.actor_kind() == Some(kind))
                .or_else(|| candidates.iter().find(|link| link.actor_kind().is_none())),
        };
        chosen.and_then(|link| link.href.as_deref())
    }
}

/// WebFinger endpoint for `acct:{name}@{host}`, query percent-encoded
pub fn webfinger_url(name: &str, host: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("https://{}/.well-known/webfinger", host))?;
    url.query_pairs_mut()
        .append_pair("resource", &format!("acct:{}@{}", name, host));
    Ok(url)
}
