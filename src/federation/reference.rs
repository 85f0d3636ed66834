//! Actor references
//!
//! Classifies the strings users and remote servers hand us (actor URLs and
//! `user@domain` handles) into a tagged [`ActorReference`].

use std::fmt;

use url::Url;

use crate::data::ActorKind;
use crate::error::AppError;

/// A parsed reference to an actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorReference {
    /// `https://{local-domain}/{u|c|f}/{name}`
    LocalUrl { kind: ActorKind, name: String },
    /// Any http(s) URL on another host, fragment removed
    RemoteUrl(Url),
    /// `name@host` with any `acct:` prefix removed.
    ///
    /// A leading `@` hints at a user and a leading `!` at a community; a bare
    /// or `acct:` handle carries no hint.
    Handle {
        name: String,
        host: String,
        kind: Option<ActorKind>,
    },
}

impl ActorReference {
    /// Classify `input` relative to `local_domain`.
    ///
    /// Anything that is neither an http(s) URL nor a `name@host` handle, and
    /// any local URL that does not name an actor, is [`AppError::NotFound`].
    pub fn parse(input: &str, local_domain: &str) -> Result<Self, AppError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AppError::NotFound);
        }

        if has_http_scheme(input) {
            return Self::parse_url(input, local_domain);
        }

        let (kind, name, host) = split_handle(input).ok_or(AppError::NotFound)?;
        Ok(Self::Handle {
            name: name.to_string(),
            host: host.to_ascii_lowercase(),
            kind,
        })
    }

    fn parse_url(input: &str, local_domain: &str) -> Result<Self, AppError> {
        let mut url = Url::parse(input).map_err(|_| AppError::NotFound)?;
        let authority = url_authority(&url).ok_or(AppError::NotFound)?;
        url.set_fragment(None);

        if !authority.eq_ignore_ascii_case(local_domain) {
            return Ok(Self::RemoteUrl(url));
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [segment, name] => {
                let kind = ActorKind::from_path_segment(segment).ok_or(AppError::NotFound)?;
                Ok(Self::LocalUrl {
                    kind,
                    name: (*name).to_string(),
                })
            }
            _ => Err(AppError::NotFound),
        }
    }

    /// Host the reference points at; `None` for local URLs.
    pub fn remote_host(&self) -> Option<String> {
        match self {
            Self::LocalUrl { .. } => None,
            Self::RemoteUrl(url) => url.host_str().map(str::to_ascii_lowercase),
            Self::Handle { host, .. } => Some(host.clone()),
        }
    }
}

impl fmt::Display for ActorReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalUrl { kind, name } => write!(f, "/{}/{}", kind.path_segment(), name),
            Self::RemoteUrl(url) => write!(f, "{}", url),
            Self::Handle { name, host, kind } => {
                write!(f, "{}{}@{}", handle_sigil(*kind), name, host)
            }
        }
    }
}

/// `host[:port]` of a URL, port only when given explicitly.
pub(crate) fn url_authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Canonical string form of a reference, used as a cache key.
///
/// URLs: host lowercased, fragment dropped, trailing slash stripped.
/// Handles: `acct:` stripped, host lowercased, `@`/`!` kept since they
/// select different actors. Anything unparseable is returned trimmed.
pub fn normalize_reference(input: &str) -> String {
    let input = input.trim();

    if has_http_scheme(input) {
        if let Ok(mut url) = Url::parse(input) {
            url.set_fragment(None);
            return url.as_str().trim_end_matches('/').to_string();
        }
        return input.to_string();
    }

    match split_handle(input) {
        Some((kind, name, host)) => {
            format!("{}{}@{}", handle_sigil(kind), name, host.to_ascii_lowercase())
        }
        None => input.to_string(),
    }
}

fn has_http_scheme(input: &str) -> bool {
    let lower = input.get(..8).unwrap_or(input).to_ascii_lowercase();
    lower.starts_with("https://") || lower.starts_with("http://")
}

fn split_handle(input: &str) -> Option<(Option<ActorKind>, &str, &str)> {
    let (kind, input) = if let Some(rest) = input.strip_prefix("acct:") {
        (None, rest)
    } else if let Some(rest) = input.strip_prefix('@') {
        (Some(ActorKind::User), rest)
    } else if let Some(rest) = input.strip_prefix('!') {
        (Some(ActorKind::Community), rest)
    } else {
        (None, input)
    };

    let (name, host) = input.split_once('@')?;
    let valid = |part: &str| {
        !part.is_empty() && !part.contains(|c: char| c == '/' || c == '@' || c.is_whitespace())
    };
    (valid(name) && valid(host)).then_some((kind, name, host))
}

fn handle_sigil(kind: Option<ActorKind>) -> &'static str {
    match kind {
        Some(ActorKind::User) => "@",
        Some(ActorKind::Community) => "!",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &str = "local.example";

    #[test]
    fn local_urls_map_path_to_kind() {
        for (path, kind) in [
            ("u/alice", ActorKind::User),
            ("c/rust", ActorKind::Community),
            ("f/news", ActorKind::Feed),
        ] {
            let parsed = ActorReference::parse(&format!("https://local.example/{}", path), LOCAL)
                .unwrap();
            assert_eq!(
                parsed,
                ActorReference::LocalUrl {
                    kind,
                    name: path[2..].to_string()
                }
            );
        }
    }

    #[test]
    fn local_url_matches_host_case_insensitively_and_ignores_trailing_slash() {
        let parsed = ActorReference::parse("https://LOCAL.example/u/alice/", LOCAL).unwrap();
        assert_eq!(
            parsed,
            ActorReference::LocalUrl {
                kind: ActorKind::User,
                name: "alice".to_string()
            }
        );
    }

    #[test]
    fn local_url_with_unknown_shape_is_not_found() {
        for input in [
            "https://local.example/",
            "https://local.example/users/alice",
            "https://local.example/u/alice/followers",
        ] {
            assert!(
                matches!(ActorReference::parse(input, LOCAL), Err(AppError::NotFound)),
                "{input} should not resolve"
            );
        }
    }

    #[test]
    fn explicit_port_is_part_of_the_authority() {
        let parsed = ActorReference::parse("https://local.example:8443/u/alice", LOCAL).unwrap();
        assert!(matches!(parsed, ActorReference::RemoteUrl(_)));

        let parsed =
            ActorReference::parse("http://localhost:3000/c/rust", "localhost:3000").unwrap();
        assert!(matches!(parsed, ActorReference::LocalUrl { .. }));
    }

    #[test]
    fn remote_url_drops_fragment() {
        let parsed =
            ActorReference::parse("https://piefed.social/c/piefed_meta#main-key", LOCAL).unwrap();
        match parsed {
            ActorReference::RemoteUrl(url) => {
                assert_eq!(url.as_str(), "https://piefed.social/c/piefed_meta")
            }
            other => panic!("expected remote url, got: {other:?}"),
        }
    }

    #[test]
    fn handles_accept_common_prefixes() {
        for (input, kind) in [
            ("alice@Remote.Example", None),
            ("acct:alice@remote.example", None),
            ("@alice@remote.example", Some(ActorKind::User)),
            ("!alice@remote.example", Some(ActorKind::Community)),
        ] {
            assert_eq!(
                ActorReference::parse(input, LOCAL).unwrap(),
                ActorReference::Handle {
                    name: "alice".to_string(),
                    host: "remote.example".to_string(),
                    kind,
                },
                "{input}"
            );
        }
    }

    #[test]
    fn garbage_is_not_found() {
        for input in ["", "   ", "alice", "alice@", "@remote.example", "ftp://x/u/a", "https://"] {
            assert!(
                matches!(ActorReference::parse(input, LOCAL), Err(AppError::NotFound)),
                "{input:?} should not parse"
            );
        }
    }

    #[test]
    fn normalization_collapses_equivalent_spellings() {
        assert_eq!(
            normalize_reference("https://Remote.Example/u/alice/#main-key"),
            "https://remote.example/u/alice"
        );
        assert_eq!(
            normalize_reference(" alice@Remote.Example "),
            normalize_reference("acct:alice@remote.example")
        );
        assert_eq!(
            normalize_reference("!Meta@Remote.Example"),
            "!Meta@remote.example"
        );
    }

    #[test]
    fn user_and_community_handles_normalize_apart() {
        assert_ne!(
            normalize_reference("@bob@remote.example"),
            normalize_reference("!bob@remote.example")
        );
        assert_ne!(
            normalize_reference("bob@remote.example"),
            normalize_reference("!bob@remote.example")
        );
        let parsed = ActorReference::parse("!bob@remote.example", LOCAL).unwrap();
        assert_eq!(parsed.to_string(), "!bob@remote.example");
        assert_eq!(normalize_reference("not a reference"), "not a reference");
    }
}
