//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Everything here is byte-for-byte interoperable with peers: the signing
//! string layout, the `Signature` header field order and the `Digest` value
//! format must not drift.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::keys::{parse_private_key, parse_public_key};
use crate::error::AppError;

/// Pseudo-header covering method and path
pub const REQUEST_TARGET: &str = "(request-target)";

/// Algorithm name written into outgoing `Signature` headers
pub const RSA_SHA256: &str = "rsa-sha256";

/// Maximum accepted clock skew for inbound `Date` headers
const MAX_DATE_SKEW_SECS: i64 = 300;

/// Why a signature did not verify
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Well-formed input, but the signature is not valid for it
    #[error("Signature does not match")]
    SignatureMismatch,

    /// Input could not be checked at all
    #[error("Malformed signature input: {0}")]
    MalformedInput(String),
}

impl From<VerificationError> for AppError {
    fn from(err: VerificationError) -> Self {
        AppError::Validation(err.to_string())
    }
}

/// Parsed `Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureParameters {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Covered header names, lowercased, in signing order
    pub covered_headers: Vec<String>,
    /// Raw signature bytes
    pub signature: Vec<u8>,
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn calculate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Current time as an HTTP `Date` header value (IMF-fixdate).
pub fn http_date_now() -> String {
    format_http_date(Utc::now())
}

pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Build the string that gets signed
///
/// For each name in `order`: `(request-target)` becomes
/// `(request-target): {method} {path}` with the method lowercased, anything
/// else becomes `{name}: {value}` with the value looked up case-insensitively
/// in `headers`. Lines are joined with `\n`.
///
/// # Errors
/// `MalformedInput` if a covered header has no value.
pub fn build_signing_string<N, V>(
    method: &str,
    path: &str,
    headers: &[(N, V)],
    order: &[&str],
) -> Result<String, VerificationError>
where
    N: AsRef<str>,
    V: AsRef<str>,
{
    let mut lines = Vec::with_capacity(order.len());

    for name in order {
        let name = name.to_ascii_lowercase();
        if name == REQUEST_TARGET {
            lines.push(format!(
                "{}: {} {}",
                REQUEST_TARGET,
                method.to_ascii_lowercase(),
                path
            ));
            continue;
        }

        let value = headers
            .iter()
            .find(|(header, _)| header.as_ref().eq_ignore_ascii_case(&name))
            .map(|(_, value)| value.as_ref())
            .ok_or_else(|| {
                VerificationError::MalformedInput(format!("Missing {} header", name))
            })?;
        lines.push(format!("{}: {}", name, value));
    }

    Ok(lines.join("\n"))
}

/// RSA-SHA256 (PKCS#1 v1.5) signature over the signing string
///
/// # Errors
/// `Crypto` if the private key cannot be parsed or signing fails.
pub fn sign(signing_string: &str, private_key_pem: &str) -> Result<Vec<u8>, AppError> {
    let private_key = parse_private_key(private_key_pem)?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let signature = signing_key
        .try_sign(signing_string.as_bytes())
        .map_err(|e| AppError::Crypto(format!("Signing failed: {}", e)))?;
    Ok(signature.to_vec())
}

/// Check a signature against a signing string and public key
pub fn verify(
    signature: &[u8],
    signing_string: &str,
    public_key_pem: &str,
) -> Result<(), VerificationError> {
    let public_key = parse_public_key(public_key_pem)
        .map_err(|e| VerificationError::MalformedInput(e.to_string()))?;
    let verifier = VerifyingKey::<Sha256>::new(public_key);

    let signature = Pkcs1v15Signature::try_from(signature)
        .map_err(|e| VerificationError::MalformedInput(format!("Invalid signature: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| VerificationError::SignatureMismatch)
}

/// Serialize a `Signature` header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="h1 h2 ...",signature="<base64>"
/// ```
pub fn serialize_signature_header(
    key_id: &str,
    algorithm: &str,
    covered_headers: &[&str],
    signature: &[u8],
) -> String {
    format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id,
        algorithm,
        covered_headers.join(" "),
        BASE64.encode(signature)
    )
}

/// Parse a `Signature` header value
///
/// Fields may appear in any order; names compare case-insensitively and
/// unknown fields are ignored. Commas inside quoted values do not split.
pub fn parse_signature(header: &str) -> Result<SignatureParameters, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in split_outside_quotes(header) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);

        match key.trim().to_ascii_lowercase().as_str() {
            "keyid" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    let missing = |field: &str| AppError::MalformedSignatureHeader(format!("Missing {}", field));
    let signature = signature.ok_or_else(|| missing("signature"))?;
    let signature = BASE64.decode(signature.as_bytes()).map_err(|e| {
        AppError::MalformedSignatureHeader(format!("Invalid signature encoding: {}", e))
    })?;

    Ok(SignatureParameters {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        algorithm: algorithm.ok_or_else(|| missing("algorithm"))?,
        covered_headers: headers.ok_or_else(|| missing("headers"))?,
        signature,
    })
}

fn split_outside_quotes(header: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (index, ch) in header.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(header[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(header[start..].trim());
    parts.retain(|part| !part.is_empty());
    parts
}

/// Verify an inbound HTTP request signature
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path including query
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - Sender's RSA public key
///
/// # Returns
/// The parsed signature parameters (so callers can match `key_id` to the
/// activity actor).
pub fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<SignatureParameters, VerificationError> {
    let result = verify_request_inner(method, path, headers, body, public_key_pem);

    let label = match &result {
        Ok(_) => "valid",
        Err(VerificationError::SignatureMismatch) => "mismatch",
        Err(VerificationError::MalformedInput(_)) => "malformed",
    };
    crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL
        .with_label_values(&[label])
        .inc();

    result
}

fn verify_request_inner(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<SignatureParameters, VerificationError> {
    let malformed = |msg: &str| VerificationError::MalformedInput(msg.to_string());

    // 1. Parse Signature header
    let signature_header = header_str(headers, "signature")?
        .ok_or_else(|| malformed("Missing Signature header"))?;
    let parsed = parse_signature(signature_header)
        .map_err(|e| VerificationError::MalformedInput(e.to_string()))?;

    // 2. Validate algorithm and required signed headers.
    if parsed.algorithm != RSA_SHA256 && parsed.algorithm != "hs2019" {
        return Err(VerificationError::MalformedInput(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in [REQUEST_TARGET, "host", "date"] {
        if !parsed.covered_headers.iter().any(|h| h == required) {
            return Err(VerificationError::MalformedInput(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.covered_headers.iter().any(|h| h == "digest") {
        return Err(malformed("Signed headers must include: digest"));
    }

    // 3. Verify Date is recent.
    let date_str = header_str(headers, "date")?.ok_or_else(|| malformed("Missing Date header"))?;
    let date =
        DateTime::parse_from_rfc2822(date_str).map_err(|_| malformed("Invalid Date format"))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECS {
        return Err(malformed("Date header too old or in future"));
    }

    // 4. If body present, verify Digest. A digest that does not match the
    // body means the signed content is not what arrived.
    if let Some(body_data) = body {
        let digest_str =
            header_str(headers, "digest")?.ok_or_else(|| malformed("Missing Digest header"))?;
        if digest_str != calculate_digest(body_data) {
            return Err(VerificationError::SignatureMismatch);
        }
    }

    // 5. Reconstruct signing string and verify.
    let mut available = Vec::new();
    for name in &parsed.covered_headers {
        if name == REQUEST_TARGET {
            continue;
        }
        if let Some(value) = header_str(headers, name)? {
            available.push((name.as_str(), value));
        }
    }
    let order: Vec<&str> = parsed.covered_headers.iter().map(String::as_str).collect();
    let signing_string = build_signing_string(method, path, &available, &order)?;

    verify(&parsed.signature, &signing_string, public_key_pem)?;
    Ok(parsed)
}

fn header_str<'a>(
    headers: &'a http::HeaderMap,
    name: &str,
) -> Result<Option<&'a str>, VerificationError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| VerificationError::MalformedInput(format!("Invalid {} header", name)))
        })
        .transpose()
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::keys::tests::test_keypair;
    use http::{HeaderMap, HeaderValue};

    const KEY_ID: &str = "https://remote.example/users/alice#main-key";

    fn signed_headers(path: &str, body: &[u8]) -> HeaderMap {
        let keys = test_keypair();
        let date = http_date_now();
        let digest = calculate_digest(body);
        let values = [
            ("host", "remote.example"),
            ("date", date.as_str()),
            ("digest", digest.as_str()),
            ("content-type", "application/activity+json"),
        ];
        let order = [REQUEST_TARGET, "host", "date", "digest", "content-type"];
        let signing_string = build_signing_string("POST", path, &values, &order).unwrap();
        let signature = sign(&signing_string, &keys.private_key_pem).unwrap();

        let mut headers = HeaderMap::new();
        for (name, value) in values {
            headers.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers.insert(
            "signature",
            HeaderValue::from_str(&serialize_signature_header(
                KEY_ID,
                RSA_SHA256,
                &order,
                &signature,
            ))
            .unwrap(),
        );
        headers
    }

    #[test]
    fn digest_matches_known_vector() {
        assert_eq!(
            calculate_digest(b""),
            "SHA-256=47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn digest_is_deterministic_and_content_sensitive() {
        let body = br#"{"type":"Follow"}"#;
        assert_eq!(calculate_digest(body), calculate_digest(body));
        assert_ne!(
            calculate_digest(body),
            calculate_digest(br#"{"type":"Follow "}"#)
        );
    }

    #[test]
    fn signing_string_follows_order_and_lowercases() {
        let headers = [("Host", "remote.example"), ("Date", "Tue, 07 Jun 2022 20:51:35 GMT")];
        let signing_string =
            build_signing_string("POST", "/inbox?x=1", &headers, &[REQUEST_TARGET, "host", "date"])
                .unwrap();

        assert_eq!(
            signing_string,
            "(request-target): post /inbox?x=1\nhost: remote.example\ndate: Tue, 07 Jun 2022 20:51:35 GMT"
        );
    }

    #[test]
    fn signing_string_reports_missing_header() {
        let headers: [(&str, &str); 0] = [];
        match build_signing_string("GET", "/", &headers, &["host"]) {
            Err(VerificationError::MalformedInput(msg)) => assert!(msg.contains("host")),
            other => panic!("expected malformed input, got: {other:?}"),
        }
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let keys = test_keypair();
        let signing_string = "(request-target): post /inbox\nhost: remote.example";
        let signature = sign(signing_string, &keys.private_key_pem).unwrap();

        assert_eq!(verify(&signature, signing_string, &keys.public_key_pem), Ok(()));
    }

    #[test]
    fn tampered_body_digest_is_a_mismatch() {
        let keys = test_keypair();
        let body = br#"{"type":"Create","id":"https://example.com/activities/1"}"#;
        let values = [("digest", calculate_digest(body))];
        let order = ["digest"];
        let original = build_signing_string("POST", "/inbox", &values, &order).unwrap();
        let signature = sign(&original, &keys.private_key_pem).unwrap();

        let mut tampered = body.to_vec();
        tampered[10] ^= 0x01;
        let values = [("digest", calculate_digest(&tampered))];
        let tampered_string = build_signing_string("POST", "/inbox", &values, &order).unwrap();

        assert_eq!(
            verify(&signature, &tampered_string, &keys.public_key_pem),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn verify_with_bad_public_key_is_malformed_not_mismatch() {
        assert!(matches!(
            verify(b"sig", "data", "not a pem"),
            Err(VerificationError::MalformedInput(_))
        ));
    }

    #[test]
    fn sign_with_bad_private_key_is_crypto_error() {
        assert!(matches!(sign("data", "not a pem"), Err(AppError::Crypto(_))));
    }

    #[test]
    fn header_serializes_in_fixed_field_order() {
        let header = serialize_signature_header(
            KEY_ID,
            RSA_SHA256,
            &[REQUEST_TARGET, "host", "date"],
            b"fake",
        );
        assert_eq!(
            header,
            "keyId=\"https://remote.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"ZmFrZQ==\""
        );
    }

    #[test]
    fn parse_is_order_independent_and_case_insensitive() {
        let parsed = parse_signature(
            "signature=\"ZmFrZQ==\", HEADERS=\"(request-target) Host date\",algorithm=\"rsa-sha256\", keyid=\"https://remote.example/users/alice#main-key\"",
        )
        .unwrap();

        assert_eq!(parsed.key_id, KEY_ID);
        assert_eq!(parsed.algorithm, "rsa-sha256");
        assert_eq!(parsed.covered_headers, vec!["(request-target)", "host", "date"]);
        assert_eq!(parsed.signature, b"fake");
    }

    #[test]
    fn parse_keeps_commas_inside_quotes() {
        let parsed = parse_signature(
            "keyId=\"https://remote.example/key,1\",algorithm=\"rsa-sha256\",headers=\"date\",signature=\"ZmFrZQ==\",extra=\"a,b\"",
        )
        .unwrap();
        assert_eq!(parsed.key_id, "https://remote.example/key,1");
    }

    #[test]
    fn parse_rejects_missing_fields_and_bad_base64() {
        for header in [
            "algorithm=\"rsa-sha256\",headers=\"date\",signature=\"ZmFrZQ==\"",
            "keyId=\"k\",headers=\"date\",signature=\"ZmFrZQ==\"",
            "keyId=\"k\",algorithm=\"rsa-sha256\",signature=\"ZmFrZQ==\"",
            "keyId=\"k\",algorithm=\"rsa-sha256\",headers=\"date\"",
            "keyId=\"k\",algorithm=\"rsa-sha256\",headers=\"date\",signature=\"***\"",
        ] {
            assert!(
                matches!(
                    parse_signature(header),
                    Err(AppError::MalformedSignatureHeader(_))
                ),
                "header should be rejected: {header}"
            );
        }
    }

    #[test]
    fn verify_request_accepts_valid_signed_request() {
        let body = br#"{"type":"Follow"}"#;
        let headers = signed_headers("/inbox?foo=bar", body);

        let parsed = verify_request(
            "POST",
            "/inbox?foo=bar",
            &headers,
            Some(body),
            &test_keypair().public_key_pem,
        )
        .expect("valid signature should verify");
        assert_eq!(parsed.key_id, KEY_ID);
    }

    #[test]
    fn verify_request_reports_tampered_body_as_mismatch() {
        let body = br#"{"type":"Follow"}"#;
        let headers = signed_headers("/inbox", body);

        assert_eq!(
            verify_request(
                "POST",
                "/inbox",
                &headers,
                Some(br#"{"type":"Block"}"#),
                &test_keypair().public_key_pem,
            ),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn verify_request_reports_wrong_path_as_mismatch() {
        let body = br#"{"type":"Follow"}"#;
        let headers = signed_headers("/inbox", body);

        assert_eq!(
            verify_request(
                "POST",
                "/users/bob/inbox",
                &headers,
                Some(body),
                &test_keypair().public_key_pem,
            ),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn verify_request_rejects_missing_date_header() {
        let body = br#"{"type":"Follow"}"#;
        let mut headers = signed_headers("/inbox", body);
        headers.remove("date");

        match verify_request(
            "POST",
            "/inbox",
            &headers,
            Some(body),
            &test_keypair().public_key_pem,
        ) {
            Err(VerificationError::MalformedInput(msg)) => {
                assert!(msg.contains("Missing Date header"))
            }
            other => panic!("expected missing Date header error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_request_rejects_stale_date() {
        let body = br#"{"type":"Follow"}"#;
        let mut headers = signed_headers("/inbox", body);
        let stale = format_http_date(Utc::now() - chrono::Duration::minutes(30));
        headers.insert("date", HeaderValue::from_str(&stale).unwrap());

        match verify_request(
            "POST",
            "/inbox",
            &headers,
            Some(body),
            &test_keypair().public_key_pem,
        ) {
            Err(VerificationError::MalformedInput(msg)) => assert!(msg.contains("too old")),
            other => panic!("expected stale date error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_request_rejects_when_date_not_in_signed_headers() {
        let body = br#"{"type":"Follow"}"#;
        let mut headers = signed_headers("/inbox", body);
        let parsed = parse_signature(headers.get("signature").unwrap().to_str().unwrap()).unwrap();
        let tampered = serialize_signature_header(
            &parsed.key_id,
            &parsed.algorithm,
            &[REQUEST_TARGET, "host", "digest"],
            &parsed.signature,
        );
        headers.insert("signature", HeaderValue::from_str(&tampered).unwrap());

        match verify_request(
            "POST",
            "/inbox",
            &headers,
            Some(body),
            &test_keypair().public_key_pem,
        ) {
            Err(VerificationError::MalformedInput(msg)) => {
                assert!(msg.contains("Signed headers must include: date"))
            }
            other => panic!("expected missing signed date error, got: {other:?}"),
        }
    }

    #[test]
    fn key_id_matches_actor_accepts_same_actor() {
        assert!(key_id_matches_actor(KEY_ID, "https://remote.example/users/alice"));
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }
}
