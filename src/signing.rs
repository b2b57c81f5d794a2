//! HMAC-SHA256 request signing.
//!
//! Two schemes share the primitives in this module:
//!
//! - **AWS Signature V4** for the S3 object-store backend
//!   ([`derive_signing_key`], [`uri_encode`]).
//! - **Upload API signatures**: every request to the upload API carries
//!   `X-Bizcard-Date` and
//!   `Authorization: BIZCARD-HMAC-SHA256 Credential=<key_id>, Signature=<hex>`,
//!   where the signature is HMAC-SHA256 (keyed by the credential's secret) of
//!
//! ```text
//! METHOD \n PATH \n QUERY \n X-Bizcard-Date \n hex(sha256(body))
//! ```
//!
//! `QUERY` is the raw query string with its `&`-separated pairs sorted
//! ([`canonical_query`]); empty when the request has none.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Authorization scheme name for the upload API.
pub const API_SCHEME: &str = "BIZCARD-HMAC-SHA256";

/// Header carrying the request timestamp (RFC 3339).
pub const DATE_HEADER: &str = "x-bizcard-date";

/// Compute the hex-encoded SHA-256 hash of data.
pub fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute hex-encoded HMAC-SHA256.
pub fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
///
/// Encodes all characters except unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
pub fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Sort the `&`-separated pairs of a raw query string, dropping empty ones.
/// Pairs are compared as sent, so signers must sign the encoding they send.
pub fn canonical_query(raw: &str) -> String {
    let mut pairs: Vec<&str> = raw.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}

fn api_string_to_sign(method: &str, path: &str, query: &str, date: &str, body: &[u8]) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        path,
        canonical_query(query),
        date,
        hex_sha256(body)
    )
}

/// Sign an upload API request, returning the hex signature.
pub fn sign_api_request(
    secret: &str,
    method: &str,
    path: &str,
    query: &str,
    date: &str,
    body: &[u8],
) -> String {
    hex_hmac_sha256(
        secret.as_bytes(),
        api_string_to_sign(method, path, query, date, body).as_bytes(),
    )
}

/// Build the `Authorization` header value for an upload API request.
pub fn api_authorization(key_id: &str, signature: &str) -> String {
    format!("{} Credential={}, Signature={}", API_SCHEME, key_id, signature)
}

/// Parse an `Authorization` header into `(key_id, signature)`.
pub fn parse_api_authorization(header: &str) -> Option<(String, String)> {
    let rest = header.strip_prefix(API_SCHEME)?.trim_start();
    let mut key_id = None;
    let mut signature = None;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("Credential=") {
            key_id = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("Signature=") {
            signature = Some(v.to_string());
        }
    }
    match (key_id, signature) {
        (Some(k), Some(s)) if !k.is_empty() && !s.is_empty() => Some((k, s)),
        _ => None,
    }
}

/// Verify an upload API signature in constant time.
pub fn verify_api_request(
    secret: &str,
    method: &str,
    path: &str,
    query: &str,
    date: &str,
    body: &[u8],
    signature_hex: &str,
) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(api_string_to_sign(method, path, query, date, body).as_bytes());
    mac.verify_slice(&expected).is_ok()
}
