//! AWS Signature Version 4, implemented from scratch on top of `hmac` and
//! `sha2` — no AWS SDK, matching the way the pack's other S3 connectors
//! sign requests.
//!
//! One deliberate deviation from the textbook SigV4 recipe: the
//! string-to-sign's timestamp line uses an RFC 1123 date rather than the
//! usual ISO-8601 basic `amz-date`. That is what this registry's storage
//! backend expects, so canonical-header construction and the string-to-sign
//! both key off the same `Date` header.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Hex-encoded SHA-256 of `data` (the empty slice hashes to the
/// well-known empty-string digest).
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Caches a derived signing key by `(yyyymmdd, region)`: the key is valid
/// for the whole UTC day, so a fresh request on the same day reuses it
/// instead of recomputing four HMACs.
#[derive(Default)]
pub struct SigningKeyCache {
    cached: Mutex<Option<((String, String), Vec<u8>)>>,
}

impl SigningKeyCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn derive(&self, date_stamp: &str, region: &str, secret_key: &str) -> Vec<u8> {
        let mut guard = self.cached.lock().expect("signing key cache poisoned");
        if let Some(((cached_date, cached_region), key)) = guard.as_ref() {
            if cached_date == date_stamp && cached_region == region {
                return key.clone();
            }
        }
        let key = derive_signing_key(secret_key, date_stamp, region, "s3");
        *guard = Some(((date_stamp.to_string(), region.to_string()), key.clone()));
        key
    }
}

/// URI-encode per RFC 3986, as SigV4 canonical requests require.
pub fn uri_encode(s: &str, encode_slash: bool) -> String {
    let mut out = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn canonical_query_string(query: &BTreeMap<String, String>) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_headers_string(headers: &BTreeMap<String, String>) -> String {
    headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k.to_lowercase(), v.trim()))
        .collect()
}

fn signed_headers_string(headers: &BTreeMap<String, String>) -> String {
    let mut keys: Vec<String> = headers.keys().map(|k| k.to_lowercase()).collect();
    keys.sort();
    keys.join(";")
}

/// `METHOD \n URI \n sorted-querystring \n canonical-headers \n
/// signed-headers \n sha256(payload)`.
pub fn canonical_request(
    method: &str,
    path: &str,
    query: &BTreeMap<String, String>,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        uri_encode(path, false),
        canonical_query_string(query),
        canonical_headers_string(headers),
        signed_headers_string(headers),
        payload_hash,
    )
}

pub fn scope(date_stamp: &str, region: &str) -> String {
    format!("{}/{}/s3/aws4_request", date_stamp, region)
}

/// `AWS4-HMAC-SHA256 \n RFC1123-date \n scope \n sha256(canonical-request)`.
pub fn string_to_sign(rfc1123_date: &str, date_stamp: &str, region: &str, canonical_req: &str) -> String {
    format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        rfc1123_date,
        scope(date_stamp, region),
        sha256_hex(canonical_req.as_bytes()),
    )
}

pub fn sign(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

pub fn authorization_header(
    access_key: &str,
    date_stamp: &str,
    region: &str,
    signed_headers: &str,
    signature: &str,
) -> String {
    format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        access_key,
        scope(date_stamp, region),
        signed_headers,
        signature,
    )
}

pub fn rfc1123_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn date_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn signing_is_deterministic_for_a_fixed_timestamp() {
        let now = Utc.ymd(2015, 8, 30).and_hms(0, 0, 0);
        let date_stamp = date_stamp(now);
        let rfc1123 = rfc1123_date(now);

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "s3-us-west-2.amazonaws.com".to_string());
        headers.insert("date".to_string(), rfc1123.clone());
        headers.insert("x-amz-content-sha256".to_string(), sha256_hex(b""));

        let query = BTreeMap::new();
        let canonical = canonical_request("GET", "/bucket/key", &query, &headers, &sha256_hex(b""));
        let sts = string_to_sign(&rfc1123, &date_stamp, "us-west-2", &canonical);

        let cache = SigningKeyCache::new();
        let key1 = cache.derive(&date_stamp, "us-west-2", "secret");
        let key2 = cache.derive(&date_stamp, "us-west-2", "secret");
        assert_eq!(key1, key2, "same (date, region) must hit the cache");

        let sig1 = sign(&key1, &sts);
        let sig2 = sign(&key2, &sts);
        assert_eq!(sig1, sig2);

        let auth1 = authorization_header(
            "AKIDEXAMPLE",
            &date_stamp,
            "us-west-2",
            &signed_headers_string(&headers),
            &sig1,
        );
        let auth2 = authorization_header(
            "AKIDEXAMPLE",
            &date_stamp,
            "us-west-2",
            &signed_headers_string(&headers),
            &sig2,
        );
        assert_eq!(auth1, auth2);
    }

    #[test]
    fn signing_key_cache_rederives_on_a_new_day() {
        let cache = SigningKeyCache::new();
        let key_aug30 = cache.derive("20150830", "us-west-2", "secret");
        let key_aug31 = cache.derive("20150831", "us-west-2", "secret");
        assert_ne!(key_aug30, key_aug31);
    }

    #[test]
    fn uri_encode_preserves_unreserved_characters() {
        assert_eq!(uri_encode("abcXYZ019-_.~", false), "abcXYZ019-_.~");
        assert_eq!(uri_encode("a b", false), "a%20b");
        assert_eq!(uri_encode("a/b", false), "a/b");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
    }
}
