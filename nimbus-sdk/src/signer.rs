//! Signer - SDK-HMAC-SHA256 request signing
//!
//! Every API call is authenticated by an HMAC over a canonical form of the
//! request. The signature covers the method, path, query, every header
//! present at signing time and a SHA-256 digest of the body. The timestamp is
//! carried in `X-Sdk-Date`, which is itself signed.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Read;

use aws_lc_rs::digest::{self, Context, SHA256};
use aws_lc_rs::hmac;
use chrono::{DateTime, NaiveDateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use url::Url;

pub const ALGORITHM: &str = "SDK-HMAC-SHA256";
pub const HEADER_DATE: &str = "X-Sdk-Date";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_SECURITY_TOKEN: &str = "X-Security-Token";
pub const HEADER_HOST: &str = "host";
const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// RFC 3986 unreserved characters are left as-is, everything else is encoded
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("failed to read request body: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid X-Sdk-Date header '{0}', expected YYYYMMDDTHHMMSSZ")]
    InvalidDate(String),

    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

/// Access key pair, with a security token for temporary credentials
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub security_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            security_token: None,
        }
    }

    pub fn with_security_token(mut self, token: impl Into<String>) -> Self {
        self.security_token = Some(token.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the secret in debug output
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("security_token", &self.security_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// The parts of an HTTP request that take part in signing
#[derive(Debug, Clone, PartialEq)]
pub struct SigningRequest {
    pub method: String,
    pub url: Url,
    /// Headers in insertion order; names are matched case-insensitively
    pub headers: Vec<(String, String)>,
}

impl SigningRequest {
    pub fn new(method: impl Into<String>, url: Url) -> Self {
        Self {
            method: method.into(),
            url,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Request body to hash
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    Stream(&'a mut dyn Read),
}

impl Payload<'_> {
    fn sha256_hex(self) -> Result<String, SignError> {
        match self {
            Payload::Bytes(bytes) => Ok(hex(digest::digest(&SHA256, bytes).as_ref())),
            Payload::Stream(reader) => {
                let mut ctx = Context::new(&SHA256);
                let mut buf = [0u8; 8192];
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    ctx.update(&buf[..n]);
                }
                Ok(hex(ctx.finish().as_ref()))
            }
        }
    }
}

/// Sign `request` with the current time, unless it already carries an
/// `X-Sdk-Date` header.
pub fn sign(
    request: &mut SigningRequest,
    payload: Payload<'_>,
    credentials: &Credentials,
) -> Result<(), SignError> {
    sign_at(request, payload, credentials, Utc::now())
}

/// Sign `request`, using `now` when no `X-Sdk-Date` header is present.
///
/// On success the request gains `X-Sdk-Date`, `host`, the security token if
/// any, and `Authorization`. On failure it is left untouched.
pub fn sign_at(
    request: &mut SigningRequest,
    payload: Payload<'_>,
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<(), SignError> {
    let timestamp = match request.header(HEADER_DATE) {
        Some(existing) => parse_date(existing)?,
        None => now,
    };
    let host = host_of(&request.url)?;
    let body_hash = payload.sha256_hex()?;

    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case(HEADER_AUTHORIZATION))
        .cloned()
        .collect();
    let date = timestamp.format(DATE_FORMAT).to_string();
    if !has_header(&headers, HEADER_DATE) {
        headers.push((HEADER_DATE.to_string(), date.clone()));
    }
    if let Some(ref token) = credentials.security_token
        && !has_header(&headers, HEADER_SECURITY_TOKEN)
    {
        headers.push((HEADER_SECURITY_TOKEN.to_string(), token.clone()));
    }
    match headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case(HEADER_HOST))
    {
        Some((_, value)) => *value = host,
        None => headers.push((HEADER_HOST.to_string(), host)),
    }

    let canonical = CanonicalHeaders::new(&headers);
    let canonical_request = canonical_request(&request.method, &request.url, &canonical, &body_hash);
    let string_to_sign = string_to_sign(&date, &canonical_request);
    let signature = signature(&credentials.secret_key, &string_to_sign);

    headers.push((
        HEADER_AUTHORIZATION.to_string(),
        format!(
            "{} Access={}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            credentials.access_key,
            canonical.signed_names(),
            signature
        ),
    ));
    request.headers = headers;
    Ok(())
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, SignError> {
    NaiveDateTime::parse_from_str(value.trim(), DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| SignError::InvalidDate(value.to_string()))
}

fn host_of(url: &Url) -> Result<String, SignError> {
    let host = url
        .host_str()
        .ok_or_else(|| SignError::InvalidUrl(format!("{} has no host", url)))?;
    // Url::port is None for the scheme's default port
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

/// Lower-cased, sorted headers with trimmed values. Repeated headers are
/// joined with commas.
struct CanonicalHeaders(BTreeMap<String, Vec<String>>);

impl CanonicalHeaders {
    fn new(headers: &[(String, String)]) -> Self {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            map.entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.trim().to_string());
        }
        Self(map)
    }

    fn canonical(&self) -> String {
        let mut out = String::new();
        for (name, values) in &self.0 {
            let _ = writeln!(out, "{}:{}", name, values.join(","));
        }
        out
    }

    fn signed_names(&self) -> String {
        self.0.keys().map(String::as_str).collect::<Vec<_>>().join(";")
    }
}

fn canonical_uri(url: &Url) -> String {
    let mut uri: String = url
        .path()
        .split('/')
        .map(|segment| {
            let decoded = percent_decode_str(segment).decode_utf8_lossy();
            utf8_percent_encode(&decoded, UNRESERVED).to_string()
        })
        .collect::<Vec<_>>()
        .join("/");
    if !uri.starts_with('/') {
        uri.insert(0, '/');
    }
    if !uri.ends_with('/') {
        uri.push('/');
    }
    uri
}

fn canonical_query(url: &Url) -> String {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        params
            .entry(utf8_percent_encode(&key, UNRESERVED).to_string())
            .or_default()
            .push(utf8_percent_encode(&value, UNRESERVED).to_string());
    }

    let mut pairs = Vec::new();
    for (key, mut values) in params {
        values.sort();
        for value in values {
            pairs.push(format!("{}={}", key, value));
        }
    }
    pairs.join("&")
}

fn canonical_request(
    method: &str,
    url: &Url,
    headers: &CanonicalHeaders,
    body_hash: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        canonical_uri(url),
        canonical_query(url),
        headers.canonical(),
        headers.signed_names(),
        body_hash
    )
}

fn string_to_sign(date: &str, canonical_request: &str) -> String {
    format!(
        "{}\n{}\n{}",
        ALGORITHM,
        date,
        hex(digest::digest(&SHA256, canonical_request.as_bytes()).as_ref())
    )
}

fn signature(secret_key: &str, string_to_sign: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret_key.as_bytes());
    hex(hmac::sign(&key, string_to_sign.as_bytes()).as_ref())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
