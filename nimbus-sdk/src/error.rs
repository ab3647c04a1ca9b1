//! SDK error types

use nimbus_core::provider::{ErrorKind, ProviderError};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::signer::SignError;

/// Vendor error codes meaning "another operation on this resource is in
/// progress". They come back as 400 or 403 and are worth retrying once the
/// resource settles.
pub const BUSY_ERROR_CODES: &[&str] = &[
    "VPC.0003",
    "VPC.0409",
    "Ecs.0319",
    "DBS.200019",
    "DBS.200047",
    "DMS.00400026",
];

/// How an API error response should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Default404,
    Default400,
    Conflict,
    Throttled,
    Server,
    UnexpectedResponseCode,
}

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("failed to sign request: {0}")]
    Sign(#[from] SignError),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("API error ({status}) {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        body: String,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, SdkError>;

impl SdkError {
    /// Build an API error from a non-success response, extracting the vendor
    /// code and message from whichever body layout the service uses
    pub fn from_response(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let (code, message) = parse_error_body(&body);
        SdkError::Api {
            status,
            code,
            message,
            body,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SdkError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            SdkError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Classification of an API error; `None` for errors that never got a
    /// response
    pub fn class(&self) -> Option<ErrorClass> {
        let SdkError::Api { status, code, .. } = self else {
            return None;
        };
        let class = match *status {
            404 => ErrorClass::Default404,
            409 => ErrorClass::Conflict,
            429 => ErrorClass::Throttled,
            400 | 403 if BUSY_ERROR_CODES.contains(&code.as_str()) => ErrorClass::Conflict,
            400 => ErrorClass::Default400,
            500..=599 => ErrorClass::Server,
            _ => ErrorClass::UnexpectedResponseCode,
        };
        Some(class)
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == Some(ErrorClass::Default404)
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == Some(ErrorClass::Conflict)
    }
}

/// Extract (code, message) from an error body.
///
/// Services answer with one of `{"error_code", "error_msg"}`,
/// `{"code", "message"}` or `{"error": {"code", "message"}}`. Anything else
/// yields an empty code and the raw body as message.
fn parse_error_body(body: &str) -> (String, String) {
    let Ok(json) = serde_json::from_str::<JsonValue>(body) else {
        return (String::new(), body.trim().to_string());
    };

    let object = match json.get("error") {
        Some(inner) if inner.is_object() => inner,
        _ => &json,
    };
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| object.get(*name))
            .map(|v| match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
    };

    let code = field(&["error_code", "code", "errCode"]).unwrap_or_default();
    let message = field(&["error_msg", "message", "error_message", "errMsg"])
        .unwrap_or_else(|| body.trim().to_string());
    (code, message)
}

impl From<SdkError> for ProviderError {
    fn from(err: SdkError) -> Self {
        let kind = match &err {
            SdkError::Sign(_) | SdkError::Url(_) => ErrorKind::Config,
            SdkError::Transport { .. } => ErrorKind::Transport,
            SdkError::Decode { .. } => ErrorKind::Api,
            SdkError::Api { .. } => match err.class() {
                Some(ErrorClass::Default404) => ErrorKind::NotFound,
                Some(ErrorClass::Conflict) => ErrorKind::Conflict,
                Some(ErrorClass::Throttled) => ErrorKind::Transport,
                _ => ErrorKind::Api,
            },
        };
        ProviderError::with_kind(kind, err.to_string())
    }
}
