use std::collections::HashMap;

use serde_json::{Map, Value};

/// Opaque credential map handed to [`SmsService::configure`].
pub type Credentials = HashMap<String, String>;

/// Backend-specific extras attached to send/status results. Never typed
/// per backend; consumers treat it as a bag of strings and numbers.
pub type Details = Map<String, Value>;

pub const DELIVERY_PENDING: &str = "pending";
pub const DELIVERY_SENT: &str = "sent";
pub const DELIVERY_DELIVERED: &str = "delivered";
pub const DELIVERY_FAILED: &str = "failed";
pub const DELIVERY_UNKNOWN: &str = "unknown";

/// Outcome of a single send attempt.
///
/// `send` never fails across the trait boundary: transport errors, auth
/// errors and rate limits all land here with `success == false`.
#[derive(Debug, Clone, Default)]
pub struct SendResult {
    pub success: bool,
    /// Provider's own tracking reference for the message, when it
    /// produced one.
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub details: Details,
}

impl SendResult {
    pub fn ok(message_id: impl Into<String>, details: Details) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
            details,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
            details: Details::new(),
        }
    }

    pub fn failure_with_details(error: impl Into<String>, details: Details) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
            details,
        }
    }
}

/// Delivery state of a previously sent message.
#[derive(Debug, Clone)]
pub struct StatusResult {
    /// One of the `DELIVERY_*` constants when the backend vocabulary is
    /// recognized; the raw backend status otherwise.
    pub status: String,
    pub error: Option<String>,
    pub details: Details,
}

impl StatusResult {
    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            status: DELIVERY_UNKNOWN.to_string(),
            error: Some(error.into()),
            details: Details::new(),
        }
    }
}

/// Capability contract over a concrete SMS backend.
///
/// Implementations own their HTTP plumbing and timeouts; callers only
/// ever see the normalized result shapes above.
pub trait SmsService: Send {
    fn name(&self) -> &str;

    fn is_configured(&self) -> bool;

    /// Provider-advertised daily message allowance.
    fn daily_limit(&self) -> i64;

    /// Applies and live-validates credentials. Returns `false` on any
    /// missing field or validation failure, in which case no partial
    /// credential state is committed.
    fn configure(&mut self, credentials: &Credentials) -> bool;

    fn validate_credentials(&self) -> bool;

    fn send(&self, recipient: &str, body: &str) -> SendResult;

    /// Remaining sends within the provider's own accounting period;
    /// zero when unconfigured or the backend cannot be reached.
    fn remaining_quota(&self) -> i64;

    fn delivery_status(&self, message_id: &str) -> StatusResult;
}

/// Internal transport errors. Normalized into result fields before they
/// reach the trait boundary.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Maps a backend status word through an explicit lookup table.
/// Unrecognized statuses pass through unchanged rather than erroring.
pub(crate) fn map_status(table: &[(&str, &str)], raw: &str) -> String {
    for (backend, normalized) in table {
        if backend.eq_ignore_ascii_case(raw) {
            return (*normalized).to_string();
        }
    }
    raw.to_string()
}

pub(crate) fn required_field<'a>(credentials: &'a Credentials, key: &str) -> Option<&'a str> {
    credentials
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}
