//! TextBelt-style JSON REST backend.
//!
//! Single credential `api_key`; the literal key `"textbelt"` selects
//! the one-message-per-day free tier.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::service::{
    map_status, required_field, Credentials, Details, SendResult, ServiceError, SmsService,
    StatusResult, DELIVERY_DELIVERED, DELIVERY_FAILED, DELIVERY_PENDING, DELIVERY_SENT,
    DELIVERY_UNKNOWN,
};

pub const DEFAULT_API_BASE: &str = "https://textbelt.com";

/// Key that selects the free tier.
pub const FREE_TIER_KEY: &str = "textbelt";

const FREE_TIER_DAILY_LIMIT: i64 = 1;
const PAID_TIER_DAILY_LIMIT: i64 = 1000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const STATUS_TABLE: &[(&str, &str)] = &[
    ("DELIVERED", DELIVERY_DELIVERED),
    ("SENT", DELIVERY_SENT),
    ("SENDING", DELIVERY_PENDING),
    ("PENDING", DELIVERY_PENDING),
    ("FAILED", DELIVERY_FAILED),
    ("UNKNOWN", DELIVERY_UNKNOWN),
];

#[derive(Debug)]
pub struct TextBeltService {
    api_base: String,
    client: reqwest::blocking::Client,
    api_key: Option<String>,
    daily_limit: i64,
}

impl TextBeltService {
    pub fn new() -> Self {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    /// Base-URL override, used by tests to point at a local mock server.
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
            api_key: None,
            daily_limit: PAID_TIER_DAILY_LIMIT,
        }
    }

    fn fetch_quota(&self, api_key: &str) -> Result<TextBeltQuota, ServiceError> {
        let response = self
            .client
            .get(format!("{}/quota/{}", self.api_base, api_key))
            .send()?;
        Ok(response.json()?)
    }

    fn post_text(&self, api_key: &str, recipient: &str, body: &str) -> Result<SendResult, ServiceError> {
        let request = TextBeltSendRequest {
            phone: recipient,
            message: body,
            key: api_key,
        };
        let response = self
            .client
            .post(format!("{}/text", self.api_base))
            .json(&request)
            .send()?;
        let payload: TextBeltSendResponse = response.json()?;

        let mut details = Details::new();
        if let Some(quota) = payload.quota_remaining {
            details.insert("quotaRemaining".to_string(), Value::from(quota));
        }
        if payload.success {
            let mut result = SendResult::ok(payload.text_id.unwrap_or_default(), details);
            // TextBelt reports no id on some tiers; keep the success flag
            // authoritative and the id optional.
            if result.message_id.as_deref() == Some("") {
                result.message_id = None;
            }
            Ok(result)
        } else {
            Ok(SendResult::failure_with_details(
                format!(
                    "TextBelt API error: {}",
                    payload.error.unwrap_or_else(|| "unknown error".to_string())
                ),
                details,
            ))
        }
    }

    fn fetch_status(&self, text_id: &str) -> Result<StatusResult, ServiceError> {
        let response = self
            .client
            .get(format!("{}/status/{}", self.api_base, text_id))
            .send()?;
        let payload: TextBeltStatusResponse = response.json()?;
        let raw_status = payload.status.unwrap_or_default();
        Ok(StatusResult {
            status: map_status(STATUS_TABLE, &raw_status),
            error: None,
            details: Details::new(),
        })
    }
}

impl Default for TextBeltService {
    fn default() -> Self {
        Self::new()
    }
}

impl SmsService for TextBeltService {
    fn name(&self) -> &str {
        "textbelt"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn daily_limit(&self) -> i64 {
        self.daily_limit
    }

    fn configure(&mut self, credentials: &Credentials) -> bool {
        let Some(api_key) = required_field(credentials, "api_key") else {
            error!("missing required TextBelt api_key");
            return false;
        };

        match self.fetch_quota(api_key) {
            Ok(quota) if quota.success => {
                self.daily_limit = if api_key == FREE_TIER_KEY {
                    FREE_TIER_DAILY_LIMIT
                } else {
                    PAID_TIER_DAILY_LIMIT
                };
                self.api_key = Some(api_key.to_string());
                true
            }
            Ok(_) => {
                error!("invalid TextBelt api_key");
                false
            }
            Err(err) => {
                error!("error validating TextBelt api_key: {}", err);
                false
            }
        }
    }

    fn validate_credentials(&self) -> bool {
        match self.api_key.as_deref() {
            Some(api_key) => self
                .fetch_quota(api_key)
                .map(|quota| quota.success)
                .unwrap_or(false),
            None => false,
        }
    }

    fn send(&self, recipient: &str, body: &str) -> SendResult {
        let Some(api_key) = self.api_key.as_deref() else {
            return SendResult::failure("TextBelt service not configured");
        };
        match self.post_text(api_key, recipient, body) {
            Ok(result) => result,
            Err(err) => {
                error!("error sending SMS with TextBelt: {}", err);
                SendResult::failure(format!("Error: {}", err))
            }
        }
    }

    fn remaining_quota(&self) -> i64 {
        let Some(api_key) = self.api_key.as_deref() else {
            return 0;
        };
        match self.fetch_quota(api_key) {
            Ok(quota) if quota.success => quota.quota_remaining.unwrap_or(0),
            Ok(_) => 0,
            Err(err) => {
                error!("error checking TextBelt quota: {}", err);
                0
            }
        }
    }

    fn delivery_status(&self, message_id: &str) -> StatusResult {
        if !self.is_configured() {
            return StatusResult::unknown("TextBelt service not configured");
        }
        match self.fetch_status(message_id) {
            Ok(result) => result,
            Err(err) => {
                error!("error checking TextBelt message status: {}", err);
                StatusResult::unknown(err.to_string())
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct TextBeltSendRequest<'a> {
    phone: &'a str,
    message: &'a str,
    key: &'a str,
}

#[derive(Debug, Deserialize)]
struct TextBeltSendResponse {
    success: bool,
    #[serde(rename = "textId")]
    text_id: Option<String>,
    #[serde(rename = "quotaRemaining")]
    quota_remaining: Option<i64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextBeltQuota {
    success: bool,
    #[serde(rename = "quotaRemaining")]
    quota_remaining: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TextBeltStatusResponse {
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Credentials;

    fn credentials(key: &str) -> Credentials {
        let mut map = Credentials::new();
        map.insert("api_key".to_string(), key.to_string());
        map
    }

    fn configured_service(server: &mut mockito::ServerGuard, key: &str) -> TextBeltService {
        let mut service = TextBeltService::with_api_base(server.url());
        let _quota = server
            .mock("GET", format!("/quota/{}", key).as_str())
            .with_status(200)
            .with_body(r#"{"success": true, "quotaRemaining": 40}"#)
            .create();
        assert!(service.configure(&credentials(key)));
        service
    }

    #[test]
    fn configure_free_tier_key_drops_daily_limit() {
        let mut server = mockito::Server::new();
        let service = configured_service(&mut server, FREE_TIER_KEY);
        assert_eq!(service.daily_limit(), 1);
    }

    #[test]
    fn configure_rejects_unknown_key() {
        let mut server = mockito::Server::new();
        let _quota = server
            .mock("GET", "/quota/bad-key")
            .with_status(200)
            .with_body(r#"{"success": false}"#)
            .create();
        let mut service = TextBeltService::with_api_base(server.url());
        assert!(!service.configure(&credentials("bad-key")));
        assert!(!service.is_configured());
    }

    #[test]
    fn send_reports_quota_in_details() {
        let mut server = mockito::Server::new();
        let service = configured_service(&mut server, "paid-key");
        let _send = server
            .mock("POST", "/text")
            .with_status(200)
            .with_body(r#"{"success": true, "textId": "12345", "quotaRemaining": 39}"#)
            .create();

        let result = service.send("+15550001111", "hello");
        assert!(result.success);
        assert_eq!(result.message_id.as_deref(), Some("12345"));
        assert_eq!(result.details["quotaRemaining"], 39);
    }

    #[test]
    fn send_failure_carries_backend_error() {
        let mut server = mockito::Server::new();
        let service = configured_service(&mut server, "paid-key");
        let _send = server
            .mock("POST", "/text")
            .with_status(200)
            .with_body(r#"{"success": false, "error": "Out of quota", "quotaRemaining": 0}"#)
            .create();

        let result = service.send("+15550001111", "hello");
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("Out of quota"));
    }

    #[test]
    fn delivery_status_maps_backend_vocabulary() {
        let mut server = mockito::Server::new();
        let service = configured_service(&mut server, "paid-key");
        let _status = server
            .mock("GET", "/status/12345")
            .with_status(200)
            .with_body(r#"{"status": "DELIVERED"}"#)
            .create();

        let result = service.delivery_status("12345");
        assert_eq!(result.status, DELIVERY_DELIVERED);
    }

    #[test]
    fn remaining_quota_queries_backend() {
        let mut server = mockito::Server::new();
        let service = configured_service(&mut server, "paid-key");
        // configured_service left a quota mock returning 40
        assert_eq!(service.remaining_quota(), 40);
        assert_eq!(TextBeltService::new().remaining_quota(), 0);
    }
}
