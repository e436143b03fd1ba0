//! Twilio-style REST backend.
//!
//! Credentials: `account_sid`, `auth_token`, `from_number`. Validation
//! fetches the account resource with basic auth; sends post a
//! form-encoded message create.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use crate::service::{
    map_status, required_field, Credentials, Details, SendResult, ServiceError, SmsService,
    StatusResult, DELIVERY_DELIVERED, DELIVERY_FAILED, DELIVERY_PENDING, DELIVERY_SENT,
};

pub const DEFAULT_API_BASE: &str = "https://api.twilio.com";

/// Free-tier default daily allowance; Twilio exposes no direct quota
/// API, so this is the advertised limit rather than a live count.
const DEFAULT_DAILY_LIMIT: i64 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const STATUS_TABLE: &[(&str, &str)] = &[
    ("queued", DELIVERY_PENDING),
    ("accepted", DELIVERY_PENDING),
    ("scheduled", DELIVERY_PENDING),
    ("sending", DELIVERY_PENDING),
    ("sent", DELIVERY_SENT),
    ("delivered", DELIVERY_DELIVERED),
    ("read", DELIVERY_DELIVERED),
    ("failed", DELIVERY_FAILED),
    ("undelivered", DELIVERY_FAILED),
    ("canceled", DELIVERY_FAILED),
];

#[derive(Debug, Clone)]
struct TwilioCredentials {
    account_sid: String,
    auth_token: String,
    from_number: String,
}

#[derive(Debug)]
pub struct TwilioService {
    api_base: String,
    client: reqwest::blocking::Client,
    credentials: Option<TwilioCredentials>,
    daily_limit: i64,
}

impl TwilioService {
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
            credentials: None,
            daily_limit: DEFAULT_DAILY_LIMIT,
        }
    }

    fn account_url(&self, sid: &str) -> String {
        format!("{}/2010-04-01/Accounts/{}.json", self.api_base, sid)
    }

    fn messages_url(&self, sid: &str) -> String {
        format!("{}/2010-04-01/Accounts/{}/Messages.json", self.api_base, sid)
    }

    fn message_url(&self, sid: &str, message_sid: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages/{}.json",
            self.api_base, sid, message_sid
        )
    }

    fn fetch_account(&self, candidate: &TwilioCredentials) -> Result<bool, ServiceError> {
        let response = self
            .client
            .get(self.account_url(&candidate.account_sid))
            .basic_auth(&candidate.account_sid, Some(&candidate.auth_token))
            .send()?;
        Ok(response.status().is_success())
    }

    fn post_message(
        &self,
        credentials: &TwilioCredentials,
        recipient: &str,
        body: &str,
    ) -> Result<SendResult, ServiceError> {
        let form = [
            ("To", recipient),
            ("From", credentials.from_number.as_str()),
            ("Body", body),
        ];
        let response = self
            .client
            .post(self.messages_url(&credentials.account_sid))
            .basic_auth(&credentials.account_sid, Some(&credentials.auth_token))
            .form(&form)
            .send()?;

        if response.status().is_success() {
            let message: TwilioMessage = response.json()?;
            let mut details = Details::new();
            if let Some(status) = message.status.as_deref() {
                details.insert("status".to_string(), Value::from(status));
            }
            if let Some(price) = message.price.as_deref() {
                details.insert("price".to_string(), Value::from(price));
            }
            if let Some(price_unit) = message.price_unit.as_deref() {
                details.insert("price_unit".to_string(), Value::from(price_unit));
            }
            if let Some(date_created) = message.date_created.as_deref() {
                details.insert("date_created".to_string(), Value::from(date_created));
            }
            Ok(SendResult::ok(message.sid.unwrap_or_default(), details))
        } else {
            let http_status = response.status().as_u16();
            let api_error: TwilioApiError = response.json().unwrap_or_default();
            let mut details = Details::new();
            if let Some(code) = api_error.code {
                details.insert("code".to_string(), Value::from(code));
            }
            details.insert(
                "status".to_string(),
                Value::from(api_error.status.unwrap_or(i64::from(http_status))),
            );
            if let Some(more_info) = api_error.more_info.as_deref() {
                details.insert("more_info".to_string(), Value::from(more_info));
            }
            let message = api_error
                .message
                .unwrap_or_else(|| format!("HTTP {}", http_status));
            Ok(SendResult::failure_with_details(
                format!("Twilio API error: {}", message),
                details,
            ))
        }
    }

    fn fetch_message(
        &self,
        credentials: &TwilioCredentials,
        message_sid: &str,
    ) -> Result<StatusResult, ServiceError> {
        let response = self
            .client
            .get(self.message_url(&credentials.account_sid, message_sid))
            .basic_auth(&credentials.account_sid, Some(&credentials.auth_token))
            .send()?;

        if !response.status().is_success() {
            return Ok(StatusResult::unknown(format!(
                "Twilio API error: HTTP {}",
                response.status().as_u16()
            )));
        }

        let message: TwilioMessage = response.json()?;
        let raw_status = message.status.unwrap_or_default();
        let mut details = Details::new();
        if let Some(code) = message.error_code {
            details.insert("error_code".to_string(), Value::from(code));
        }
        if let Some(text) = message.error_message.as_deref() {
            details.insert("error_message".to_string(), Value::from(text));
        }
        if let Some(date_sent) = message.date_sent.as_deref() {
            details.insert("date_sent".to_string(), Value::from(date_sent));
        }
        if let Some(date_updated) = message.date_updated.as_deref() {
            details.insert("date_updated".to_string(), Value::from(date_updated));
        }
        Ok(StatusResult {
            status: map_status(STATUS_TABLE, &raw_status),
            error: None,
            details,
        })
    }
}

impl Default for TwilioService {
    fn default() -> Self {
        Self::new()
    }
}

impl SmsService for TwilioService {
    fn name(&self) -> &str {
        "twilio"
    }

    fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    fn daily_limit(&self) -> i64 {
        self.daily_limit
    }

    fn configure(&mut self, credentials: &Credentials) -> bool {
        let (account_sid, auth_token, from_number) = match (
            required_field(credentials, "account_sid"),
            required_field(credentials, "auth_token"),
            required_field(credentials, "from_number"),
        ) {
            (Some(sid), Some(token), Some(from)) => (sid, token, from),
            _ => {
                error!("missing required Twilio credentials");
                return false;
            }
        };

        let candidate = TwilioCredentials {
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
            from_number: from_number.to_string(),
        };

        match self.fetch_account(&candidate) {
            Ok(true) => {
                self.credentials = Some(candidate);
                info!("Twilio service configured");
                true
            }
            Ok(false) => {
                error!("invalid Twilio credentials");
                false
            }
            Err(err) => {
                error!("error validating Twilio credentials: {}", err);
                false
            }
        }
    }

    fn validate_credentials(&self) -> bool {
        match self.credentials.as_ref() {
            Some(credentials) => self.fetch_account(credentials).unwrap_or(false),
            None => false,
        }
    }

    fn send(&self, recipient: &str, body: &str) -> SendResult {
        let Some(credentials) = self.credentials.as_ref() else {
            return SendResult::failure("Twilio service not configured");
        };
        match self.post_message(credentials, recipient, body) {
            Ok(result) => result,
            Err(err) => {
                error!("error sending SMS with Twilio: {}", err);
                SendResult::failure(format!("Error: {}", err))
            }
        }
    }

    fn remaining_quota(&self) -> i64 {
        // Twilio has no per-day quota endpoint; report the advertised
        // daily limit when configured.
        if self.is_configured() {
            self.daily_limit
        } else {
            0
        }
    }

    fn delivery_status(&self, message_id: &str) -> StatusResult {
        let Some(credentials) = self.credentials.as_ref() else {
            return StatusResult::unknown("Twilio service not configured");
        };
        match self.fetch_message(credentials, message_id) {
            Ok(result) => result,
            Err(err) => {
                error!("error checking Twilio message status: {}", err);
                StatusResult::unknown(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TwilioMessage {
    sid: Option<String>,
    status: Option<String>,
    price: Option<String>,
    price_unit: Option<String>,
    date_created: Option<String>,
    date_sent: Option<String>,
    date_updated: Option<String>,
    error_code: Option<i64>,
    error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TwilioApiError {
    code: Option<i64>,
    message: Option<String>,
    more_info: Option<String>,
    status: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Credentials;

    fn credentials() -> Credentials {
        let mut map = Credentials::new();
        map.insert("account_sid".to_string(), "AC123".to_string());
        map.insert("auth_token".to_string(), "token".to_string());
        map.insert("from_number".to_string(), "+15550009999".to_string());
        map
    }

    fn configured_service(server: &mut mockito::ServerGuard) -> TwilioService {
        let mut service = TwilioService::with_api_base(server.url());
        let _account = server
            .mock("GET", "/2010-04-01/Accounts/AC123.json")
            .with_status(200)
            .with_body(r#"{"sid": "AC123", "status": "active"}"#)
            .create();
        assert!(service.configure(&credentials()));
        service
    }

    #[test]
    fn configure_rejects_missing_fields() {
        let mut service = TwilioService::new();
        let mut partial = Credentials::new();
        partial.insert("account_sid".to_string(), "AC123".to_string());
        assert!(!service.configure(&partial));
        assert!(!service.is_configured());
    }

    #[test]
    fn configure_rejects_invalid_credentials_without_commit() {
        let mut server = mockito::Server::new();
        let _account = server
            .mock("GET", "/2010-04-01/Accounts/AC123.json")
            .with_status(401)
            .with_body(r#"{"code": 20003, "message": "Authenticate"}"#)
            .create();
        let mut service = TwilioService::with_api_base(server.url());
        assert!(!service.configure(&credentials()));
        assert!(!service.is_configured());
    }

    #[test]
    fn send_parses_successful_response() {
        let mut server = mockito::Server::new();
        let service = configured_service(&mut server);
        let _send = server
            .mock("POST", "/2010-04-01/Accounts/AC123/Messages.json")
            .with_status(201)
            .with_body(
                r#"{"sid": "SM42", "status": "queued", "price": "-0.0075", "price_unit": "USD", "date_created": "Mon, 01 Jan 2024 00:00:00 +0000"}"#,
            )
            .create();

        let result = service.send("+15550001111", "hello");
        assert!(result.success);
        assert_eq!(result.message_id.as_deref(), Some("SM42"));
        assert_eq!(result.details["status"], "queued");
    }

    #[test]
    fn send_normalizes_api_errors() {
        let mut server = mockito::Server::new();
        let service = configured_service(&mut server);
        let _send = server
            .mock("POST", "/2010-04-01/Accounts/AC123/Messages.json")
            .with_status(400)
            .with_body(
                r#"{"code": 21211, "message": "Invalid 'To' number", "more_info": "https://www.twilio.com/docs/errors/21211", "status": 400}"#,
            )
            .create();

        let result = service.send("not-a-number", "hello");
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("Invalid 'To' number"));
        assert_eq!(result.details["code"], 21211);
    }

    #[test]
    fn send_without_configuration_is_a_normalized_failure() {
        let service = TwilioService::new();
        let result = service.send("+15550001111", "hello");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Twilio service not configured"));
    }

    #[test]
    fn delivery_status_maps_backend_vocabulary() {
        let mut server = mockito::Server::new();
        let service = configured_service(&mut server);
        let _status = server
            .mock("GET", "/2010-04-01/Accounts/AC123/Messages/SM42.json")
            .with_status(200)
            .with_body(r#"{"sid": "SM42", "status": "undelivered", "error_code": 30005}"#)
            .create();

        let result = service.delivery_status("SM42");
        assert_eq!(result.status, DELIVERY_FAILED);
        assert_eq!(result.details["error_code"], 30005);
    }
}
