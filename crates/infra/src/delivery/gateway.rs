//! HTTP SMS gateway client (Africa's Talking style messaging API).
//!
//! One POST per attempt to `{base_url}/messaging`:
//!
//! ```text
//! POST /messaging
//! apiKey: <key>
//! {"username": "...", "to": "+2547...", "message": "...", "from": "..."}
//! ```
//!
//! The response lists one entry per recipient; the first entry's `statusCode`
//! decides the outcome.

use std::time::{Duration, Instant};

use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{DeliveryClient, DeliveryError, DeliveryOutcome};

pub const SANDBOX_BASE_URL: &str = "https://api.sandbox.africastalking.com/version1";
pub const LIVE_BASE_URL: &str = "https://api.africastalking.com/version1";
pub const DEFAULT_COUNTRY_CODE: &str = "+254";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway credentials and endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub username: String,
    pub api_key: String,
    /// Sender id; omitted from requests when empty
    pub shortcode: String,
    pub base_url: String,
    pub timeout: Duration,
    pub default_country_code: String,
    /// Selects the default `base_url`
    pub sandbox: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            username: "sandbox".to_string(),
            api_key: String::new(),
            shortcode: String::new(),
            base_url: SANDBOX_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            default_country_code: DEFAULT_COUNTRY_CODE.to_string(),
            sandbox: true,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("username", &self.username)
            .field("api_key", &"<redacted>")
            .field("shortcode", &self.shortcode)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("default_country_code", &self.default_country_code)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

impl GatewayConfig {
    /// Endpoint used when no explicit base URL is configured.
    pub fn default_base_url(sandbox: bool) -> &'static str {
        if sandbox { SANDBOX_BASE_URL } else { LIVE_BASE_URL }
    }

    /// Credentials are present; otherwise the process falls back to dry-run.
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.api_key.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct SmsRequest<'a> {
    pub username: &'a str,
    pub to: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub from: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct SmsResponse {
    #[serde(rename = "SMSMessageData")]
    pub data: SmsMessageData,
}

#[derive(Debug, Deserialize)]
pub struct SmsMessageData {
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Recipients", default)]
    pub recipients: Vec<SmsRecipient>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsRecipient {
    pub status_code: i64,
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cost: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub message_parts: Option<u32>,
}

/// Prefix numbers that are not in international format with the default
/// country code.
pub fn normalize_phone(phone: &str, country_code: &str) -> String {
    let phone = phone.trim();
    if phone.is_empty() || phone.starts_with('+') {
        return phone.to_string();
    }
    let digits = country_code.trim_start_matches('+');
    if phone.len() >= 10 && phone.starts_with(digits) {
        return phone.to_string();
    }
    format!("{country_code}{phone}")
}

/// Map an HTTP status and body to a delivery outcome.
pub fn classify_response(status: u16, body: &str) -> DeliveryOutcome {
    if status >= 500 || status == 429 {
        return DeliveryOutcome::TransientError(format!("gateway returned HTTP {status}"));
    }
    if status != 200 && status != 201 {
        return DeliveryOutcome::Rejected(format!(
            "gateway returned HTTP {status}: {}",
            truncate(body, 200)
        ));
    }

    let response: SmsResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            return DeliveryOutcome::TransientError(format!("unreadable gateway response: {e}"));
        }
    };

    let Some(recipient) = response.data.recipients.first() else {
        let detail = if response.data.message.is_empty() {
            "no recipients in gateway response".to_string()
        } else {
            format!("no recipients in gateway response: {}", response.data.message)
        };
        return DeliveryOutcome::TransientError(detail);
    };

    match recipient.status_code {
        // Processed, Sent, Queued
        100..=102 => DeliveryOutcome::Delivered {
            message_id: recipient.message_id.clone(),
        },
        // Recipient, sender and routing rejections; 502 is RejectedByGateway
        401..=409 | 502 => DeliveryOutcome::Rejected(format!(
            "{} (code {})",
            recipient.status, recipient.status_code
        )),
        code => DeliveryOutcome::TransientError(format!("{} (code {code})", recipient.status)),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Blocking HTTP client for the gateway. Run it on worker threads, not
/// inside an async runtime.
#[derive(Debug)]
pub struct HttpGatewayClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    config: GatewayConfig,
}

impl HttpGatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, DeliveryError> {
        if !config.is_configured() {
            return Err(DeliveryError::Config(
                "gateway username and api key are required".to_string(),
            ));
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::Config(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/messaging", config.base_url.trim_end_matches('/')),
            config,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl DeliveryClient for HttpGatewayClient {
    #[instrument(skip(self, payload), fields(endpoint = %self.endpoint))]
    fn send(&self, recipient: &str, payload: &str) -> DeliveryOutcome {
        let to = normalize_phone(recipient, &self.config.default_country_code);
        let request = SmsRequest {
            username: &self.config.username,
            to: &to,
            message: payload,
            from: &self.config.shortcode,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(&self.endpoint)
            .header("apiKey", &self.config.api_key)
            .header(ACCEPT, "application/json")
            .json(&request)
            .send();

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(to = %to, "gateway request timed out");
                return DeliveryOutcome::TransientError(format!("gateway timeout: {e}"));
            }
            Err(e) => {
                warn!(to = %to, error = %e, "gateway request failed");
                return DeliveryOutcome::TransientError(format!("gateway request failed: {e}"));
            }
        };

        let status = response.status().as_u16();
        let body = match response.text() {
            Ok(b) => b,
            Err(e) => {
                return DeliveryOutcome::TransientError(format!(
                    "failed to read gateway response: {e}"
                ));
            }
        };

        let outcome = classify_response(status, &body);
        debug!(
            to = %to,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "gateway responded"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(code: i64, status: &str) -> String {
        format!(
            r#"{{"SMSMessageData":{{"Message":"Sent to 1/1 Total Cost: KES 0.8000",
            "Recipients":[{{"statusCode":{code},"number":"+254711XXXYYY","status":"{status}",
            "cost":"KES 0.8000","messageId":"ATPid_SampleTxnId123","messageParts":1}}]}}}}"#
        )
    }

    #[test]
    fn accepted_codes_are_delivered() {
        for code in [100, 101, 102] {
            assert_eq!(
                classify_response(201, &body(code, "Success")),
                DeliveryOutcome::Delivered {
                    message_id: "ATPid_SampleTxnId123".into()
                }
            );
        }
        assert!(classify_response(200, &body(101, "Success")).is_delivered());
    }

    #[test]
    fn recipient_rejections() {
        for code in [401, 403, 404, 405, 406, 407, 409, 502] {
            let outcome = classify_response(201, &body(code, "InvalidPhoneNumber"));
            let rejected = matches!(
                outcome,
                DeliveryOutcome::Rejected(ref r) if r.contains("InvalidPhoneNumber")
            );
            assert!(rejected, "code {code} gave {outcome:?}");
        }
    }

    #[test]
    fn gateway_side_failures_are_transient() {
        for code in [500, 501, 999] {
            assert!(matches!(
                classify_response(201, &body(code, "InternalServerError")),
                DeliveryOutcome::TransientError(_)
            ));
        }
    }

    #[test]
    fn http_status_classification() {
        assert!(matches!(
            classify_response(503, ""),
            DeliveryOutcome::TransientError(_)
        ));
        assert!(matches!(
            classify_response(429, "slow down"),
            DeliveryOutcome::TransientError(_)
        ));
        assert!(matches!(
            classify_response(401, "The supplied authentication is invalid"),
            DeliveryOutcome::Rejected(_)
        ));
        assert!(matches!(
            classify_response(400, "bad request"),
            DeliveryOutcome::Rejected(_)
        ));
    }

    #[test]
    fn ambiguous_bodies_are_transient() {
        assert!(matches!(
            classify_response(201, "<html>oops</html>"),
            DeliveryOutcome::TransientError(_)
        ));
        let empty = r#"{"SMSMessageData":{"Message":"InvalidSenderId","Recipients":[]}}"#;
        match classify_response(201, empty) {
            DeliveryOutcome::TransientError(reason) => assert!(reason.contains("InvalidSenderId")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("+254711000111", "+254"), "+254711000111");
        assert_eq!(normalize_phone("254711000111", "+254"), "254711000111");
        assert_eq!(normalize_phone("711000111", "+254"), "+254711000111");
        assert_eq!(normalize_phone(" 711000111 ", "+254"), "+254711000111");
        assert_eq!(normalize_phone("", "+254"), "");
        assert_eq!(normalize_phone("2025550143", "+1"), "+12025550143");
    }

    #[test]
    fn request_omits_empty_sender() {
        let req = SmsRequest {
            username: "sandbox",
            to: "+254711000111",
            message: "hi",
            from: "",
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("from").is_none());
        assert_eq!(json["to"], "+254711000111");
    }

    #[test]
    fn client_requires_credentials() {
        assert!(HttpGatewayClient::new(GatewayConfig::default()).is_err());

        let client = HttpGatewayClient::new(GatewayConfig {
            api_key: "key".into(),
            base_url: "http://localhost:9/version1/".into(),
            ..GatewayConfig::default()
        })
        .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:9/version1/messaging");
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = GatewayConfig {
            api_key: "super-secret".into(),
            ..GatewayConfig::default()
        };
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
