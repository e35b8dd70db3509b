//! Signature checks and parsing for completed-response webhooks.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::Sha256;
use tracing::warn;

use crate::error::{CourierError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the base64 HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "X-Qualtrics-Signature";

/// Checks webhook bodies against a shared secret.
pub struct WebhookVerifier {
    secret: SecretString,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: SecretString::new(secret.into()),
        }
    }

    /// Whether `signature` is the base64 HMAC-SHA256 of `payload`.
    ///
    /// Empty input and signatures that are not valid base64 never verify.
    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        if payload.is_empty() || signature.trim().is_empty() {
            return false;
        }
        let Ok(expected) = BASE64.decode(signature.trim()) else {
            warn!("Webhook signature is not valid base64");
            return false;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()) else {
            return false;
        };
        mac.update(payload);
        // verify_slice compares in constant time
        mac.verify_slice(&expected).is_ok()
    }

    /// Compute the signature for `payload`.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = match HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()) {
            Ok(mac) => mac,
            // HMAC accepts keys of any length
            Err(_) => return String::new(),
        };
        mac.update(payload);
        BASE64.encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Fields of a form-encoded webhook notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookEvent {
    pub topic: String,
    pub brand_id: Option<String>,
    pub response_id: Option<String>,
    pub survey_id: Option<String>,
}

impl WebhookEvent {
    /// Parse an `application/x-www-form-urlencoded` body.
    pub fn from_form(body: &[u8]) -> Result<Self> {
        let mut event = WebhookEvent::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            let value = value.into_owned();
            match key.as_ref() {
                "Topic" => event.topic = value,
                "BrandID" => event.brand_id = Some(value),
                "ResponseID" => event.response_id = Some(value),
                "SurveyID" => event.survey_id = Some(value),
                _ => {}
            }
        }
        if event.topic.is_empty() {
            return Err(CourierError::Config("webhook body has no Topic".into()));
        }
        Ok(event)
    }
}
