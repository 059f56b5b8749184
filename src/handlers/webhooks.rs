use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::database::unix_now;
use crate::handlers::HandlerError;
use crate::middleware::auth::AppState;
use crate::models::delivery_log::DeliveryStatus;
use crate::services::delivery_log::apply_webhook_event;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed clock skew between the webhook timestamp and now.
const TIMESTAMP_TOLERANCE: i64 = 300;

fn unauthorized(message: &str) -> HandlerError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "error": message})),
    )
}

fn bad_request(message: &str) -> HandlerError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "error": message})),
    )
}

/// Provider event receiver. Authenticated by an HMAC signature over
/// `"<id>.<timestamp>.<raw body>"` with the shared webhook secret.
pub async fn receive_email_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, HandlerError> {
    let msg_id = header_str(&headers, "svix-id").ok_or_else(|| unauthorized("missing svix-id"))?;
    let timestamp = header_str(&headers, "svix-timestamp")
        .ok_or_else(|| unauthorized("missing svix-timestamp"))?;
    let signature = header_str(&headers, "svix-signature")
        .ok_or_else(|| unauthorized("missing svix-signature"))?;

    let now = unix_now();
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| bad_request("malformed timestamp"))?;
    if (now - ts).abs() > TIMESTAMP_TOLERANCE {
        return Err(bad_request("stale webhook timestamp"));
    }

    if !verify_signature(&state.config.webhook_secret, &msg_id, &timestamp, &body, &signature) {
        return Err(unauthorized("invalid signature"));
    }

    let payload: Value =
        serde_json::from_str(&body).map_err(|_| bad_request("malformed JSON body"))?;

    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(status) = map_event_type(event_type) else {
        debug!(event_type, "ignoring unhandled webhook event type");
        return Ok(Json(json!({"success": true, "data": {"ignored": event_type}})));
    };

    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    let Some(provider_message_id) = data.get("email_id").and_then(Value::as_str) else {
        warn!(event_type, "webhook event carries no email_id, dropping");
        return Ok(Json(json!({"success": true, "data": {"ignored": "missing email_id"}})));
    };

    let recipient = recipient_email(&data);
    let clicked_url = data
        .get("click")
        .and_then(|c| c.get("link"))
        .and_then(Value::as_str);
    let error_message = extract_error_message(&data);

    let updated = apply_webhook_event(
        &state.db_pool,
        provider_message_id,
        recipient.as_deref(),
        status,
        error_message.as_deref(),
        clicked_url,
        now,
    )
    .await
    .map_err(|e| {
        warn!(error = %e, "failed to apply webhook event");
        crate::handlers::internal_error(e)
    })?;

    Ok(Json(json!({"success": true, "data": {"updated": updated}})))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Verify a Svix-style signature header (`v1,<base64>` entries, space
/// separated) against the shared secret. The secret's `whsec_` prefix is
/// tolerated and the remainder is base64-decoded before keying the HMAC.
pub fn verify_signature(
    secret: &str,
    msg_id: &str,
    timestamp: &str,
    payload: &str,
    signature_header: &str,
) -> bool {
    if secret.is_empty() {
        return false;
    }
    let secret = secret.strip_prefix("whsec_").unwrap_or(secret);
    let Ok(key) = base64::engine::general_purpose::STANDARD.decode(secret) else {
        return false;
    };

    let signed_content = format!("{}.{}.{}", msg_id, timestamp, payload);

    for candidate in signature_header.split_whitespace() {
        let Some(encoded) = candidate.strip_prefix("v1,") else {
            continue;
        };
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) {
            // The HMAC verify path compares in constant time.
            let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
                return false;
            };
            mac.update(signed_content.as_bytes());
            if mac.verify_slice(&decoded).is_ok() {
                return true;
            }
        }
    }
    false
}

fn map_event_type(event_type: &str) -> Option<DeliveryStatus> {
    match event_type {
        "email.sent" => Some(DeliveryStatus::Sent),
        "email.delivered" => Some(DeliveryStatus::Delivered),
        "email.opened" => Some(DeliveryStatus::Opened),
        "email.clicked" => Some(DeliveryStatus::Clicked),
        "email.bounced" => Some(DeliveryStatus::Bounced),
        "email.failed" => Some(DeliveryStatus::Failed),
        _ => None,
    }
}

/// The recipient address: `data.to` may be a string or an array.
fn recipient_email(data: &Value) -> Option<String> {
    match data.get("to") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(items)) => items.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn extract_error_message(data: &Value) -> Option<String> {
    data.get("bounce")
        .and_then(|b| b.get("message"))
        .or_else(|| data.get("error"))
        .or_else(|| data.get("reason"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret_b64: &str, msg_id: &str, timestamp: &str, payload: &str) -> String {
        let key = base64::engine::general_purpose::STANDARD
            .decode(secret_b64)
            .unwrap();
        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(format!("{}.{}.{}", msg_id, timestamp, payload).as_bytes());
        let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        format!("v1,{}", sig)
    }

    const SECRET: &str = "c2VjcmV0LXdlYmhvb2sta2V5"; // base64("secret-webhook-key")

    #[test]
    fn valid_signature_is_accepted() {
        let header = sign(SECRET, "msg_1", "1700000000", r#"{"type":"email.opened"}"#);
        assert!(verify_signature(
            SECRET,
            "msg_1",
            "1700000000",
            r#"{"type":"email.opened"}"#,
            &header
        ));
    }

    #[test]
    fn whsec_prefixed_secret_is_accepted() {
        let header = sign(SECRET, "msg_1", "1700000000", "body");
        let prefixed = format!("whsec_{}", SECRET);
        assert!(verify_signature(&prefixed, "msg_1", "1700000000", "body", &header));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let header = sign(SECRET, "msg_1", "1700000000", "body");
        assert!(!verify_signature(SECRET, "msg_1", "1700000000", "tampered", &header));
    }

    #[test]
    fn wrong_message_id_is_rejected() {
        let header = sign(SECRET, "msg_1", "1700000000", "body");
        assert!(!verify_signature(SECRET, "msg_2", "1700000000", "body", &header));
    }

    #[test]
    fn multiple_signatures_match_any() {
        let good = sign(SECRET, "msg_1", "1700000000", "body");
        let header = format!("v1,AAAA {}", good);
        assert!(verify_signature(SECRET, "msg_1", "1700000000", "body", &header));
    }

    #[test]
    fn empty_secret_never_verifies() {
        let header = sign(SECRET, "msg_1", "1700000000", "body");
        assert!(!verify_signature("", "msg_1", "1700000000", "body", &header));
    }

    #[test]
    fn event_types_map_to_statuses() {
        assert_eq!(map_event_type("email.delivered"), Some(DeliveryStatus::Delivered));
        assert_eq!(map_event_type("email.opened"), Some(DeliveryStatus::Opened));
        assert_eq!(map_event_type("email.clicked"), Some(DeliveryStatus::Clicked));
        assert_eq!(map_event_type("email.bounced"), Some(DeliveryStatus::Bounced));
        assert_eq!(map_event_type("email.failed"), Some(DeliveryStatus::Failed));
        assert_eq!(map_event_type("contact.updated"), None);
    }

    #[test]
    fn recipient_accepts_string_or_array() {
        assert_eq!(
            recipient_email(&json!({"to": "a@b.test"})).as_deref(),
            Some("a@b.test")
        );
        assert_eq!(
            recipient_email(&json!({"to": ["a@b.test", "c@d.test"]})).as_deref(),
            Some("a@b.test")
        );
        assert_eq!(recipient_email(&json!({})), None);
    }
}
