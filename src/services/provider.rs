use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Attempts per request, transport and 5xx/429 failures included.
const MAX_ATTEMPTS: u32 = 3;

/// Provider batch-send hard limit per request.
pub const BATCH_LIMIT: usize = 100;

/// Spacing between sequential requests of the same logical batch. The
/// provider advertises roughly 2 req/s.
const REQUEST_SPACING: Duration = Duration::from_millis(550);

const PREVIEW_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("provider rejected request ({status}): {message}")]
    ClientError { status: u16, message: String },
    #[error("provider server error ({status}): {message}")]
    ServerError { status: u16, message: String },
    #[error("unparseable provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Whether the caller may usefully retry on a later tick.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::ClientError { .. } | ProviderError::Parse(_))
    }
}

/// One transactional email as handed to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Outcome of `ensure_contact`. A conflict response means the contact
/// already existed and may or may not reveal its id.
#[derive(Debug, Clone)]
pub struct EnsuredContact {
    pub contact_id: Option<String>,
    pub existed: bool,
}

struct ProviderResponse {
    status: StatusCode,
    body: Value,
}

pub struct ProviderClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl ProviderClient {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(ProviderClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Cooperative pause between sequential requests of one logical batch
    /// (contact-ensure loops, segment-add loops).
    pub async fn pace(&self) {
        tokio::time::sleep(REQUEST_SPACING).await;
    }

    /// Send a single transactional email. Returns the provider message id.
    pub async fn send_email(&self, email: &OutgoingEmail) -> Result<String, ProviderError> {
        let response = self
            .execute(Method::POST, "/emails", Some(&json!(email)), false)
            .await?;
        extract_id(&response.body)
    }

    /// Send up to `BATCH_LIMIT` emails per request, chunking larger inputs.
    /// The result is positionally aligned with the input; recipients the
    /// provider returned no id for get `None`.
    pub async fn send_batch(
        &self,
        emails: &[OutgoingEmail],
    ) -> Result<Vec<Option<String>>, ProviderError> {
        let mut ids = Vec::with_capacity(emails.len());
        for (i, chunk) in emails.chunks(BATCH_LIMIT).enumerate() {
            if i > 0 {
                self.pace().await;
            }
            let response = self
                .execute(Method::POST, "/emails/batch", Some(&json!(chunk)), false)
                .await?;
            let returned = response
                .body
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    ProviderError::Parse("batch response missing data array".to_string())
                })?;
            if returned.len() < chunk.len() {
                warn!(
                    expected = chunk.len(),
                    got = returned.len(),
                    "provider batch response shorter than request; tail has no message ids"
                );
            }
            for j in 0..chunk.len() {
                ids.push(
                    returned
                        .get(j)
                        .and_then(|v| v.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                );
            }
        }
        Ok(ids)
    }

    /// Create or fetch the provider-side contact for an email address.
    pub async fn ensure_contact(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<EnsuredContact, ProviderError> {
        let (first_name, last_name) = match name {
            Some(name) => {
                let (first, last) = crate::utils::split_name(name);
                (Some(first), last)
            }
            None => (None, None),
        };
        let mut payload = json!({ "email": email });
        if let Some(first) = first_name {
            payload["first_name"] = json!(first);
        }
        if let Some(last) = last_name {
            payload["last_name"] = json!(last);
        }

        let response = self
            .execute(Method::POST, "/contacts", Some(&payload), true)
            .await?;

        if response.status == StatusCode::CONFLICT {
            // Already exists; the provider does not always echo the id back.
            let contact_id = response
                .body
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(EnsuredContact {
                contact_id,
                existed: true,
            });
        }

        Ok(EnsuredContact {
            contact_id: Some(extract_id(&response.body)?),
            existed: false,
        })
    }

    pub async fn create_segment(&self, name: &str) -> Result<String, ProviderError> {
        let response = self
            .execute(Method::POST, "/segments", Some(&json!({ "name": name })), false)
            .await?;
        extract_id(&response.body)
    }

    /// One contact per call; the provider has no batch add. Callers pace
    /// their loops with `pace()`.
    pub async fn add_contact_to_segment(
        &self,
        segment_id: &str,
        contact_id: &str,
    ) -> Result<(), ProviderError> {
        self.execute(
            Method::POST,
            &format!("/segments/{}/contacts", segment_id),
            Some(&json!({ "contact_id": contact_id })),
            false,
        )
        .await?;
        Ok(())
    }

    pub async fn delete_segment(&self, segment_id: &str) -> Result<(), ProviderError> {
        self.execute(Method::DELETE, &format!("/segments/{}", segment_id), None, false)
            .await?;
        Ok(())
    }

    /// Create a draft broadcast bound to a segment. Sending is a separate
    /// call because creation only yields a draft.
    pub async fn create_broadcast(
        &self,
        segment_id: &str,
        from: &str,
        subject: &str,
        html: &str,
        reply_to: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut payload = json!({
            "segment_id": segment_id,
            "from": from,
            "subject": subject,
            "html": html,
        });
        if let Some(reply_to) = reply_to {
            payload["reply_to"] = json!(reply_to);
        }
        let response = self
            .execute(Method::POST, "/broadcasts", Some(&payload), false)
            .await?;
        extract_id(&response.body)
    }

    pub async fn send_broadcast(&self, broadcast_id: &str) -> Result<String, ProviderError> {
        let response = self
            .execute(
                Method::POST,
                &format!("/broadcasts/{}/send", broadcast_id),
                None,
                false,
            )
            .await?;
        extract_id(&response.body)
    }

    /// Best-effort mirror of a local unsubscribe into the provider.
    pub async fn mark_unsubscribed(&self, email: &str) -> Result<(), ProviderError> {
        self.execute(
            Method::PATCH,
            &format!("/contacts/{}", email),
            Some(&json!({ "unsubscribed": true })),
            false,
        )
        .await?;
        Ok(())
    }

    /// Core request loop: bearer auth, bounded retries for transport
    /// errors, 5xx and 429, defensive text-first body parsing.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        allow_conflict: bool,
    ) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;

        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.api_key);
            if let Some(body) = body {
                request = request.json(body);
            }

            let outcome = request.send().await;
            attempt += 1;

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    if attempt < MAX_ATTEMPTS {
                        debug!(attempt, error = %e, "provider transport error, retrying");
                        tokio::time::sleep(backoff_delay(attempt, false)).await;
                        continue;
                    }
                    return Err(ProviderError::Transport(e.to_string()));
                }
            };

            let status = response.status();
            let retry_after = parse_retry_after(&response);
            let text = response
                .text()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
            let parsed: Result<Value, _> = if text.trim().is_empty() {
                Ok(Value::Null)
            } else {
                serde_json::from_str(&text)
            };

            if status.is_success() || (allow_conflict && status == StatusCode::CONFLICT) {
                let body = parsed.map_err(|_| ProviderError::Parse(preview(&text)))?;
                return Ok(ProviderResponse { status, body });
            }

            let message = match &parsed {
                Ok(body) => error_message(body).unwrap_or_else(|| preview(&text)),
                Err(_) => preview(&text),
            };

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt < MAX_ATTEMPTS {
                    let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt, true));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(ProviderError::RateLimited(message));
            }

            if status.is_server_error() {
                if attempt < MAX_ATTEMPTS {
                    debug!(attempt, %status, "provider server error, retrying");
                    tokio::time::sleep(backoff_delay(attempt, false)).await;
                    continue;
                }
                return Err(ProviderError::ServerError {
                    status: status.as_u16(),
                    message,
                });
            }

            // Remaining 4xx: terminal, never retried.
            return Err(ProviderError::ClientError {
                status: status.as_u16(),
                message,
            });
        }
    }
}

fn extract_id(body: &Value) -> Result<String, ProviderError> {
    body.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Parse("response missing id".to_string()))
}

fn error_message(body: &Value) -> Option<String> {
    body.get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Exponential backoff: 1s base doubled per attempt, with two extra
/// doublings when the provider rate-limited us.
fn backoff_delay(attempt: u32, rate_limited: bool) -> Duration {
    let exponent = if rate_limited { attempt + 2 } else { attempt };
    Duration::from_secs(1 << exponent.min(10))
}

/// Truncated body preview carried on parse failures.
fn preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= PREVIEW_LIMIT {
        trimmed.to_string()
    } else {
        let mut end = PREVIEW_LIMIT;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}
