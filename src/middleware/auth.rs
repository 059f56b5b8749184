use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use axum::RequestPartsExt;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_cookies::Cookies;

use crate::config::Config;
use crate::database::unix_now;
use crate::models::admin::AdminUser;
use crate::services::provider::ProviderClient;

/// Application state shared by handlers and the scheduler.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub config: Arc<Config>,
    pub provider: Arc<ProviderClient>,
}

/// Authenticated admin extractor. Accepts either the configured API key as
/// a bearer token or a `session` cookie backed by the shared admin-sessions
/// table. API-key requests act as a synthetic owner.
pub struct AdminAuth {
    pub user: Option<AdminUser>,
}

type AuthRejection = (StatusCode, Json<serde_json::Value>);

fn unauthorized() -> AuthRejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "error": "Unauthorized"})),
    )
}

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Bearer API key first: cheap, constant-time, no database round trip.
        if let Some(token) = bearer_token(parts) {
            if api_key_matches(&state.config.admin_api_key, &token) {
                return Ok(AdminAuth { user: None });
            }
            return Err(unauthorized());
        }

        // Fall back to the admin UI's session cookie.
        let cookies = parts
            .extract::<Cookies>()
            .await
            .map_err(|_| unauthorized())?;
        let session_token = cookies
            .get("session")
            .map(|c| c.value().to_string())
            .ok_or_else(unauthorized)?;

        let user = sqlx::query_as::<_, AdminUser>(
            r#"
            SELECT u.id, u.email, u.name, u.role, u.created_at
            FROM admin_sessions s
            JOIN admin_users u ON u.id = s.user_id
            WHERE s.token = $1 AND s.expires_at > $2
            "#,
        )
        .bind(&session_token)
        .bind(unix_now())
        .fetch_optional(&state.db_pool)
        .await
        .map_err(|_| unauthorized())?
        .ok_or_else(unauthorized)?;

        if !user.can_manage() {
            return Err(unauthorized());
        }

        Ok(AdminAuth { user: Some(user) })
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let auth = parts.headers.get("authorization")?.to_str().ok()?;
    auth.strip_prefix("Bearer ").map(|t| t.to_string())
}

fn api_key_matches(configured: &str, presented: &str) -> bool {
    if configured.is_empty() {
        return false;
    }
    configured.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_keys_are_accepted() {
        assert!(api_key_matches("secret-key", "secret-key"));
    }

    #[test]
    fn mismatched_keys_are_rejected() {
        assert!(!api_key_matches("secret-key", "secret-kex"));
        assert!(!api_key_matches("secret-key", "secret"));
    }

    #[test]
    fn empty_configured_key_never_matches() {
        assert!(!api_key_matches("", ""));
        assert!(!api_key_matches("", "anything"));
    }
}
