use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Redirect,
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::unix_now;
use crate::handlers::{bad_request, internal_error, HandlerError};
use crate::middleware::auth::AppState;
use crate::models::campaign::Campaign;
use crate::models::subscriber::{SubscribeRequest, Subscriber, SubscriberStatus};
use crate::services::provider::OutgoingEmail;
use crate::services::unsubscribe::{unsubscribe_by_token, UnsubscribeOutcome};
use crate::utils::{generate_token, validate_email};

pub async fn health_check() -> &'static str {
    "OK"
}

/// Public signup. Creates a pending subscriber and sends the
/// double-opt-in confirmation email.
pub async fn subscribe(
    State(state): State<AppState>,
    Json(request): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    let email = request.email.trim().to_lowercase();
    if !validate_email(&email) {
        return Err(bad_request("invalid email address"));
    }

    let existing = sqlx::query_as::<_, Subscriber>(
        "SELECT * FROM subscribers WHERE LOWER(email) = $1",
    )
    .bind(&email)
    .fetch_optional(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let (subscriber, confirmation_token) = match existing {
        Some(subscriber) if subscriber.status == SubscriberStatus::Active => {
            return Ok((
                StatusCode::OK,
                Json(json!({"success": true, "data": {"message": "already subscribed"}})),
            ));
        }
        Some(subscriber) => {
            // Pending signups get a fresh confirmation; unsubscribed
            // addresses may opt back in through the same flow.
            let token = generate_token();
            let updated = sqlx::query_as::<_, Subscriber>(
                r#"
                UPDATE subscribers
                SET status = 'pending', confirmation_token = $2, name = COALESCE($3, name)
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(subscriber.id)
            .bind(&token)
            .bind(&request.name)
            .fetch_one(&state.db_pool)
            .await
            .map_err(internal_error)?;
            (updated, token)
        }
        None => {
            let token = generate_token();
            let subscriber = sqlx::query_as::<_, Subscriber>(
                r#"
                INSERT INTO subscribers (id, email, name, status, unsubscribe_token, confirmation_token)
                VALUES ($1, $2, $3, 'pending', $4, $5)
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&email)
            .bind(&request.name)
            .bind(generate_token())
            .bind(&token)
            .fetch_one(&state.db_pool)
            .await
            .map_err(internal_error)?;
            (subscriber, token)
        }
    };

    let confirm_url = format!(
        "{}/api/newsletter/confirm/{}",
        state.config.site_url, confirmation_token
    );
    let html = format!(
        r#"<p>Please confirm your subscription by clicking the link below.</p>
<p><a href="{confirm_url}">Confirm subscription</a></p>
<p>If you did not request this, you can ignore this email.</p>"#
    );
    let email_out = OutgoingEmail {
        from: state.config.from_header(),
        to: vec![subscriber.email.clone()],
        subject: "Confirm your subscription".to_string(),
        html,
        reply_to: state.config.reply_to_address.clone(),
    };

    if let Err(e) = state.provider.send_email(&email_out).await {
        warn!(subscriber = %subscriber.id, error = %e, "failed to send confirmation email");
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "data": {"message": "confirmation email sent"}})),
    ))
}

/// Double-opt-in confirmation. Activates the subscriber and enrolls them
/// in every active sequence.
pub async fn confirm(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Redirect {
    let landing = format!("{}/newsletter/confirmed", state.config.site_url);
    if token.is_empty() {
        return Redirect::to(&format!("{}?status=error", landing));
    }

    let now = unix_now();
    let subscriber = sqlx::query_as::<_, Subscriber>(
        r#"
        UPDATE subscribers
        SET status = 'active', subscribed_at = $2, confirmation_token = NULL
        WHERE confirmation_token = $1 AND status = 'pending'
        RETURNING *
        "#,
    )
    .bind(&token)
    .bind(now)
    .fetch_optional(&state.db_pool)
    .await;

    match subscriber {
        Ok(Some(subscriber)) => {
            info!(subscriber = %subscriber.id, "subscription confirmed");
            match crate::services::sequences::enroll_in_active_sequences(
                &state.db_pool,
                subscriber.id,
                now,
            )
            .await
            {
                Ok(enrolled) if enrolled > 0 => {
                    info!(subscriber = %subscriber.id, enrolled, "enrolled in active sequences");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(subscriber = %subscriber.id, error = %e, "sequence enrollment on confirm failed");
                }
            }
            Redirect::to(&format!("{}?status=success", landing))
        }
        Ok(None) => Redirect::to(&format!("{}?status=error", landing)),
        Err(e) => {
            warn!(error = %e, "confirmation lookup failed");
            Redirect::to(&format!("{}?status=error", landing))
        }
    }
}

/// Token-based unsubscribe; always answers with a redirect to the public
/// confirmation page.
pub async fn unsubscribe(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Redirect {
    let landing = format!("{}/newsletter/unsubscribed", state.config.site_url);
    let outcome =
        unsubscribe_by_token(&state.db_pool, &state.provider, &token, unix_now()).await;

    match outcome {
        Ok(UnsubscribeOutcome::Unsubscribed) => {
            Redirect::to(&format!("{}?status=success", landing))
        }
        Ok(UnsubscribeOutcome::AlreadyUnsubscribed) => Redirect::to(&format!(
            "{}?status=info&message=Already+unsubscribed",
            landing
        )),
        Ok(UnsubscribeOutcome::InvalidToken) => {
            Redirect::to(&format!("{}?status=error", landing))
        }
        Err(e) => {
            warn!(error = %e, "unsubscribe failed");
            Redirect::to(&format!("{}?status=error", landing))
        }
    }
}

/// Published archive of sent campaigns.
pub async fn archive_index(
    State(state): State<AppState>,
) -> Result<Json<Value>, HandlerError> {
    let rows: Vec<(Uuid, String, Option<String>, Option<String>, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT id, subject, slug, excerpt, sent_at
        FROM campaigns
        WHERE status = 'sent' AND is_published = TRUE AND slug IS NOT NULL
        ORDER BY sent_at DESC NULLS LAST
        "#,
    )
    .fetch_all(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .map(|(id, subject, slug, excerpt, sent_at)| {
            json!({
                "id": id,
                "subject": subject,
                "slug": slug,
                "excerpt": excerpt,
                "sent_at": sent_at,
            })
        })
        .collect();

    Ok(Json(json!({"success": true, "data": data})))
}

pub async fn archive_entry(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let campaign = sqlx::query_as::<_, Campaign>(
        "SELECT * FROM campaigns WHERE slug = $1 AND status = 'sent' AND is_published = TRUE",
    )
    .bind(&slug)
    .fetch_optional(&state.db_pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| crate::handlers::not_found("archive entry not found"))?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "id": campaign.id,
            "subject": campaign.subject,
            "content": campaign.content,
            "slug": campaign.slug,
            "excerpt": campaign.excerpt,
            "sent_at": campaign.sent_at,
        }
    })))
}

/// Short-link redirector. Click analytics come from provider webhooks; the
/// redirect itself carries no delivery identity.
pub async fn short_link_redirect(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Redirect, HandlerError> {
    let original = sqlx::query_scalar::<_, String>(
        "SELECT original_url FROM short_urls WHERE short_code = $1",
    )
    .bind(&code)
    .fetch_optional(&state.db_pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| crate::handlers::not_found("unknown short link"))?;

    Ok(Redirect::temporary(&original))
}
