use sqlx::PgPool;
use tracing::{info, warn};

use crate::models::subscriber::{Subscriber, SubscriberStatus};
use crate::services::provider::ProviderClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    AlreadyUnsubscribed,
    InvalidToken,
}

/// Token-based opt-out. The store write is authoritative; mirroring the
/// state to the provider is best-effort and never fails the operation.
pub async fn unsubscribe_by_token(
    pool: &PgPool,
    provider: &ProviderClient,
    token: &str,
    now: i64,
) -> anyhow::Result<UnsubscribeOutcome> {
    if token.is_empty() {
        return Ok(UnsubscribeOutcome::InvalidToken);
    }

    let subscriber = sqlx::query_as::<_, Subscriber>(
        "SELECT * FROM subscribers WHERE unsubscribe_token = $1",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    let Some(subscriber) = subscriber else {
        return Ok(UnsubscribeOutcome::InvalidToken);
    };

    if subscriber.status == SubscriberStatus::Unsubscribed {
        return Ok(UnsubscribeOutcome::AlreadyUnsubscribed);
    }

    sqlx::query(
        "UPDATE subscribers SET status = 'unsubscribed', unsubscribed_at = $1 WHERE id = $2",
    )
    .bind(now)
    .bind(subscriber.id)
    .execute(pool)
    .await?;

    info!(subscriber = %subscriber.id, "subscriber unsubscribed");

    if let Err(e) = provider.mark_unsubscribed(&subscriber.email).await {
        warn!(
            subscriber = %subscriber.id,
            error = %e,
            "failed to mirror unsubscribe to provider"
        );
    }

    Ok(UnsubscribeOutcome::Unsubscribed)
}
