use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::campaign::AbVariant;
use crate::models::delivery_log::{DeliveryLog, DeliveryStatus};

/// Seconds within which a repeated click on the same URL is a no-op.
const CLICK_DEDUP_WINDOW: i64 = 60;

/// A send attempt about to be recorded.
#[derive(Debug, Clone)]
pub struct NewDeliveryLog {
    pub campaign_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    pub sequence_step_id: Option<Uuid>,
    pub subscriber_id: Uuid,
    pub email: String,
    pub email_subject: Option<String>,
    pub ab_variant: Option<AbVariant>,
}

impl NewDeliveryLog {
    pub fn for_campaign(campaign_id: Uuid, subscriber_id: Uuid, email: &str, subject: &str) -> Self {
        NewDeliveryLog {
            campaign_id: Some(campaign_id),
            sequence_id: None,
            sequence_step_id: None,
            subscriber_id,
            email: email.to_string(),
            email_subject: Some(subject.to_string()),
            ab_variant: None,
        }
    }

    pub fn for_sequence_step(
        sequence_id: Uuid,
        step_id: Uuid,
        subscriber_id: Uuid,
        email: &str,
        subject: &str,
    ) -> Self {
        NewDeliveryLog {
            campaign_id: None,
            sequence_id: Some(sequence_id),
            sequence_step_id: Some(step_id),
            subscriber_id,
            email: email.to_string(),
            email_subject: Some(subject.to_string()),
            ab_variant: None,
        }
    }

    pub fn variant(mut self, variant: AbVariant) -> Self {
        self.ab_variant = Some(variant);
        self
    }
}

/// Record a successful send: status `sent`, `sent_at` stamped.
pub async fn record_sent(
    pool: &PgPool,
    new: &NewDeliveryLog,
    provider_message_id: Option<&str>,
    now: i64,
) -> sqlx::Result<Uuid> {
    insert_log(pool, new, DeliveryStatus::Sent, provider_message_id, Some(now), None).await
}

/// Record an immediate failure: status `failed`, no `sent_at`.
pub async fn record_failed(
    pool: &PgPool,
    new: &NewDeliveryLog,
    error_message: &str,
    _now: i64,
) -> sqlx::Result<Uuid> {
    insert_log(pool, new, DeliveryStatus::Failed, None, None, Some(error_message)).await
}

async fn insert_log(
    pool: &PgPool,
    new: &NewDeliveryLog,
    status: DeliveryStatus,
    provider_message_id: Option<&str>,
    sent_at: Option<i64>,
    error_message: Option<&str>,
) -> sqlx::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO delivery_logs
            (id, campaign_id, sequence_id, sequence_step_id, subscriber_id, email,
             email_subject, ab_variant, status, provider_message_id, sent_at, error_message)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(id)
    .bind(new.campaign_id)
    .bind(new.sequence_id)
    .bind(new.sequence_step_id)
    .bind(new.subscriber_id)
    .bind(&new.email)
    .bind(&new.email_subject)
    .bind(new.ab_variant)
    .bind(status)
    .bind(provider_message_id)
    .bind(sent_at)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(id)
}

/// New values for the mutable columns of a delivery log after folding in
/// one webhook event.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFold {
    pub status: DeliveryStatus,
    pub delivered_at: Option<i64>,
    pub opened_at: Option<i64>,
    pub clicked_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Fold a webhook event into the row's current state. Returns `None` when
/// the event is ignored (downgrade along the success chain, or a repeat).
///
/// The success chain advances monotonically; failure states are terminal on
/// their own axis. A failure after success takes over the status but keeps
/// the success timestamps; a success after failure is recorded in the
/// timestamp columns without resurrecting the status.
pub fn fold_event(
    log: &DeliveryLog,
    incoming: DeliveryStatus,
    error_message: Option<&str>,
    now: i64,
) -> Option<StatusFold> {
    let mut fold = StatusFold {
        status: log.status,
        delivered_at: log.delivered_at,
        opened_at: log.opened_at,
        clicked_at: log.clicked_at,
        error_message: log.error_message.clone(),
    };

    if incoming.is_failure() {
        if log.status.is_failure() {
            return None;
        }
        fold.status = incoming;
        if let Some(message) = error_message {
            fold.error_message = Some(message.to_string());
        }
        return Some(fold);
    }

    if log.status.is_failure() {
        // Keep the terminal failure status but record the chain timestamp.
        let changed = stamp_chain(&mut fold, incoming, now);
        return changed.then_some(fold);
    }

    if incoming.chain_rank() <= log.status.chain_rank() {
        return None;
    }

    fold.status = incoming;
    stamp_chain(&mut fold, incoming, now);
    if let Some(message) = error_message {
        fold.error_message = Some(message.to_string());
    }
    Some(fold)
}

/// Stamp the event's own timestamp and back-fill earlier chain timestamps
/// that never arrived. Returns whether anything changed.
fn stamp_chain(fold: &mut StatusFold, incoming: DeliveryStatus, now: i64) -> bool {
    let mut changed = false;
    let rank = incoming.chain_rank();
    if rank >= 1 && fold.delivered_at.is_none() {
        fold.delivered_at = Some(now);
        changed = true;
    }
    if rank >= 2 && fold.opened_at.is_none() {
        fold.opened_at = Some(now);
        changed = true;
    }
    if rank >= 3 && fold.clicked_at.is_none() {
        fold.clicked_at = Some(now);
        changed = true;
    }
    changed
}

/// Correlate a webhook event with its delivery log and apply it. Broadcast
/// sends share one provider id across recipients, so the email-qualified
/// lookup runs first. Returns whether a row was updated.
pub async fn apply_webhook_event(
    pool: &PgPool,
    provider_message_id: &str,
    recipient_email: Option<&str>,
    incoming: DeliveryStatus,
    error_message: Option<&str>,
    clicked_url: Option<&str>,
    now: i64,
) -> anyhow::Result<bool> {
    let log = find_log(pool, provider_message_id, recipient_email).await?;

    let Some(log) = log else {
        warn!(
            provider_message_id,
            event = ?incoming,
            "webhook event has no matching delivery log, dropping"
        );
        return Ok(false);
    };

    if incoming == DeliveryStatus::Clicked {
        if let Some(url) = clicked_url {
            record_click(pool, &log, url, now).await?;
        }
    }

    let Some(fold) = fold_event(&log, incoming, error_message, now) else {
        debug!(
            log_id = %log.id,
            current = ?log.status,
            event = ?incoming,
            "skipped downgrade webhook event"
        );
        return Ok(false);
    };

    sqlx::query(
        r#"
        UPDATE delivery_logs
        SET status = $1, delivered_at = $2, opened_at = $3, clicked_at = $4, error_message = $5
        WHERE id = $6
        "#,
    )
    .bind(fold.status)
    .bind(fold.delivered_at)
    .bind(fold.opened_at)
    .bind(fold.clicked_at)
    .bind(&fold.error_message)
    .bind(log.id)
    .execute(pool)
    .await?;

    Ok(true)
}

async fn find_log(
    pool: &PgPool,
    provider_message_id: &str,
    recipient_email: Option<&str>,
) -> sqlx::Result<Option<DeliveryLog>> {
    if let Some(email) = recipient_email {
        let by_email = sqlx::query_as::<_, DeliveryLog>(
            "SELECT * FROM delivery_logs WHERE provider_message_id = $1 AND LOWER(email) = LOWER($2) ORDER BY created_at DESC LIMIT 1",
        )
        .bind(provider_message_id)
        .bind(email)
        .fetch_optional(pool)
        .await?;
        if by_email.is_some() {
            return Ok(by_email);
        }
    }
    sqlx::query_as::<_, DeliveryLog>(
        "SELECT * FROM delivery_logs WHERE provider_message_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(provider_message_id)
    .fetch_optional(pool)
    .await
}

/// Write a click event unless the same URL was clicked on this log within
/// the dedup window.
async fn record_click(pool: &PgPool, log: &DeliveryLog, url: &str, now: i64) -> sqlx::Result<()> {
    let duplicate = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM click_events WHERE delivery_log_id = $1 AND clicked_url = $2 AND clicked_at > $3",
    )
    .bind(log.id)
    .bind(url)
    .bind(now - CLICK_DEDUP_WINDOW)
    .fetch_one(pool)
    .await?;
    if duplicate > 0 {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO click_events (id, delivery_log_id, subscriber_id, clicked_url, clicked_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(log.id)
    .bind(log.subscriber_id)
    .bind(url)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Aggregated outcomes for one campaign. Counts use the timestamp columns
/// because status is a cursor: a clicked row still counts as delivered.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub total: i64,
    pub sent: i64,
    pub delivered: i64,
    pub opened: i64,
    pub clicked: i64,
    pub bounced: i64,
    pub failed: i64,
    pub open_rate: i64,
    pub click_rate: i64,
}

pub async fn campaign_stats(pool: &PgPool, campaign_id: Uuid) -> sqlx::Result<CampaignStats> {
    let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE sent_at IS NOT NULL),
            COUNT(*) FILTER (WHERE delivered_at IS NOT NULL),
            COUNT(*) FILTER (WHERE opened_at IS NOT NULL),
            COUNT(*) FILTER (WHERE clicked_at IS NOT NULL),
            COUNT(*) FILTER (WHERE status = 'bounced'),
            COUNT(*) FILTER (WHERE status = 'failed')
        FROM delivery_logs
        WHERE campaign_id = $1
        "#,
    )
    .bind(campaign_id)
    .fetch_one(pool)
    .await?;

    let (total, sent, delivered, opened, clicked, bounced, failed) = row;
    Ok(CampaignStats {
        total,
        sent,
        delivered,
        opened,
        clicked,
        bounced,
        failed,
        open_rate: rate(opened, sent),
        click_rate: rate(clicked, sent),
    })
}

/// Per-variant counts used for A/B winner scoring.
pub async fn variant_counts(
    pool: &PgPool,
    campaign_id: Uuid,
    variant: AbVariant,
) -> sqlx::Result<(i64, i64, i64)> {
    sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE sent_at IS NOT NULL),
            COUNT(*) FILTER (WHERE opened_at IS NOT NULL),
            COUNT(*) FILTER (WHERE clicked_at IS NOT NULL)
        FROM delivery_logs
        WHERE campaign_id = $1 AND ab_variant = $2
        "#,
    )
    .bind(campaign_id)
    .bind(variant)
    .fetch_one(pool)
    .await
}

/// Dashboard-wide delivery counters.
pub async fn global_stats(pool: &PgPool) -> sqlx::Result<CampaignStats> {
    let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE sent_at IS NOT NULL),
            COUNT(*) FILTER (WHERE delivered_at IS NOT NULL),
            COUNT(*) FILTER (WHERE opened_at IS NOT NULL),
            COUNT(*) FILTER (WHERE clicked_at IS NOT NULL),
            COUNT(*) FILTER (WHERE status = 'bounced'),
            COUNT(*) FILTER (WHERE status = 'failed')
        FROM delivery_logs
        "#,
    )
    .fetch_one(pool)
    .await?;

    let (total, sent, delivered, opened, clicked, bounced, failed) = row;
    Ok(CampaignStats {
        total,
        sent,
        delivered,
        opened,
        clicked,
        bounced,
        failed,
        open_rate: rate(opened, sent),
        click_rate: rate(clicked, sent),
    })
}

/// Integer percentage, zero-guarded.
fn rate(part: i64, whole: i64) -> i64 {
    if whole == 0 {
        0
    } else {
        part * 100 / whole
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(status: DeliveryStatus) -> DeliveryLog {
        DeliveryLog {
            id: Uuid::new_v4(),
            campaign_id: Some(Uuid::new_v4()),
            sequence_id: None,
            sequence_step_id: None,
            subscriber_id: Uuid::new_v4(),
            email: "user@example.com".to_string(),
            email_subject: Some("Subject".to_string()),
            ab_variant: None,
            status,
            provider_message_id: Some("msg_1".to_string()),
            sent_at: Some(100),
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            error_message: None,
            created_at: 100,
        }
    }

    #[test]
    fn delivered_advances_sent() {
        let log = log_with(DeliveryStatus::Sent);
        let fold = fold_event(&log, DeliveryStatus::Delivered, None, 200).unwrap();
        assert_eq!(fold.status, DeliveryStatus::Delivered);
        assert_eq!(fold.delivered_at, Some(200));
        assert_eq!(fold.opened_at, None);
    }

    #[test]
    fn opened_backfills_delivered() {
        let log = log_with(DeliveryStatus::Sent);
        let fold = fold_event(&log, DeliveryStatus::Opened, None, 200).unwrap();
        assert_eq!(fold.status, DeliveryStatus::Opened);
        assert_eq!(fold.delivered_at, Some(200));
        assert_eq!(fold.opened_at, Some(200));
        assert_eq!(fold.clicked_at, None);
    }

    #[test]
    fn clicked_backfills_delivered_and_opened() {
        let log = log_with(DeliveryStatus::Sent);
        let fold = fold_event(&log, DeliveryStatus::Clicked, None, 300).unwrap();
        assert_eq!(fold.status, DeliveryStatus::Clicked);
        assert_eq!(fold.delivered_at, Some(300));
        assert_eq!(fold.opened_at, Some(300));
        assert_eq!(fold.clicked_at, Some(300));
    }

    #[test]
    fn backfill_preserves_existing_timestamps() {
        let mut log = log_with(DeliveryStatus::Delivered);
        log.delivered_at = Some(150);
        let fold = fold_event(&log, DeliveryStatus::Clicked, None, 300).unwrap();
        assert_eq!(fold.delivered_at, Some(150));
        assert_eq!(fold.opened_at, Some(300));
        assert_eq!(fold.clicked_at, Some(300));
    }

    #[test]
    fn earlier_chain_event_is_ignored() {
        let mut log = log_with(DeliveryStatus::Clicked);
        log.delivered_at = Some(110);
        log.opened_at = Some(120);
        log.clicked_at = Some(130);
        assert!(fold_event(&log, DeliveryStatus::Opened, None, 200).is_none());
        assert!(fold_event(&log, DeliveryStatus::Delivered, None, 200).is_none());
        assert!(fold_event(&log, DeliveryStatus::Clicked, None, 200).is_none());
    }

    #[test]
    fn failure_after_success_keeps_success_timestamps() {
        let mut log = log_with(DeliveryStatus::Clicked);
        log.delivered_at = Some(110);
        log.opened_at = Some(120);
        log.clicked_at = Some(130);
        let fold =
            fold_event(&log, DeliveryStatus::Bounced, Some("mailbox full"), 300).unwrap();
        assert_eq!(fold.status, DeliveryStatus::Bounced);
        assert_eq!(fold.error_message.as_deref(), Some("mailbox full"));
        assert_eq!(fold.delivered_at, Some(110));
        assert_eq!(fold.opened_at, Some(120));
        assert_eq!(fold.clicked_at, Some(130));
    }

    #[test]
    fn failure_after_failure_is_ignored() {
        let log = log_with(DeliveryStatus::Bounced);
        assert!(fold_event(&log, DeliveryStatus::Failed, Some("again"), 300).is_none());
    }

    #[test]
    fn success_after_failure_records_timestamp_but_keeps_status() {
        let log = log_with(DeliveryStatus::Bounced);
        let fold = fold_event(&log, DeliveryStatus::Opened, None, 400).unwrap();
        assert_eq!(fold.status, DeliveryStatus::Bounced);
        assert_eq!(fold.opened_at, Some(400));
    }

    #[test]
    fn error_message_only_updates_when_supplied() {
        let mut log = log_with(DeliveryStatus::Sent);
        log.error_message = Some("previous".to_string());
        let fold = fold_event(&log, DeliveryStatus::Delivered, None, 200).unwrap();
        assert_eq!(fold.error_message.as_deref(), Some("previous"));
    }

    #[test]
    fn rate_is_zero_guarded() {
        assert_eq!(rate(5, 0), 0);
        assert_eq!(rate(5, 10), 50);
        assert_eq!(rate(1, 3), 33);
    }
}
