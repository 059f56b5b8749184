use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::campaign::{AbVariant, Campaign, ScheduleConfig, ScheduleKind};
use crate::services::delivery_log::{record_sent, NewDeliveryLog};
use crate::services::renderer::{prepare_body, resolve_template_id, ShortenScope};
use crate::services::scheduler::TickContext;
use crate::services::sender::{target_subscribers, Recipient, SendContent, SendError, SendReport};

/// Tick stage: plain (non-A/B) scheduled campaigns whose time has come, in
/// ascending schedule order. Each campaign is isolated; one failure never
/// blocks the rest.
pub async fn process_scheduled_campaigns(ctx: &TickContext, now: i64) -> anyhow::Result<usize> {
    let due = sqlx::query_as::<_, Campaign>(
        r#"
        SELECT * FROM campaigns
        WHERE status = 'scheduled' AND ab_test_enabled = FALSE
          AND scheduled_at IS NOT NULL AND scheduled_at <= $1
        ORDER BY scheduled_at ASC
        "#,
    )
    .bind(now)
    .fetch_all(&ctx.pool)
    .await?;

    let mut sent = 0;
    for campaign in due {
        match send_campaign(ctx, &campaign, now).await {
            Ok(()) => sent += 1,
            Err(e) => {
                error!(campaign = %campaign.id, error = %e, "campaign dispatch failed");
            }
        }
    }
    Ok(sent)
}

/// Dispatch one campaign to its full target audience and record the
/// outcome on the campaign row.
pub async fn send_campaign(ctx: &TickContext, campaign: &Campaign, now: i64) -> anyhow::Result<()> {
    let recipients = target_subscribers(&ctx.pool, campaign.contact_list_id).await?;

    let report = dispatch_to_recipients(
        ctx,
        campaign,
        &campaign.subject,
        &recipients,
        None,
        now,
    )
    .await;

    match report {
        Ok(report) => {
            finish_campaign(ctx, campaign, report.accepted.len() as i32, now).await?;
            info!(campaign = %campaign.id, recipients = report.accepted.len(), "campaign sent");
            Ok(())
        }
        Err(e) => {
            if dispatch_error_is_terminal(&e) {
                mark_campaign_failed(&ctx.pool, campaign.id).await?;
            }
            Err(e.into())
        }
    }
}

/// Failures out of `dispatch_to_recipients`: provider-level send errors
/// keep their taxonomy; anything else (rendering, store) is transient and
/// retried on a later tick.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub fn dispatch_error_is_terminal(error: &DispatchError) -> bool {
    match error {
        DispatchError::Send(e) => send_error_is_terminal(e),
        DispatchError::Other(_) => false,
    }
}

/// Shared dispatch used by plain campaigns and both A/B phases: prepare
/// the body once, hand it to the configured sender, and write one delivery
/// log per acknowledged recipient.
pub async fn dispatch_to_recipients(
    ctx: &TickContext,
    campaign: &Campaign,
    subject: &str,
    recipients: &[Recipient],
    variant: Option<AbVariant>,
    now: i64,
) -> Result<SendReport, DispatchError> {
    if recipients.is_empty() {
        return Ok(SendReport::default());
    }

    let brand = crate::services::load_brand_settings(&ctx.pool).await;
    let template_id = resolve_template_id(campaign.template_id.as_deref(), &brand);

    let body = prepare_body(
        &ctx.pool,
        &campaign.content,
        Some(ShortenScope::Campaign(campaign.id)),
        &ctx.config.short_link_base(),
    )
    .await?;

    let segment_id = resolve_segment(ctx, campaign).await;
    let from = match variant {
        Some(AbVariant::B) => campaign
            .ab_from_name_b
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|name| format!("{} <{}>", name, ctx.config.sender_email))
            .unwrap_or_else(|| ctx.config.from_header()),
        _ => ctx.config.from_header(),
    };
    let reply_to = campaign
        .reply_to
        .clone()
        .or_else(|| ctx.config.reply_to_address.clone());

    let content = SendContent {
        body: &body,
        subject,
        from: &from,
        reply_to: reply_to.as_deref(),
        template_id: &template_id,
        brand: &brand,
        segment_id: segment_id.as_deref(),
    };

    let report = ctx
        .sender
        .dispatch(&content, recipients)
        .await
        .map_err(DispatchError::Send)?;

    for outcome in &report.accepted {
        let mut new_log =
            NewDeliveryLog::for_campaign(campaign.id, outcome.subscriber_id, &outcome.email, subject);
        if let Some(variant) = variant {
            new_log = new_log.variant(variant);
        }
        if let Err(e) = record_sent(
            &ctx.pool,
            &new_log,
            outcome.provider_message_id.as_deref(),
            now,
        )
        .await
        {
            warn!(
                campaign = %campaign.id,
                email = %outcome.email,
                provider_message_id = outcome.provider_message_id.as_deref().unwrap_or(""),
                error = %e,
                "send succeeded but delivery log write failed"
            );
        }
    }

    for failure in &report.contact_failures {
        warn!(
            campaign = %campaign.id,
            email = %failure.email,
            error = %failure.error,
            "recipient unreachable on broadcast path"
        );
    }

    Ok(report)
}

/// Broadcast segment resolution: the campaign's list segment, else the
/// deployment default.
async fn resolve_segment(ctx: &TickContext, campaign: &Campaign) -> Option<String> {
    if let Some(list_id) = campaign.contact_list_id {
        let segment = sqlx::query_scalar::<_, Option<String>>(
            "SELECT provider_segment_id FROM contact_lists WHERE id = $1",
        )
        .bind(list_id)
        .fetch_optional(&ctx.pool)
        .await
        .ok()
        .flatten()
        .flatten();
        if segment.is_some() {
            return segment;
        }
    }
    ctx.config.default_segment_id.clone()
}

/// Post-send accounting. Recurring campaigns stay `scheduled` and move
/// their `scheduled_at` forward; one-shot campaigns become `sent`.
async fn finish_campaign(
    ctx: &TickContext,
    campaign: &Campaign,
    recipient_count: i32,
    now: i64,
) -> anyhow::Result<()> {
    if campaign.schedule_type != ScheduleKind::None {
        let next = campaign
            .schedule_config()
            .and_then(|config| {
                next_occurrence(campaign.schedule_type, &config, now, ctx.regional_offset)
            });
        match next {
            Some(next) => {
                sqlx::query(
                    "UPDATE campaigns SET last_sent_at = $1, scheduled_at = $2, recipient_count = $3 WHERE id = $4",
                )
                .bind(now)
                .bind(next)
                .bind(recipient_count)
                .bind(campaign.id)
                .execute(&ctx.pool)
                .await?;
                return Ok(());
            }
            None => {
                warn!(campaign = %campaign.id, "recurring campaign has unusable schedule config, finalizing as sent");
            }
        }
    }

    sqlx::query(
        "UPDATE campaigns SET status = 'sent', sent_at = $1, last_sent_at = $1, recipient_count = $2 WHERE id = $3",
    )
    .bind(now)
    .bind(recipient_count)
    .bind(campaign.id)
    .execute(&ctx.pool)
    .await?;
    Ok(())
}

pub async fn mark_campaign_failed(pool: &PgPool, campaign_id: Uuid) -> sqlx::Result<()> {
    sqlx::query("UPDATE campaigns SET status = 'failed' WHERE id = $1")
        .bind(campaign_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Whether a send error should finalize the campaign as failed rather than
/// leaving it scheduled for the next tick.
fn send_error_is_terminal(error: &SendError) -> bool {
    match error {
        SendError::MissingSegment | SendError::NoReachableRecipients => true,
        SendError::Provider(e) => !e.is_retryable(),
    }
}

/// Next run of a recurring campaign, computed in the regional calendar.
///
/// daily: next calendar day at hour:minute. weekly: next occurrence of the
/// configured weekday (0 = Sunday), strictly after today. monthly: same
/// day next month, clamped to the month's last day.
pub fn next_occurrence(
    kind: ScheduleKind,
    config: &ScheduleConfig,
    after: i64,
    offset: FixedOffset,
) -> Option<i64> {
    if config.hour > 23 || config.minute > 59 {
        return None;
    }
    let local = DateTime::<Utc>::from_timestamp(after, 0)?.with_timezone(&offset);
    let today = local.date_naive();

    let next_day = match kind {
        ScheduleKind::Daily => today.checked_add_days(Days::new(1))?,
        ScheduleKind::Weekly => {
            let target = config.day_of_week.unwrap_or(1).min(6);
            let today_dow = today.weekday().num_days_from_sunday();
            let mut ahead = (target + 7 - today_dow) % 7;
            if ahead == 0 {
                ahead = 7;
            }
            today.checked_add_days(Days::new(u64::from(ahead)))?
        }
        ScheduleKind::Monthly => {
            let day = config.day_of_month.unwrap_or(today.day());
            let (year, month) = if today.month() == 12 {
                (today.year() + 1, 1)
            } else {
                (today.year(), today.month() + 1)
            };
            clamp_to_month(year, month, day)?
        }
        ScheduleKind::None => return None,
    };

    let scheduled = next_day
        .and_hms_opt(config.hour, config.minute, 0)?
        .and_local_timezone(offset)
        .single()?;
    Some(scheduled.timestamp())
}

/// The requested day of month, or the month's last day when it overflows
/// (e.g. the 31st in February).
fn clamp_to_month(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
        return Some(date);
    }
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    first_of_next.pred_opt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset_plus_9() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn config(hour: u32, minute: u32) -> ScheduleConfig {
        ScheduleConfig {
            hour,
            minute,
            day_of_week: None,
            day_of_month: None,
        }
    }

    fn regional(y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
            .and_local_timezone(offset_plus_9())
            .unwrap()
            .timestamp()
    }

    #[test]
    fn daily_moves_to_next_calendar_day() {
        let after = regional(2024, 1, 15, 9, 0);
        let next = next_occurrence(ScheduleKind::Daily, &config(9, 0), after, offset_plus_9());
        assert_eq!(next, Some(regional(2024, 1, 16, 9, 0)));
    }

    #[test]
    fn weekly_lands_on_next_monday_strictly_after_today() {
        // 2024-01-15 is a Monday; the next weekly Monday run is the 22nd.
        let after = regional(2024, 1, 15, 9, 0);
        let mut cfg = config(9, 0);
        cfg.day_of_week = Some(1);
        let next = next_occurrence(ScheduleKind::Weekly, &cfg, after, offset_plus_9());
        assert_eq!(next, Some(regional(2024, 1, 22, 9, 0)));
    }

    #[test]
    fn weekly_defaults_to_monday() {
        // 2024-01-17 is a Wednesday; default weekday is Monday the 22nd.
        let after = regional(2024, 1, 17, 9, 0);
        let next = next_occurrence(ScheduleKind::Weekly, &config(9, 0), after, offset_plus_9());
        assert_eq!(next, Some(regional(2024, 1, 22, 9, 0)));
    }

    #[test]
    fn monthly_keeps_the_day_of_month() {
        let after = regional(2024, 3, 15, 8, 30);
        let mut cfg = config(8, 30);
        cfg.day_of_month = Some(15);
        let next = next_occurrence(ScheduleKind::Monthly, &cfg, after, offset_plus_9());
        assert_eq!(next, Some(regional(2024, 4, 15, 8, 30)));
    }

    #[test]
    fn monthly_on_day_31_clamps_to_february_end() {
        let after = regional(2024, 1, 31, 10, 0);
        let mut cfg = config(10, 0);
        cfg.day_of_month = Some(31);
        let next = next_occurrence(ScheduleKind::Monthly, &cfg, after, offset_plus_9());
        // 2024 is a leap year.
        assert_eq!(next, Some(regional(2024, 2, 29, 10, 0)));
    }

    #[test]
    fn monthly_rolls_over_december() {
        let after = regional(2024, 12, 10, 7, 0);
        let mut cfg = config(7, 0);
        cfg.day_of_month = Some(10);
        let next = next_occurrence(ScheduleKind::Monthly, &cfg, after, offset_plus_9());
        assert_eq!(next, Some(regional(2025, 1, 10, 7, 0)));
    }

    #[test]
    fn invalid_time_yields_nothing() {
        let after = regional(2024, 1, 15, 9, 0);
        assert_eq!(
            next_occurrence(ScheduleKind::Daily, &config(24, 0), after, offset_plus_9()),
            None
        );
        assert_eq!(
            next_occurrence(ScheduleKind::None, &config(9, 0), after, offset_plus_9()),
            None
        );
    }

    #[test]
    fn terminal_errors_finalize_the_campaign() {
        assert!(send_error_is_terminal(&SendError::MissingSegment));
        assert!(send_error_is_terminal(&SendError::Provider(
            crate::services::provider::ProviderError::ClientError {
                status: 422,
                message: "bad".to_string(),
            }
        )));
        assert!(!send_error_is_terminal(&SendError::Provider(
            crate::services::provider::ProviderError::Transport("timeout".to_string())
        )));
    }
}
