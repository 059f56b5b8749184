use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::campaign::{AbVariant, Campaign};
use crate::services::campaigns::{
    dispatch_error_is_terminal, dispatch_to_recipients, mark_campaign_failed,
};
use crate::services::delivery_log::variant_counts;
use crate::services::scheduler::TickContext;
use crate::services::sender::{target_subscribers, Recipient};

/// Weighting of the combined winner score.
const OPEN_WEIGHT: f64 = 0.4;
const CLICK_WEIGHT: f64 = 0.6;

/// Per-variant test group size for a target population. Small populations
/// test a larger fraction; the result is clipped so the remainder is never
/// empty. Populations too small to carry two groups and a remainder get no
/// test groups at all (the winner phase then defaults to variant A).
pub fn test_group_size(population: usize) -> usize {
    if population < 3 {
        return 0;
    }
    let share = if population < 50 { 0.2 } else { 0.1 };
    let size = ((population as f64) * share).ceil() as usize;
    size.max(1).min((population - 1) / 2)
}

/// Deterministic partition into (group A, group B, remainder) on the
/// targeting order.
pub fn partition_recipients(
    recipients: Vec<Recipient>,
) -> (Vec<Recipient>, Vec<Recipient>, Vec<Recipient>) {
    let group = test_group_size(recipients.len());
    let mut iter = recipients.into_iter();
    let group_a: Vec<Recipient> = iter.by_ref().take(group).collect();
    let group_b: Vec<Recipient> = iter.by_ref().take(group).collect();
    let remainder: Vec<Recipient> = iter.collect();
    (group_a, group_b, remainder)
}

/// Combined weighted score from per-variant counts (sent, opened, clicked).
pub fn variant_score(sent: i64, opened: i64, clicked: i64) -> f64 {
    if sent == 0 {
        return 0.0;
    }
    let open_rate = opened as f64 / sent as f64;
    let click_rate = clicked as f64 / sent as f64;
    OPEN_WEIGHT * open_rate + CLICK_WEIGHT * click_rate
}

/// Ties break to A.
pub fn pick_winner(a: (i64, i64, i64), b: (i64, i64, i64)) -> AbVariant {
    let score_a = variant_score(a.0, a.1, a.2);
    let score_b = variant_score(b.0, b.1, b.2);
    if score_b > score_a {
        AbVariant::B
    } else {
        AbVariant::A
    }
}

/// Tick stage: send test groups for A/B campaigns whose lead time has
/// arrived (`scheduled_at − ab_wait_hours`).
pub async fn process_test_phase(ctx: &TickContext, now: i64) -> anyhow::Result<usize> {
    let due = sqlx::query_as::<_, Campaign>(
        r#"
        SELECT * FROM campaigns
        WHERE ab_test_enabled = TRUE AND status = 'scheduled'
          AND ab_test_sent_at IS NULL
          AND scheduled_at IS NOT NULL
          AND scheduled_at - ab_wait_hours * 3600 <= $1
        ORDER BY scheduled_at ASC
        "#,
    )
    .bind(now)
    .fetch_all(&ctx.pool)
    .await?;

    let mut started = 0;
    for campaign in due {
        match run_test_phase(ctx, &campaign, now).await {
            Ok(()) => started += 1,
            Err(e) => {
                error!(campaign = %campaign.id, error = %e, "A/B test phase failed");
            }
        }
    }
    Ok(started)
}

async fn run_test_phase(ctx: &TickContext, campaign: &Campaign, now: i64) -> anyhow::Result<()> {
    let recipients = target_subscribers(&ctx.pool, campaign.contact_list_id).await?;
    let (group_a, group_b, remainder) = partition_recipients(recipients);

    // Persist the remainder first so the winner phase addresses exactly
    // this set, regardless of later audience changes.
    store_remainder(&ctx.pool, campaign.id, &remainder).await?;

    if !group_a.is_empty() {
        if let Err(e) = dispatch_to_recipients(
            ctx,
            campaign,
            &campaign.subject,
            &group_a,
            Some(AbVariant::A),
            now,
        )
        .await
        {
            if dispatch_error_is_terminal(&e) {
                mark_campaign_failed(&ctx.pool, campaign.id).await?;
            }
            return Err(e.into());
        }
    }

    if !group_b.is_empty() {
        let subject_b = campaign
            .ab_subject_b
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&campaign.subject);
        if let Err(e) = dispatch_to_recipients(
            ctx,
            campaign,
            subject_b,
            &group_b,
            Some(AbVariant::B),
            now,
        )
        .await
        {
            // Group A already went out; keep the campaign retryable unless
            // the provider says the request itself is bad.
            if dispatch_error_is_terminal(&e) {
                mark_campaign_failed(&ctx.pool, campaign.id).await?;
            }
            return Err(e.into());
        }
    }

    sqlx::query("UPDATE campaigns SET ab_test_sent_at = $1 WHERE id = $2")
        .bind(now)
        .bind(campaign.id)
        .execute(&ctx.pool)
        .await?;

    info!(
        campaign = %campaign.id,
        group_size = group_a.len(),
        remainder = remainder.len(),
        "A/B test groups sent"
    );
    Ok(())
}

async fn store_remainder(
    pool: &PgPool,
    campaign_id: Uuid,
    remainder: &[Recipient],
) -> sqlx::Result<()> {
    for recipient in remainder {
        sqlx::query(
            r#"
            INSERT INTO ab_test_recipients (campaign_id, subscriber_id)
            VALUES ($1, $2)
            ON CONFLICT (campaign_id, subscriber_id) DO NOTHING
            "#,
        )
        .bind(campaign_id)
        .bind(recipient.subscriber_id)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Tick stage: pick winners and send to the stored remainder once the main
/// schedule time arrives.
pub async fn process_winner_phase(ctx: &TickContext, now: i64) -> anyhow::Result<usize> {
    let due = sqlx::query_as::<_, Campaign>(
        r#"
        SELECT * FROM campaigns
        WHERE ab_test_enabled = TRUE AND status = 'scheduled'
          AND ab_test_sent_at IS NOT NULL
          AND scheduled_at IS NOT NULL AND scheduled_at <= $1
        ORDER BY scheduled_at ASC
        "#,
    )
    .bind(now)
    .fetch_all(&ctx.pool)
    .await?;

    let mut completed = 0;
    for campaign in due {
        match run_winner_phase(ctx, &campaign, now).await {
            Ok(()) => completed += 1,
            Err(e) => {
                error!(campaign = %campaign.id, error = %e, "A/B winner phase failed");
            }
        }
    }
    Ok(completed)
}

async fn run_winner_phase(ctx: &TickContext, campaign: &Campaign, now: i64) -> anyhow::Result<()> {
    let counts_a = variant_counts(&ctx.pool, campaign.id, AbVariant::A).await?;
    let counts_b = variant_counts(&ctx.pool, campaign.id, AbVariant::B).await?;
    let winner = pick_winner(counts_a, counts_b);

    let remainder = load_remainder(&ctx.pool, campaign.id).await?;

    let subject = match winner {
        AbVariant::B => campaign
            .ab_subject_b
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&campaign.subject),
        AbVariant::A => &campaign.subject,
    };

    if !remainder.is_empty() {
        if let Err(e) =
            dispatch_to_recipients(ctx, campaign, subject, &remainder, Some(winner), now).await
        {
            // The winner phase is terminal either way: the test groups are
            // out and the campaign cannot be rescheduled coherently.
            mark_campaign_failed(&ctx.pool, campaign.id).await?;
            return Err(e.into());
        }
    }

    let recipient_count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM delivery_logs WHERE campaign_id = $1 AND sent_at IS NOT NULL",
    )
    .bind(campaign.id)
    .fetch_one(&ctx.pool)
    .await?;

    sqlx::query(
        r#"
        UPDATE campaigns
        SET status = 'sent', ab_winner = $1, sent_at = $2, last_sent_at = $2, recipient_count = $3
        WHERE id = $4
        "#,
    )
    .bind(winner)
    .bind(now)
    .bind(recipient_count as i32)
    .bind(campaign.id)
    .execute(&ctx.pool)
    .await?;

    if let Err(e) = sqlx::query("DELETE FROM ab_test_recipients WHERE campaign_id = $1")
        .bind(campaign.id)
        .execute(&ctx.pool)
        .await
    {
        warn!(campaign = %campaign.id, error = %e, "failed to clear stored A/B remainder");
    }

    info!(campaign = %campaign.id, winner = ?winner, "A/B winner sent");
    Ok(())
}

/// The persisted remainder, re-checked against subscriber status so anyone
/// who unsubscribed between the phases is excluded.
async fn load_remainder(pool: &PgPool, campaign_id: Uuid) -> sqlx::Result<Vec<Recipient>> {
    let rows: Vec<(Uuid, String, Option<String>, String)> = sqlx::query_as(
        r#"
        SELECT s.id, s.email, s.name, s.unsubscribe_token
        FROM ab_test_recipients r
        JOIN subscribers s ON s.id = r.subscriber_id
        WHERE r.campaign_id = $1 AND s.status = 'active'
        ORDER BY s.created_at
        "#,
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(subscriber_id, email, name, unsubscribe_token)| Recipient {
            subscriber_id,
            email,
            name,
            unsubscribe_token,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient {
                subscriber_id: Uuid::new_v4(),
                email: format!("user{}@example.com", i),
                name: None,
                unsubscribe_token: format!("tok{}", i),
            })
            .collect()
    }

    #[test]
    fn large_populations_test_ten_percent_per_group() {
        assert_eq!(test_group_size(100), 10);
        assert_eq!(test_group_size(1000), 100);
    }

    #[test]
    fn small_populations_test_twenty_percent_per_group() {
        assert_eq!(test_group_size(40), 8);
        assert_eq!(test_group_size(10), 2);
    }

    #[test]
    fn tiny_populations_keep_a_nonempty_remainder() {
        assert_eq!(test_group_size(3), 1);
        assert_eq!(test_group_size(4), 1);
        assert_eq!(test_group_size(2), 0);
        assert_eq!(test_group_size(1), 0);
        assert_eq!(test_group_size(0), 0);
    }

    #[test]
    fn partition_is_disjoint_and_complete() {
        let all = recipients(25);
        let ids: Vec<Uuid> = all.iter().map(|r| r.subscriber_id).collect();
        let (a, b, rest) = partition_recipients(all);
        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 5);
        assert_eq!(rest.len(), 15);
        let mut recombined: Vec<Uuid> = a
            .iter()
            .chain(b.iter())
            .chain(rest.iter())
            .map(|r| r.subscriber_id)
            .collect();
        recombined.dedup();
        assert_eq!(recombined, ids);
    }

    #[test]
    fn higher_click_rate_wins_over_open_rate() {
        // A opens more, B clicks more; clicks weigh heavier.
        let a = (100, 50, 0);
        let b = (100, 10, 40);
        assert_eq!(pick_winner(a, b), AbVariant::B);
    }

    #[test]
    fn ties_break_to_a() {
        assert_eq!(pick_winner((100, 10, 5), (100, 10, 5)), AbVariant::A);
        assert_eq!(pick_winner((0, 0, 0), (0, 0, 0)), AbVariant::A);
    }

    #[test]
    fn zero_sends_score_zero() {
        assert_eq!(variant_score(0, 0, 0), 0.0);
        assert!(variant_score(10, 5, 1) > 0.0);
    }
}
