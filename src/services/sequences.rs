use chrono::{DateTime, Days, FixedOffset, Utc};
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::sequence::SequenceEnrollment;
use crate::services::delivery_log::{record_failed, record_sent, NewDeliveryLog};
use crate::services::renderer::{prepare_body, resolve_template_id, ShortenScope};
use crate::services::scheduler::TickContext;
use crate::services::sender::{Recipient, SendContent};
use crate::utils::parse_hhmm;

/// One (enrollment, next step) candidate from the dispatch join.
#[derive(Debug, Clone, FromRow)]
pub struct DueCandidate {
    pub enrollment_id: Uuid,
    pub subscriber_id: Uuid,
    pub sequence_id: Uuid,
    pub current_step: i32,
    pub started_at: i64,
    pub email: String,
    pub subscriber_name: Option<String>,
    pub unsubscribe_token: String,
    pub default_send_time: String,
    pub sequence_reply_to: Option<String>,
    pub step_id: Uuid,
    pub step_number: i32,
    pub delay_days: i32,
    pub delay_time: Option<String>,
    pub delay_minutes: Option<i32>,
    pub subject: String,
    pub content: String,
    pub template_id: Option<String>,
}

/// Active enrollments of active subscribers in active sequences whose next
/// enabled step exists.
pub async fn due_step_candidates(pool: &PgPool) -> sqlx::Result<Vec<DueCandidate>> {
    sqlx::query_as::<_, DueCandidate>(
        r#"
        SELECT e.id AS enrollment_id, e.subscriber_id, e.sequence_id, e.current_step, e.started_at,
               s.email, s.name AS subscriber_name, s.unsubscribe_token,
               q.default_send_time, q.reply_to AS sequence_reply_to,
               st.id AS step_id, st.step_number, st.delay_days, st.delay_time, st.delay_minutes,
               st.subject, st.content, st.template_id
        FROM sequence_enrollments e
        JOIN subscribers s ON s.id = e.subscriber_id AND s.status = 'active'
        JOIN sequences q ON q.id = e.sequence_id AND q.is_active
        JOIN sequence_steps st ON st.sequence_id = e.sequence_id
            AND st.is_enabled AND st.step_number = e.current_step + 1
        WHERE e.completed_at IS NULL
        ORDER BY e.started_at
        "#,
    )
    .fetch_all(pool)
    .await
}

/// When the candidate's next step becomes due, in Unix seconds. `None`
/// means the step cannot be scheduled this tick (minutes mode with no
/// previous send on record).
///
/// Day-anchored mode: midnight of the regional day `delay_days` after
/// enrollment, plus the step's time of day (falling back to the sequence
/// default). Minutes mode: offset from enrollment for step 1, otherwise
/// from the previous step's send.
pub fn step_due_at(
    candidate: &DueCandidate,
    offset: FixedOffset,
    prev_step_sent_at: Option<i64>,
) -> Option<i64> {
    if let Some(minutes) = candidate.delay_minutes {
        let base = if candidate.step_number <= 1 {
            candidate.started_at
        } else {
            prev_step_sent_at?
        };
        return Some(base + i64::from(minutes) * 60);
    }

    let send_time = candidate
        .delay_time
        .as_deref()
        .unwrap_or(&candidate.default_send_time);
    let (hour, minute) = parse_hhmm(send_time)?;

    let started = DateTime::<Utc>::from_timestamp(candidate.started_at, 0)?.with_timezone(&offset);
    let day = started
        .date_naive()
        .checked_add_days(Days::new(candidate.delay_days as u64))?;
    let scheduled = day
        .and_hms_opt(hour, minute, 0)?
        .and_local_timezone(offset)
        .single()?;
    Some(scheduled.timestamp())
}

/// Unix second of the previous step's most recent send for this
/// enrollment, if any.
async fn previous_step_sent_at(
    pool: &PgPool,
    candidate: &DueCandidate,
) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar::<_, Option<i64>>(
        r#"
        SELECT l.sent_at
        FROM delivery_logs l
        JOIN sequence_steps st ON st.id = l.sequence_step_id AND st.step_number = $3
        WHERE l.sequence_id = $1 AND l.subscriber_id = $2 AND l.sent_at IS NOT NULL
        ORDER BY l.sent_at DESC
        LIMIT 1
        "#,
    )
    .bind(candidate.sequence_id)
    .bind(candidate.subscriber_id)
    .bind(candidate.current_step)
    .fetch_optional(pool)
    .await
    .map(Option::flatten)
}

/// Tick stage: dispatch every due enrollment step. Failures are isolated
/// per enrollment; the cursor only advances after a successful send.
pub async fn process_due_sequences(ctx: &TickContext, now: i64) -> anyhow::Result<usize> {
    let candidates = due_step_candidates(&ctx.pool).await?;
    let mut dispatched = 0;

    for candidate in candidates {
        let prev_sent_at = if candidate.delay_minutes.is_some() && candidate.step_number > 1 {
            match previous_step_sent_at(&ctx.pool, &candidate).await {
                Ok(prev) => {
                    if prev.is_none() {
                        // Previous log missing or unsent; not a failure,
                        // the step waits for a later tick.
                        continue;
                    }
                    prev
                }
                Err(e) => {
                    error!(enrollment = %candidate.enrollment_id, error = %e, "failed to load previous step log");
                    continue;
                }
            }
        } else {
            None
        };

        let Some(due_at) = step_due_at(&candidate, ctx.regional_offset, prev_sent_at) else {
            continue;
        };
        if due_at > now {
            continue;
        }

        match dispatch_step(ctx, &candidate, now).await {
            Ok(()) => dispatched += 1,
            Err(e) => {
                error!(
                    enrollment = %candidate.enrollment_id,
                    step = candidate.step_number,
                    error = %e,
                    "sequence step dispatch failed, will retry next tick"
                );
            }
        }
    }

    Ok(dispatched)
}

async fn dispatch_step(ctx: &TickContext, candidate: &DueCandidate, now: i64) -> anyhow::Result<()> {
    let brand = crate::services::load_brand_settings(&ctx.pool).await;
    let template_id = resolve_template_id(candidate.template_id.as_deref(), &brand);

    let body = prepare_body(
        &ctx.pool,
        &candidate.content,
        Some(ShortenScope::SequenceStep(candidate.step_id)),
        &ctx.config.short_link_base(),
    )
    .await?;

    let recipient = Recipient {
        subscriber_id: candidate.subscriber_id,
        email: candidate.email.clone(),
        name: candidate.subscriber_name.clone(),
        unsubscribe_token: candidate.unsubscribe_token.clone(),
    };

    let from = ctx.config.from_header();
    let reply_to = candidate
        .sequence_reply_to
        .clone()
        .or_else(|| ctx.config.reply_to_address.clone());
    let content = SendContent {
        body: &body,
        subject: &candidate.subject,
        from: &from,
        reply_to: reply_to.as_deref(),
        template_id: &template_id,
        brand: &brand,
        segment_id: ctx.config.default_segment_id.as_deref(),
    };

    let new_log = NewDeliveryLog::for_sequence_step(
        candidate.sequence_id,
        candidate.step_id,
        candidate.subscriber_id,
        &candidate.email,
        &candidate.subject,
    );

    match ctx.sender.dispatch(&content, &[recipient]).await {
        Ok(report) => {
            let provider_id = report
                .accepted
                .first()
                .and_then(|o| o.provider_message_id.clone());
            // The send already happened; a failed log write must not
            // trigger a resend, so it only warns.
            if let Err(e) = record_sent(&ctx.pool, &new_log, provider_id.as_deref(), now).await {
                warn!(
                    enrollment = %candidate.enrollment_id,
                    provider_message_id = provider_id.as_deref().unwrap_or(""),
                    error = %e,
                    "sequence send succeeded but delivery log write failed"
                );
            }
            advance_enrollment(ctx, candidate, now).await?;
            info!(
                enrollment = %candidate.enrollment_id,
                step = candidate.step_number,
                "dispatched sequence step"
            );
            Ok(())
        }
        Err(e) => {
            if let Err(log_err) =
                record_failed(&ctx.pool, &new_log, &e.to_string(), now).await
            {
                warn!(enrollment = %candidate.enrollment_id, error = %log_err, "failed to record dispatch failure");
            }
            Err(e.into())
        }
    }
}

/// Move the cursor to the dispatched step; mark the enrollment complete
/// when that was the last enabled step.
async fn advance_enrollment(
    ctx: &TickContext,
    candidate: &DueCandidate,
    now: i64,
) -> anyhow::Result<()> {
    let enabled_steps = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sequence_steps WHERE sequence_id = $1 AND is_enabled",
    )
    .bind(candidate.sequence_id)
    .fetch_one(&ctx.pool)
    .await?;

    let completed_at = if i64::from(candidate.step_number) >= enabled_steps {
        Some(now)
    } else {
        None
    };

    sqlx::query(
        "UPDATE sequence_enrollments SET current_step = $1, completed_at = $2 WHERE id = $3",
    )
    .bind(candidate.step_number)
    .bind(completed_at)
    .bind(candidate.enrollment_id)
    .execute(&ctx.pool)
    .await?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("subscriber not found")]
    SubscriberNotFound,
    #[error("subscriber is not active")]
    SubscriberInactive,
    #[error("sequence not found")]
    SequenceNotFound,
    #[error("sequence is not active")]
    SequenceInactive,
    #[error("subscriber is already enrolled")]
    AlreadyEnrolled,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Strict enrollment used by the admin API.
pub async fn enroll_subscriber(
    pool: &PgPool,
    sequence_id: Uuid,
    subscriber_id: Uuid,
    now: i64,
) -> Result<SequenceEnrollment, EnrollError> {
    let subscriber: Option<(crate::models::subscriber::SubscriberStatus,)> =
        sqlx::query_as("SELECT status FROM subscribers WHERE id = $1")
            .bind(subscriber_id)
            .fetch_optional(pool)
            .await?;
    match subscriber {
        None => return Err(EnrollError::SubscriberNotFound),
        Some((status,)) if status != crate::models::subscriber::SubscriberStatus::Active => {
            return Err(EnrollError::SubscriberInactive)
        }
        Some(_) => {}
    }

    let sequence: Option<(bool,)> =
        sqlx::query_as("SELECT is_active FROM sequences WHERE id = $1")
            .bind(sequence_id)
            .fetch_optional(pool)
            .await?;
    match sequence {
        None => return Err(EnrollError::SequenceNotFound),
        Some((false,)) => return Err(EnrollError::SequenceInactive),
        Some((true,)) => {}
    }

    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sequence_enrollments WHERE subscriber_id = $1 AND sequence_id = $2",
    )
    .bind(subscriber_id)
    .bind(sequence_id)
    .fetch_one(pool)
    .await?;
    if existing > 0 {
        return Err(EnrollError::AlreadyEnrolled);
    }

    let enrollment = sqlx::query_as::<_, SequenceEnrollment>(
        r#"
        INSERT INTO sequence_enrollments (id, subscriber_id, sequence_id, current_step, started_at)
        VALUES ($1, $2, $3, 0, $4)
        RETURNING id, subscriber_id, sequence_id, current_step, started_at, completed_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(subscriber_id)
    .bind(sequence_id)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(enrollment)
}

/// Enroll a just-confirmed subscriber into every active sequence. An
/// existing enrollment means "already enrolled" and is skipped silently.
pub async fn enroll_in_active_sequences(
    pool: &PgPool,
    subscriber_id: Uuid,
    now: i64,
) -> sqlx::Result<usize> {
    let sequence_ids =
        sqlx::query_scalar::<_, Uuid>("SELECT id FROM sequences WHERE is_active")
            .fetch_all(pool)
            .await?;

    let mut enrolled = 0;
    for sequence_id in sequence_ids {
        let inserted = sqlx::query(
            r#"
            INSERT INTO sequence_enrollments (id, subscriber_id, sequence_id, current_step, started_at)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (subscriber_id, sequence_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscriber_id)
        .bind(sequence_id)
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
        enrolled += inserted as usize;
    }
    Ok(enrolled)
}

#[derive(Debug, Error)]
pub enum StepSwapError {
    #[error("invalid time format in step {step}: {value}")]
    InvalidTime { step: i32, value: String },
    #[error("invalid delay in step {step}")]
    InvalidDelay { step: i32 },
    #[error("step numbers must be contiguous starting at 1")]
    InvalidNumbering,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Validate a replacement step set before any writes.
pub fn validate_steps(steps: &[crate::models::sequence::StepInput]) -> Result<(), StepSwapError> {
    let mut numbers: Vec<i32> = steps.iter().map(|s| s.step_number).collect();
    numbers.sort_unstable();
    for (i, number) in numbers.iter().enumerate() {
        if *number != i as i32 + 1 {
            return Err(StepSwapError::InvalidNumbering);
        }
    }
    for step in steps {
        if step.delay_days < 0 {
            return Err(StepSwapError::InvalidDelay {
                step: step.step_number,
            });
        }
        if matches!(step.delay_minutes, Some(m) if m < 0) {
            return Err(StepSwapError::InvalidDelay {
                step: step.step_number,
            });
        }
        if let Some(time) = step.delay_time.as_deref() {
            if !crate::utils::validate_hhmm(time) {
                return Err(StepSwapError::InvalidTime {
                    step: step.step_number,
                    value: time.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Replace a sequence's steps without ever exposing a half-rewritten set
/// to the dispatch query: new rows land disabled, then one transaction
/// flips the old set off and the new set on. Old rows stay behind for the
/// delivery logs that reference them.
pub async fn replace_sequence_steps(
    pool: &PgPool,
    sequence_id: Uuid,
    steps: &[crate::models::sequence::StepInput],
) -> Result<(), StepSwapError> {
    validate_steps(steps)?;

    let mut new_ids = Vec::with_capacity(steps.len());
    for step in steps {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO sequence_steps
                (id, sequence_id, step_number, delay_days, delay_time, delay_minutes,
                 subject, content, template_id, is_enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
            "#,
        )
        .bind(id)
        .bind(sequence_id)
        .bind(step.step_number)
        .bind(step.delay_days)
        .bind(&step.delay_time)
        .bind(step.delay_minutes)
        .bind(&step.subject)
        .bind(&step.content)
        .bind(&step.template_id)
        .execute(pool)
        .await?;
        new_ids.push(id);
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE sequence_steps SET is_enabled = FALSE WHERE sequence_id = $1 AND is_enabled AND NOT (id = ANY($2))",
    )
    .bind(sequence_id)
    .bind(&new_ids)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE sequence_steps SET is_enabled = TRUE WHERE id = ANY($1)")
        .bind(&new_ids)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sequence::StepInput;

    fn step(number: i32) -> StepInput {
        StepInput {
            step_number: number,
            delay_days: 0,
            delay_time: None,
            delay_minutes: None,
            subject: "s".to_string(),
            content: "c".to_string(),
            template_id: None,
        }
    }

    #[test]
    fn contiguous_steps_validate() {
        assert!(validate_steps(&[step(1), step(2), step(3)]).is_ok());
        assert!(validate_steps(&[]).is_ok());
    }

    #[test]
    fn gaps_and_offsets_are_rejected() {
        assert!(matches!(
            validate_steps(&[step(1), step(3)]),
            Err(StepSwapError::InvalidNumbering)
        ));
        assert!(matches!(
            validate_steps(&[step(2)]),
            Err(StepSwapError::InvalidNumbering)
        ));
        assert!(matches!(
            validate_steps(&[step(1), step(1)]),
            Err(StepSwapError::InvalidNumbering)
        ));
    }

    #[test]
    fn malformed_delay_time_rejects_the_whole_set() {
        let mut bad = step(2);
        bad.delay_time = Some("9am".to_string());
        assert!(matches!(
            validate_steps(&[step(1), bad]),
            Err(StepSwapError::InvalidTime { step: 2, .. })
        ));
    }

    #[test]
    fn negative_delay_minutes_are_rejected() {
        let mut bad = step(1);
        bad.delay_minutes = Some(-5);
        assert!(matches!(
            validate_steps(&[bad]),
            Err(StepSwapError::InvalidDelay { step: 1 })
        ));
    }

    fn offset_plus_9() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn candidate(
        step_number: i32,
        delay_days: i32,
        delay_time: Option<&str>,
        delay_minutes: Option<i32>,
        started_at: i64,
    ) -> DueCandidate {
        DueCandidate {
            enrollment_id: Uuid::new_v4(),
            subscriber_id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            current_step: step_number - 1,
            started_at,
            email: "user@example.com".to_string(),
            subscriber_name: None,
            unsubscribe_token: "tok".to_string(),
            default_send_time: "10:00".to_string(),
            sequence_reply_to: None,
            step_id: Uuid::new_v4(),
            step_number,
            delay_days,
            delay_time: delay_time.map(str::to_string),
            delay_minutes,
            subject: "Subject".to_string(),
            content: "Body".to_string(),
            template_id: None,
        }
    }

    // 2024-01-01 06:00 UTC == 15:00 regional (+09:00)
    const JAN_1_0600_UTC: i64 = 1_704_088_800;
    // 2024-01-02 00:00 UTC == 09:00 regional
    const JAN_2_0000_UTC: i64 = 1_704_153_600;
    // 2024-01-02 01:30 UTC == 10:30 regional
    const JAN_2_0130_UTC: i64 = 1_704_159_000;
    // 2024-01-02 01:00 UTC == 10:00 regional
    const JAN_2_0100_UTC: i64 = 1_704_157_200;

    #[test]
    fn day_anchored_step_uses_regional_day_boundary() {
        let c = candidate(1, 1, None, None, JAN_1_0600_UTC);
        let due = step_due_at(&c, offset_plus_9(), None).unwrap();
        // Due at 10:00 regional on Jan 2 == 01:00 UTC.
        assert_eq!(due, JAN_2_0100_UTC);
        assert!(due > JAN_2_0000_UTC);
        assert!(due < JAN_2_0130_UTC);
    }

    #[test]
    fn step_delay_time_overrides_sequence_default() {
        let c = candidate(1, 1, Some("18:30"), None, JAN_1_0600_UTC);
        let due = step_due_at(&c, offset_plus_9(), None).unwrap();
        assert_eq!(due, JAN_2_0100_UTC + (8 * 3600 + 1800));
    }

    #[test]
    fn same_day_step_at_midnight_send_time_is_immediately_due() {
        // Enrollment exactly at regional midnight, delay_days = 0,
        // send time 00:00: due at enrollment time itself.
        let regional_midnight_utc = JAN_2_0000_UTC - 9 * 3600 + 24 * 3600; // Jan 2 00:00 regional
        let mut c = candidate(1, 0, Some("00:00"), None, regional_midnight_utc);
        c.default_send_time = "00:00".to_string();
        let due = step_due_at(&c, offset_plus_9(), None).unwrap();
        assert_eq!(due, regional_midnight_utc);
    }

    #[test]
    fn same_day_step_is_due_once_time_has_passed() {
        // Enrolled at 15:00 regional with a 10:00 send time: the slot has
        // passed, so the step is due immediately (due_at is in the past).
        let c = candidate(1, 0, None, None, JAN_1_0600_UTC);
        let due = step_due_at(&c, offset_plus_9(), None).unwrap();
        assert!(due < JAN_1_0600_UTC);
    }

    #[test]
    fn minutes_mode_step_one_offsets_from_enrollment() {
        let c = candidate(1, 0, None, Some(0), 1_000_000);
        assert_eq!(step_due_at(&c, offset_plus_9(), None), Some(1_000_000));

        let c = candidate(1, 0, None, Some(30), 1_000_000);
        assert_eq!(step_due_at(&c, offset_plus_9(), None), Some(1_000_000 + 1800));
    }

    #[test]
    fn minutes_mode_later_steps_offset_from_previous_send() {
        let c = candidate(2, 0, None, Some(60), 1_000_000);
        assert_eq!(
            step_due_at(&c, offset_plus_9(), Some(1_000_001)),
            Some(1_000_001 + 3600)
        );
    }

    #[test]
    fn minutes_mode_without_previous_send_is_unschedulable() {
        let c = candidate(2, 0, None, Some(60), 1_000_000);
        assert_eq!(step_due_at(&c, offset_plus_9(), None), None);
    }

    #[test]
    fn minutes_mode_ignores_day_fields() {
        let c = candidate(1, 5, Some("23:00"), Some(0), 1_000_000);
        assert_eq!(step_due_at(&c, offset_plus_9(), None), Some(1_000_000));
    }

    #[test]
    fn malformed_send_time_is_unschedulable() {
        let mut c = candidate(1, 1, None, None, JAN_1_0600_UTC);
        c.default_send_time = "25:99".to_string();
        assert_eq!(step_due_at(&c, offset_plus_9(), None), None);
    }
}
