use chrono::FixedOffset;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::database::unix_now;
use crate::services::sender::Sender;
use crate::services::{ab_test, campaigns, sequences};

/// Everything one scheduler tick needs. The clock is passed separately so
/// stages stay testable against fixed times.
pub struct TickContext {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub sender: Arc<dyn Sender>,
    pub regional_offset: FixedOffset,
}

/// One serial tick: sequences, then the A/B test phase, then the A/B
/// winner phase, then plain scheduled campaigns. Stage failures are logged
/// and never abort the remaining stages.
pub async fn run_tick(ctx: &TickContext, now: i64) {
    match sequences::process_due_sequences(ctx, now).await {
        Ok(count) => {
            if count > 0 {
                info!(count, "dispatched due sequence steps");
            }
        }
        Err(e) => error!("sequence processing failed: {}", e),
    }

    match ab_test::process_test_phase(ctx, now).await {
        Ok(count) => {
            if count > 0 {
                info!(count, "started A/B test phases");
            }
        }
        Err(e) => error!("A/B test phase failed: {}", e),
    }

    match ab_test::process_winner_phase(ctx, now).await {
        Ok(count) => {
            if count > 0 {
                info!(count, "completed A/B winner phases");
            }
        }
        Err(e) => error!("A/B winner phase failed: {}", e),
    }

    match campaigns::process_scheduled_campaigns(ctx, now).await {
        Ok(count) => {
            if count > 0 {
                info!(count, "sent scheduled campaigns");
            }
        }
        Err(e) => error!("scheduled campaign processing failed: {}", e),
    }
}

/// Periodic driver. Ticks run back to back on one task, so two ticks never
/// overlap within a process.
pub async fn run_scheduler(ctx: TickContext) {
    let mut ticker = interval(Duration::from_secs(ctx.config.scheduler_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        interval_secs = ctx.config.scheduler_interval_secs,
        "scheduler started"
    );

    loop {
        ticker.tick().await;
        let now = unix_now();
        debug!(now, "scheduler tick");
        run_tick(&ctx, now).await;
    }
}
