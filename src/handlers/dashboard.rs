use axum::{extract::State, Json};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::handlers::{internal_error, HandlerError};
use crate::middleware::auth::{AdminAuth, AppState};
use crate::services::delivery_log::{campaign_stats, global_stats};

/// Headline numbers for the admin dashboard.
pub async fn get_dashboard(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Value>, HandlerError> {
    let subscriber_counts: (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE status = 'active'),
            COUNT(*) FILTER (WHERE status = 'pending'),
            COUNT(*) FILTER (WHERE status = 'unsubscribed')
        FROM subscribers
        "#,
    )
    .fetch_one(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let campaign_counts: (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE status = 'draft'),
            COUNT(*) FILTER (WHERE status = 'scheduled'),
            COUNT(*) FILTER (WHERE status = 'sent')
        FROM campaigns
        "#,
    )
    .fetch_one(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let active_enrollments = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sequence_enrollments WHERE completed_at IS NULL",
    )
    .fetch_one(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let delivery = global_stats(&state.db_pool).await.map_err(internal_error)?;

    let recent: Vec<(Uuid, String, String, Option<i64>, Option<i32>)> = sqlx::query_as(
        r#"
        SELECT id, subject, status::TEXT, sent_at, recipient_count
        FROM campaigns
        WHERE status = 'sent'
        ORDER BY sent_at DESC NULLS LAST
        LIMIT 5
        "#,
    )
    .fetch_all(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let recent_campaigns: Vec<Value> = recent
        .into_iter()
        .map(|(id, subject, status, sent_at, recipient_count)| {
            json!({
                "id": id,
                "subject": subject,
                "status": status,
                "sent_at": sent_at,
                "recipient_count": recipient_count,
            })
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "data": {
            "subscribers": {
                "total": subscriber_counts.0,
                "active": subscriber_counts.1,
                "pending": subscriber_counts.2,
                "unsubscribed": subscriber_counts.3,
            },
            "campaigns": {
                "total": campaign_counts.0,
                "draft": campaign_counts.1,
                "scheduled": campaign_counts.2,
                "sent": campaign_counts.3,
            },
            "active_enrollments": active_enrollments,
            "delivery": delivery,
            "recent_campaigns": recent_campaigns,
        }
    })))
}

/// Per-campaign engagement across every sent campaign.
pub async fn analytics_overview(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Value>, HandlerError> {
    let delivery = global_stats(&state.db_pool).await.map_err(internal_error)?;

    let sent_campaigns: Vec<(Uuid, String, Option<i64>)> = sqlx::query_as(
        "SELECT id, subject, sent_at FROM campaigns WHERE status = 'sent' ORDER BY sent_at DESC NULLS LAST",
    )
    .fetch_all(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let mut campaigns = Vec::with_capacity(sent_campaigns.len());
    for (id, subject, sent_at) in sent_campaigns {
        let stats = campaign_stats(&state.db_pool, id)
            .await
            .map_err(internal_error)?;
        campaigns.push(json!({
            "id": id,
            "subject": subject,
            "sent_at": sent_at,
            "stats": stats,
        }));
    }

    Ok(Json(json!({
        "success": true,
        "data": {
            "totals": delivery,
            "campaigns": campaigns,
        }
    })))
}
