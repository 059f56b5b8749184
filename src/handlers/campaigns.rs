use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::handlers::{bad_request, internal_error, not_found, HandlerError};
use crate::middleware::auth::{AdminAuth, AppState};
use crate::models::campaign::{
    AbVariant, Campaign, CampaignStatus, CreateCampaignRequest, ScheduleKind, UpdateCampaignRequest,
};
use crate::services::delivery_log::{campaign_stats, variant_counts};

pub async fn list_campaigns(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Value>, HandlerError> {
    let campaigns = sqlx::query_as::<_, Campaign>(
        "SELECT * FROM campaigns ORDER BY created_at DESC",
    )
    .fetch_all(&state.db_pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(json!({"success": true, "data": campaigns})))
}

pub async fn create_campaign(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    if request.subject.trim().is_empty() {
        return Err(bad_request("subject is required"));
    }
    if request.content.trim().is_empty() {
        return Err(bad_request("content is required"));
    }

    let schedule_type = request.schedule_type.unwrap_or(ScheduleKind::None);
    if schedule_type != ScheduleKind::None && request.scheduled_at.is_none() {
        return Err(bad_request("recurring campaigns require scheduled_at"));
    }

    let ab_test_enabled = request.ab_test_enabled.unwrap_or(false);
    let ab_wait_hours = request.ab_wait_hours.unwrap_or(0);
    if ab_test_enabled && ab_wait_hours <= 0 {
        return Err(bad_request("A/B tests require ab_wait_hours > 0"));
    }
    if ab_test_enabled && request.scheduled_at.is_none() {
        return Err(bad_request("A/B tests require scheduled_at"));
    }

    let status = if request.scheduled_at.is_some() {
        CampaignStatus::Scheduled
    } else {
        CampaignStatus::Draft
    };

    let schedule_config = request
        .schedule_config
        .as_ref()
        .map(|c| serde_json::to_value(c).unwrap_or(Value::Null));

    let campaign = sqlx::query_as::<_, Campaign>(
        r#"
        INSERT INTO campaigns
            (id, subject, content, status, scheduled_at, schedule_type, schedule_config,
             contact_list_id, template_id, reply_to, slug, is_published, excerpt,
             ab_test_enabled, ab_subject_b, ab_from_name_b, ab_wait_hours)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(request.subject.trim())
    .bind(&request.content)
    .bind(status)
    .bind(request.scheduled_at)
    .bind(schedule_type)
    .bind(schedule_config)
    .bind(request.contact_list_id)
    .bind(&request.template_id)
    .bind(&request.reply_to)
    .bind(&request.slug)
    .bind(request.is_published.unwrap_or(false))
    .bind(&request.excerpt)
    .bind(ab_test_enabled)
    .bind(&request.ab_subject_b)
    .bind(&request.ab_from_name_b)
    .bind(ab_wait_hours)
    .fetch_one(&state.db_pool)
    .await
    .map_err(internal_error)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "data": campaign})),
    ))
}

pub async fn get_campaign(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    let campaign = fetch_campaign(&state, id).await?;
    Ok(Json(json!({"success": true, "data": campaign})))
}

pub async fn update_campaign(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateCampaignRequest>,
) -> Result<Json<Value>, HandlerError> {
    let existing = fetch_campaign(&state, id).await?;

    // Sent campaigns are immutable apart from their aggregated stats.
    if existing.status == CampaignStatus::Sent {
        return Err(bad_request("sent campaigns cannot be modified"));
    }

    let ab_test_enabled = request.ab_test_enabled.unwrap_or(existing.ab_test_enabled);
    let ab_wait_hours = request.ab_wait_hours.unwrap_or(existing.ab_wait_hours);
    if ab_test_enabled && ab_wait_hours <= 0 {
        return Err(bad_request("A/B tests require ab_wait_hours > 0"));
    }

    let schedule_type = request.schedule_type.unwrap_or(existing.schedule_type);
    let scheduled_at = request.scheduled_at.or(existing.scheduled_at);
    if schedule_type != ScheduleKind::None && scheduled_at.is_none() {
        return Err(bad_request("recurring campaigns require scheduled_at"));
    }

    let schedule_config = request
        .schedule_config
        .as_ref()
        .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
        .or(existing.schedule_config.clone());

    let campaign = sqlx::query_as::<_, Campaign>(
        r#"
        UPDATE campaigns SET
            subject = COALESCE($2, subject),
            content = COALESCE($3, content),
            status = COALESCE($4, status),
            scheduled_at = COALESCE($5, scheduled_at),
            schedule_type = $6,
            schedule_config = $7,
            contact_list_id = COALESCE($8, contact_list_id),
            template_id = COALESCE($9, template_id),
            reply_to = COALESCE($10, reply_to),
            slug = COALESCE($11, slug),
            is_published = COALESCE($12, is_published),
            excerpt = COALESCE($13, excerpt),
            ab_test_enabled = $14,
            ab_subject_b = COALESCE($15, ab_subject_b),
            ab_from_name_b = COALESCE($16, ab_from_name_b),
            ab_wait_hours = $17
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&request.subject)
    .bind(&request.content)
    .bind(request.status)
    .bind(request.scheduled_at)
    .bind(schedule_type)
    .bind(schedule_config)
    .bind(request.contact_list_id)
    .bind(&request.template_id)
    .bind(&request.reply_to)
    .bind(&request.slug)
    .bind(request.is_published)
    .bind(&request.excerpt)
    .bind(ab_test_enabled)
    .bind(&request.ab_subject_b)
    .bind(&request.ab_from_name_b)
    .bind(ab_wait_hours)
    .fetch_one(&state.db_pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(json!({"success": true, "data": campaign})))
}

pub async fn delete_campaign(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    let existing = fetch_campaign(&state, id).await?;
    if existing.status != CampaignStatus::Draft {
        return Err(bad_request("only draft campaigns can be deleted"));
    }

    sqlx::query("DELETE FROM campaigns WHERE id = $1")
        .bind(id)
        .execute(&state.db_pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({"success": true, "data": {"deleted": id}})))
}

/// Delivery outcomes for one campaign, with the per-variant breakdown for
/// A/B tests.
pub async fn campaign_tracking(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    let campaign = fetch_campaign(&state, id).await?;
    let stats = campaign_stats(&state.db_pool, id)
        .await
        .map_err(internal_error)?;

    let mut data = json!({
        "campaign_id": id,
        "subject": campaign.subject,
        "status": campaign.status,
        "stats": stats,
    });

    if campaign.ab_test_enabled {
        let (a_sent, a_opened, a_clicked) = variant_counts(&state.db_pool, id, AbVariant::A)
            .await
            .map_err(internal_error)?;
        let (b_sent, b_opened, b_clicked) = variant_counts(&state.db_pool, id, AbVariant::B)
            .await
            .map_err(internal_error)?;
        data["ab_test"] = json!({
            "winner": campaign.ab_winner,
            "variant_a": {"sent": a_sent, "opened": a_opened, "clicked": a_clicked},
            "variant_b": {"sent": b_sent, "opened": b_opened, "clicked": b_clicked},
        });
    }

    Ok(Json(json!({"success": true, "data": data})))
}

async fn fetch_campaign(state: &AppState, id: Uuid) -> Result<Campaign, HandlerError> {
    sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("campaign not found"))
}
