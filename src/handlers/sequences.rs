use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::database::unix_now;
use crate::handlers::{bad_request, internal_error, not_found, HandlerError};
use crate::middleware::auth::{AdminAuth, AppState};
use crate::models::sequence::{
    CreateSequenceRequest, EnrollRequest, Sequence, SequenceStep, UpdateSequenceRequest,
};
use crate::services::sequences::{
    enroll_subscriber, replace_sequence_steps, validate_steps, EnrollError, StepSwapError,
};
use crate::utils::validate_hhmm;

pub async fn list_sequences(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Value>, HandlerError> {
    let rows: Vec<(Uuid, String, Option<String>, bool, String, Option<String>, i64, i64, i64)> =
        sqlx::query_as(
            r#"
            SELECT q.id, q.name, q.description, q.is_active, q.default_send_time, q.reply_to, q.created_at,
                   (SELECT COUNT(*) FROM sequence_steps st WHERE st.sequence_id = q.id AND st.is_enabled),
                   (SELECT COUNT(*) FROM sequence_enrollments e WHERE e.sequence_id = q.id)
            FROM sequences q
            ORDER BY q.created_at DESC
            "#,
        )
        .fetch_all(&state.db_pool)
        .await
        .map_err(internal_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .map(
            |(id, name, description, is_active, default_send_time, reply_to, created_at, steps, enrollments)| {
                json!({
                    "id": id,
                    "name": name,
                    "description": description,
                    "is_active": is_active,
                    "default_send_time": default_send_time,
                    "reply_to": reply_to,
                    "created_at": created_at,
                    "step_count": steps,
                    "enrollment_count": enrollments,
                })
            },
        )
        .collect();

    Ok(Json(json!({"success": true, "data": data})))
}

pub async fn create_sequence(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<CreateSequenceRequest>,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    if request.name.trim().is_empty() {
        return Err(bad_request("name is required"));
    }
    let default_send_time = request.default_send_time.unwrap_or_else(|| "10:00".to_string());
    if !validate_hhmm(&default_send_time) {
        return Err(bad_request("default_send_time must be HH:MM"));
    }
    // Reject the whole request before any writes.
    validate_steps(&request.steps).map_err(map_swap_error)?;

    let sequence = sqlx::query_as::<_, Sequence>(
        r#"
        INSERT INTO sequences (id, name, description, is_active, default_send_time, reply_to)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(request.name.trim())
    .bind(&request.description)
    .bind(request.is_active.unwrap_or(true))
    .bind(&default_send_time)
    .bind(&request.reply_to)
    .fetch_one(&state.db_pool)
    .await
    .map_err(internal_error)?;

    if !request.steps.is_empty() {
        replace_sequence_steps(&state.db_pool, sequence.id, &request.steps)
            .await
            .map_err(map_swap_error)?;
    }

    let steps = fetch_steps(&state, sequence.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "data": {"sequence": sequence, "steps": steps}})),
    ))
}

pub async fn get_sequence(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    let sequence = fetch_sequence(&state, id).await?;
    let steps = fetch_steps(&state, id).await?;
    Ok(Json(
        json!({"success": true, "data": {"sequence": sequence, "steps": steps}}),
    ))
}

pub async fn update_sequence(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateSequenceRequest>,
) -> Result<Json<Value>, HandlerError> {
    fetch_sequence(&state, id).await?;

    if let Some(time) = request.default_send_time.as_deref() {
        if !validate_hhmm(time) {
            return Err(bad_request("default_send_time must be HH:MM"));
        }
    }
    if let Some(steps) = &request.steps {
        validate_steps(steps).map_err(map_swap_error)?;
    }

    let sequence = sqlx::query_as::<_, Sequence>(
        r#"
        UPDATE sequences SET
            name = COALESCE($2, name),
            description = COALESCE($3, description),
            is_active = COALESCE($4, is_active),
            default_send_time = COALESCE($5, default_send_time),
            reply_to = COALESCE($6, reply_to)
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&request.name)
    .bind(&request.description)
    .bind(request.is_active)
    .bind(&request.default_send_time)
    .bind(&request.reply_to)
    .fetch_one(&state.db_pool)
    .await
    .map_err(internal_error)?;

    if let Some(steps) = &request.steps {
        replace_sequence_steps(&state.db_pool, id, steps)
            .await
            .map_err(map_swap_error)?;
    }

    let steps = fetch_steps(&state, id).await?;
    Ok(Json(
        json!({"success": true, "data": {"sequence": sequence, "steps": steps}}),
    ))
}

pub async fn delete_sequence(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    fetch_sequence(&state, id).await?;

    // Steps and enrollments cascade; delivery logs keep their history.
    sqlx::query("DELETE FROM sequences WHERE id = $1")
        .bind(id)
        .execute(&state.db_pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({"success": true, "data": {"deleted": id}})))
}

pub async fn enroll(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
    Json(request): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    match enroll_subscriber(&state.db_pool, id, request.subscriber_id, unix_now()).await {
        Ok(enrollment) => Ok((
            StatusCode::CREATED,
            Json(json!({"success": true, "data": enrollment})),
        )),
        Err(EnrollError::SubscriberNotFound) => Err(not_found("subscriber not found")),
        Err(EnrollError::SequenceNotFound) => Err(not_found("sequence not found")),
        Err(e @ EnrollError::SubscriberInactive)
        | Err(e @ EnrollError::SequenceInactive)
        | Err(e @ EnrollError::AlreadyEnrolled) => Err(bad_request(&e.to_string())),
        Err(EnrollError::Db(e)) => Err(internal_error(e)),
    }
}

/// Enrollments of one sequence, with subscriber identity.
pub async fn sequence_subscribers(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    fetch_sequence(&state, id).await?;

    let rows: Vec<(Uuid, Uuid, String, Option<String>, i32, i64, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT e.id, s.id, s.email, s.name, e.current_step, e.started_at, e.completed_at
        FROM sequence_enrollments e
        JOIN subscribers s ON s.id = e.subscriber_id
        WHERE e.sequence_id = $1
        ORDER BY e.started_at DESC
        "#,
    )
    .bind(id)
    .fetch_all(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .map(
            |(enrollment_id, subscriber_id, email, name, current_step, started_at, completed_at)| {
                json!({
                    "enrollment_id": enrollment_id,
                    "subscriber_id": subscriber_id,
                    "email": email,
                    "name": name,
                    "current_step": current_step,
                    "started_at": started_at,
                    "completed_at": completed_at,
                })
            },
        )
        .collect();

    Ok(Json(json!({"success": true, "data": data})))
}

/// Sequences one subscriber is enrolled in.
pub async fn subscriber_sequences(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subscribers WHERE id = $1")
        .bind(id)
        .fetch_one(&state.db_pool)
        .await
        .map_err(internal_error)?;
    if exists == 0 {
        return Err(not_found("subscriber not found"));
    }

    let rows: Vec<(Uuid, Uuid, String, bool, i32, i64, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT e.id, q.id, q.name, q.is_active, e.current_step, e.started_at, e.completed_at
        FROM sequence_enrollments e
        JOIN sequences q ON q.id = e.sequence_id
        WHERE e.subscriber_id = $1
        ORDER BY e.started_at DESC
        "#,
    )
    .bind(id)
    .fetch_all(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .map(
            |(enrollment_id, sequence_id, name, is_active, current_step, started_at, completed_at)| {
                json!({
                    "enrollment_id": enrollment_id,
                    "sequence_id": sequence_id,
                    "sequence_name": name,
                    "is_active": is_active,
                    "current_step": current_step,
                    "started_at": started_at,
                    "completed_at": completed_at,
                })
            },
        )
        .collect();

    Ok(Json(json!({"success": true, "data": data})))
}

fn map_swap_error(e: StepSwapError) -> HandlerError {
    match e {
        StepSwapError::Db(e) => internal_error(e),
        other => bad_request(&other.to_string()),
    }
}

async fn fetch_sequence(state: &AppState, id: Uuid) -> Result<Sequence, HandlerError> {
    sqlx::query_as::<_, Sequence>("SELECT * FROM sequences WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("sequence not found"))
}

async fn fetch_steps(state: &AppState, sequence_id: Uuid) -> Result<Vec<SequenceStep>, HandlerError> {
    sqlx::query_as::<_, SequenceStep>(
        "SELECT * FROM sequence_steps WHERE sequence_id = $1 AND is_enabled ORDER BY step_number",
    )
    .bind(sequence_id)
    .fetch_all(&state.db_pool)
    .await
    .map_err(internal_error)
}
