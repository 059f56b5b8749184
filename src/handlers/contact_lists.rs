use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::handlers::{bad_request, internal_error, not_found, HandlerError};
use crate::middleware::auth::{AdminAuth, AppState};
use crate::models::contact_list::{
    AddListMemberRequest, ContactList, CreateContactListRequest, UpdateContactListRequest,
};

pub async fn list_contact_lists(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Value>, HandlerError> {
    let rows: Vec<(Uuid, String, Option<String>, Option<String>, i64, i64)> = sqlx::query_as(
        r#"
        SELECT l.id, l.name, l.description, l.provider_segment_id, l.created_at,
               (SELECT COUNT(*) FROM list_memberships m WHERE m.list_id = l.id)
        FROM contact_lists l
        ORDER BY l.name
        "#,
    )
    .fetch_all(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .map(|(id, name, description, provider_segment_id, created_at, members)| {
            json!({
                "id": id,
                "name": name,
                "description": description,
                "provider_segment_id": provider_segment_id,
                "created_at": created_at,
                "member_count": members,
            })
        })
        .collect();

    Ok(Json(json!({"success": true, "data": data})))
}

pub async fn create_contact_list(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<CreateContactListRequest>,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    if request.name.trim().is_empty() {
        return Err(bad_request("name is required"));
    }

    let mut provider_segment_id = request.provider_segment_id.clone();
    if provider_segment_id.is_none() && request.create_provider_segment {
        match state.provider.create_segment(request.name.trim()).await {
            Ok(id) => provider_segment_id = Some(id),
            Err(e) => {
                warn!(list = %request.name, error = %e, "failed to create provider segment");
            }
        }
    }

    let list = sqlx::query_as::<_, ContactList>(
        r#"
        INSERT INTO contact_lists (id, name, description, provider_segment_id)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(request.name.trim())
    .bind(&request.description)
    .bind(&provider_segment_id)
    .fetch_one(&state.db_pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            bad_request("a list with this name already exists")
        }
        _ => internal_error(e),
    })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "data": list})),
    ))
}

pub async fn get_contact_list(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    let list = fetch_list(&state, id).await?;
    Ok(Json(json!({"success": true, "data": list})))
}

pub async fn update_contact_list(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateContactListRequest>,
) -> Result<Json<Value>, HandlerError> {
    fetch_list(&state, id).await?;

    let list = sqlx::query_as::<_, ContactList>(
        r#"
        UPDATE contact_lists SET
            name = COALESCE($2, name),
            description = COALESCE($3, description),
            provider_segment_id = COALESCE($4, provider_segment_id)
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&request.name)
    .bind(&request.description)
    .bind(&request.provider_segment_id)
    .fetch_one(&state.db_pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(json!({"success": true, "data": list})))
}

pub async fn delete_contact_list(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    let list = fetch_list(&state, id).await?;

    // The provider-side segment goes with the list, best-effort.
    if let Some(segment_id) = &list.provider_segment_id {
        if let Err(e) = state.provider.delete_segment(segment_id).await {
            warn!(list = %id, segment = %segment_id, error = %e, "failed to delete provider segment");
        }
    }

    sqlx::query("DELETE FROM contact_lists WHERE id = $1")
        .bind(id)
        .execute(&state.db_pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({"success": true, "data": {"deleted": id}})))
}

pub async fn list_members(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    fetch_list(&state, id).await?;

    let rows: Vec<(Uuid, String, Option<String>, String, i64)> = sqlx::query_as(
        r#"
        SELECT s.id, s.email, s.name, s.status::TEXT, m.added_at
        FROM list_memberships m
        JOIN subscribers s ON s.id = m.subscriber_id
        WHERE m.list_id = $1
        ORDER BY m.added_at DESC
        "#,
    )
    .bind(id)
    .fetch_all(&state.db_pool)
    .await
    .map_err(internal_error)?;

    let data: Vec<Value> = rows
        .into_iter()
        .map(|(subscriber_id, email, name, status, added_at)| {
            json!({
                "subscriber_id": subscriber_id,
                "email": email,
                "name": name,
                "status": status,
                "added_at": added_at,
            })
        })
        .collect();

    Ok(Json(json!({"success": true, "data": data})))
}

pub async fn add_member(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
    Json(request): Json<AddListMemberRequest>,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    fetch_list(&state, id).await?;

    let subscriber_exists =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subscribers WHERE id = $1")
            .bind(request.subscriber_id)
            .fetch_one(&state.db_pool)
            .await
            .map_err(internal_error)?;
    if subscriber_exists == 0 {
        return Err(not_found("subscriber not found"));
    }

    sqlx::query(
        r#"
        INSERT INTO list_memberships (list_id, subscriber_id)
        VALUES ($1, $2)
        ON CONFLICT (list_id, subscriber_id) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(request.subscriber_id)
    .execute(&state.db_pool)
    .await
    .map_err(internal_error)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "data": {"list_id": id, "subscriber_id": request.subscriber_id}})),
    ))
}

pub async fn remove_member(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path((id, subscriber_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, HandlerError> {
    let removed = sqlx::query(
        "DELETE FROM list_memberships WHERE list_id = $1 AND subscriber_id = $2",
    )
    .bind(id)
    .bind(subscriber_id)
    .execute(&state.db_pool)
    .await
    .map_err(internal_error)?
    .rows_affected();

    if removed == 0 {
        return Err(not_found("membership not found"));
    }

    Ok(Json(json!({"success": true, "data": {"removed": subscriber_id}})))
}

async fn fetch_list(state: &AppState, id: Uuid) -> Result<ContactList, HandlerError> {
    sqlx::query_as::<_, ContactList>("SELECT * FROM contact_lists WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("contact list not found"))
}
