use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::database::unix_now;
use crate::handlers::{bad_request, internal_error, not_found, HandlerError};
use crate::middleware::auth::{AdminAuth, AppState};
use crate::models::subscriber::{Subscriber, SubscriberFilter, UpdateSubscriberRequest};
use crate::utils::csv::{parse_subscriber_csv, write_subscriber_csv, ExportRow, RowError};
use crate::utils::generate_token;

pub async fn list_subscribers(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Query(filter): Query<SubscriberFilter>,
) -> Result<Json<Value>, HandlerError> {
    let subscribers = query_subscribers(&state, &filter).await?;
    Ok(Json(json!({"success": true, "data": subscribers})))
}

pub async fn get_subscriber(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, HandlerError> {
    let subscriber = sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("subscriber not found"))?;

    Ok(Json(json!({"success": true, "data": subscriber})))
}

pub async fn update_subscriber(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateSubscriberRequest>,
) -> Result<Json<Value>, HandlerError> {
    let subscriber = sqlx::query_as::<_, Subscriber>(
        r#"
        UPDATE subscribers SET
            name = COALESCE($2, name),
            status = COALESCE($3, status),
            unsubscribed_at = CASE WHEN $3 = 'unsubscribed'::subscriber_status THEN $4 ELSE unsubscribed_at END
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&request.name)
    .bind(request.status)
    .bind(unix_now())
    .fetch_optional(&state.db_pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| not_found("subscriber not found"))?;

    Ok(Json(json!({"success": true, "data": subscriber})))
}

/// Multipart CSV import. Malformed rows become per-row errors; rows whose
/// email already exists are skipped.
pub async fn import_subscribers(
    State(state): State<AppState>,
    _admin: AdminAuth,
    mut multipart: Multipart,
) -> Result<Json<Value>, HandlerError> {
    let mut data = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(&format!("unreadable multipart body: {}", e)))?
    {
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(&format!("unreadable upload: {}", e)))?;
        data = Some(bytes);
        break;
    }
    let data = data.ok_or_else(|| bad_request("no file uploaded"))?;

    let parsed = parse_subscriber_csv(&data).map_err(|e| bad_request(&e))?;
    let mut errors: Vec<RowError> = parsed.errors;
    let mut imported = 0usize;
    let mut skipped = 0usize;
    let now = unix_now();

    for row in parsed.rows {
        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM subscribers WHERE LOWER(email) = $1",
        )
        .bind(&row.email)
        .fetch_one(&state.db_pool)
        .await
        .map_err(internal_error)?;
        if existing > 0 {
            skipped += 1;
            continue;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO subscribers (id, email, name, status, unsubscribe_token, subscribed_at)
            VALUES ($1, $2, $3, 'active', $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.email)
        .bind(&row.name)
        .bind(generate_token())
        .bind(now)
        .execute(&state.db_pool)
        .await;

        match result {
            Ok(_) => imported += 1,
            Err(e) => errors.push(RowError {
                row: row.row,
                error: format!("insert failed: {}", e),
            }),
        }
    }

    Ok(Json(json!({
        "success": true,
        "data": {"imported": imported, "skipped": skipped, "errors": errors}
    })))
}

/// CSV export, filterable by status and contact list.
pub async fn export_subscribers(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Query(filter): Query<SubscriberFilter>,
) -> Result<impl IntoResponse, HandlerError> {
    let subscribers = query_subscribers(&state, &filter).await?;
    let rows: Vec<ExportRow> = subscribers
        .into_iter()
        .map(|s| ExportRow {
            email: s.email,
            name: s.name,
            status: s.status.as_str().to_string(),
            created_at: s.created_at,
        })
        .collect();

    let body = write_subscriber_csv(&rows).map_err(internal_error)?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"subscribers.csv\"",
            ),
        ],
        body,
    ))
}

async fn query_subscribers(
    state: &AppState,
    filter: &SubscriberFilter,
) -> Result<Vec<Subscriber>, HandlerError> {
    let subscribers = match filter.contact_list_id {
        Some(list_id) => {
            sqlx::query_as::<_, Subscriber>(
                r#"
                SELECT s.* FROM subscribers s
                JOIN list_memberships m ON m.subscriber_id = s.id
                WHERE m.list_id = $1 AND ($2::subscriber_status IS NULL OR s.status = $2)
                ORDER BY s.created_at DESC
                "#,
            )
            .bind(list_id)
            .bind(filter.status)
            .fetch_all(&state.db_pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Subscriber>(
                r#"
                SELECT * FROM subscribers
                WHERE ($1::subscriber_status IS NULL OR status = $1)
                ORDER BY created_at DESC
                "#,
            )
            .bind(filter.status)
            .fetch_all(&state.db_pool)
            .await
        }
    };
    subscribers.map_err(internal_error)
}
