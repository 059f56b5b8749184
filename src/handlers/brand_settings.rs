use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::handlers::{internal_error, HandlerError};
use crate::middleware::auth::{AdminAuth, AppState};
use crate::models::brand::{BrandSettings, UpdateBrandSettingsRequest};
use crate::services::load_brand_settings;

pub async fn get_brand_settings(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Value>, HandlerError> {
    let settings = load_brand_settings(&state.db_pool).await;
    Ok(Json(json!({"success": true, "data": settings})))
}

pub async fn update_brand_settings(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<UpdateBrandSettingsRequest>,
) -> Result<Json<Value>, HandlerError> {
    let settings = sqlx::query_as::<_, BrandSettings>(
        r#"
        UPDATE brand_settings SET
            primary_color = COALESCE($1, primary_color),
            secondary_color = COALESCE($2, secondary_color),
            logo_url = COALESCE($3, logo_url),
            footer_text = COALESCE($4, footer_text),
            email_signature = COALESCE($5, email_signature),
            default_template_id = COALESCE($6, default_template_id)
        WHERE id = 1
        RETURNING *
        "#,
    )
    .bind(&request.primary_color)
    .bind(&request.secondary_color)
    .bind(&request.logo_url)
    .bind(&request.footer_text)
    .bind(&request.email_signature)
    .bind(&request.default_template_id)
    .fetch_one(&state.db_pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(json!({"success": true, "data": settings})))
}
