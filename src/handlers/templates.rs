use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::handlers::{bad_request, internal_error, HandlerError};
use crate::middleware::auth::{AdminAuth, AppState};
use crate::services::load_brand_settings;
use crate::services::provider::OutgoingEmail;
use crate::services::renderer::{preset_ids, render_email, resolve_template_id, PersonalizeInput};
use crate::utils::validate_email;

pub async fn list_templates(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Value>, HandlerError> {
    let brand = load_brand_settings(&state.db_pool).await;
    let data: Vec<Value> = preset_ids()
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "is_default": **id == brand.default_template_id,
            })
        })
        .collect();
    Ok(Json(json!({"success": true, "data": data})))
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub content: String,
    pub subject: Option<String>,
    pub template_id: Option<String>,
}

/// Render content exactly as a subscriber would see it, with sample
/// personalisation and no short-link allocation.
pub async fn preview_template(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<Value>, HandlerError> {
    let brand = load_brand_settings(&state.db_pool).await;
    let template_id = resolve_template_id(request.template_id.as_deref(), &brand);
    let subject = request.subject.as_deref().unwrap_or("Preview");
    let unsubscribe_url = state.config.unsubscribe_url("preview-token");

    let html = render_email(
        &state.db_pool,
        &request.content,
        &PersonalizeInput {
            template_id: &template_id,
            subject,
            brand: &brand,
            subscriber_name: Some("Preview Reader"),
            unsubscribe_url: &unsubscribe_url,
            site_url: &state.config.site_url,
        },
        None,
        &state.config.short_link_base(),
    )
    .await
    .map_err(internal_error)?;

    Ok(Json(json!({"success": true, "data": {"html": html}})))
}

#[derive(Debug, Deserialize)]
pub struct TestSendRequest {
    pub to: String,
    pub content: String,
    pub subject: Option<String>,
    pub template_id: Option<String>,
}

/// Send a rendered preview to one address through the provider.
pub async fn test_send(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<TestSendRequest>,
) -> Result<Json<Value>, HandlerError> {
    if !validate_email(&request.to) {
        return Err(bad_request("invalid recipient address"));
    }

    let brand = load_brand_settings(&state.db_pool).await;
    let template_id = resolve_template_id(request.template_id.as_deref(), &brand);
    let subject = request
        .subject
        .clone()
        .unwrap_or_else(|| "Test send".to_string());
    let unsubscribe_url = state.config.unsubscribe_url("test-send-token");

    let html = render_email(
        &state.db_pool,
        &request.content,
        &PersonalizeInput {
            template_id: &template_id,
            subject: &subject,
            brand: &brand,
            subscriber_name: None,
            unsubscribe_url: &unsubscribe_url,
            site_url: &state.config.site_url,
        },
        None,
        &state.config.short_link_base(),
    )
    .await
    .map_err(internal_error)?;

    let email = OutgoingEmail {
        from: state.config.from_header(),
        to: vec![request.to.clone()],
        subject: format!("[Test] {}", subject),
        html,
        reply_to: state.config.reply_to_address.clone(),
    };

    let message_id = state
        .provider
        .send_email(&email)
        .await
        .map_err(|e| bad_request(&format!("provider rejected test send: {}", e)))?;

    Ok(Json(
        json!({"success": true, "data": {"provider_message_id": message_id}}),
    ))
}
