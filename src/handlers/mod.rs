pub mod brand_settings;
pub mod campaigns;
pub mod contact_lists;
pub mod dashboard;
pub mod public;
pub mod sequences;
pub mod subscribers;
pub mod templates;
pub mod webhooks;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

pub type HandlerError = (StatusCode, Json<Value>);

pub fn bad_request(message: &str) -> HandlerError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "error": message})),
    )
}

pub fn not_found(message: &str) -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "error": message})),
    )
}

pub fn internal_error(e: impl std::fmt::Display) -> HandlerError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": format!("{}", e)})),
    )
}
