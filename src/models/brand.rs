use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Singleton row (id = 1) with the deployment's branding.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BrandSettings {
    pub id: i32,
    pub primary_color: String,
    pub secondary_color: String,
    pub logo_url: Option<String>,
    pub footer_text: String,
    pub email_signature: Option<String>,
    pub default_template_id: String,
}

impl Default for BrandSettings {
    fn default() -> Self {
        BrandSettings {
            id: 1,
            primary_color: "#1a73e8".to_string(),
            secondary_color: "#f5f5f5".to_string(),
            logo_url: None,
            footer_text: String::new(),
            email_signature: None,
            default_template_id: "simple".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBrandSettingsRequest {
    pub primary_color: Option<String>,
    pub secondary_color: Option<String>,
    pub logo_url: Option<String>,
    pub footer_text: Option<String>,
    pub email_signature: Option<String>,
    pub default_template_id: Option<String>,
}
