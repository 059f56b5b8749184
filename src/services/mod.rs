pub mod ab_test;
pub mod campaigns;
pub mod delivery_log;
pub mod provider;
pub mod renderer;
pub mod scheduler;
pub mod sender;
pub mod sequences;
pub mod unsubscribe;

use sqlx::PgPool;

use crate::models::brand::BrandSettings;

/// The singleton brand row, falling back to defaults when unreadable.
pub async fn load_brand_settings(pool: &PgPool) -> BrandSettings {
    sqlx::query_as::<_, BrandSettings>("SELECT * FROM brand_settings WHERE id = 1")
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
        .unwrap_or_default()
}
