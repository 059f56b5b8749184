use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ShortUrl {
    pub id: Uuid,
    pub short_code: String,
    pub original_url: String,
    pub position: i32,
    pub campaign_id: Option<Uuid>,
    pub sequence_step_id: Option<Uuid>,
    pub created_at: i64,
}
