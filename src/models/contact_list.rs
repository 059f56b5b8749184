use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContactList {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub provider_segment_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateContactListRequest {
    pub name: String,
    pub description: Option<String>,
    pub provider_segment_id: Option<String>,
    /// When true and no segment id is given, a provider segment is created
    /// for the list so broadcast sends can address it.
    #[serde(default)]
    pub create_provider_segment: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateContactListRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub provider_segment_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddListMemberRequest {
    pub subscriber_id: Uuid,
}
