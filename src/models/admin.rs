use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Admin account row, written by the admin UI and only read here.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AdminUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub created_at: i64,
}

impl AdminUser {
    /// Only owners and admins may use the management API.
    pub fn can_manage(&self) -> bool {
        self.role == "owner" || self.role == "admin"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AdminSession {
    pub id: Uuid,
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: i64,
    pub created_at: i64,
}
