use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::campaign::AbVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Failed,
}

impl DeliveryStatus {
    /// Position on the success chain; failure states sit outside it.
    pub fn chain_rank(&self) -> i32 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Opened => 2,
            DeliveryStatus::Clicked => 3,
            DeliveryStatus::Bounced | DeliveryStatus::Failed => -1,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.chain_rank() < 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    pub sequence_step_id: Option<Uuid>,
    pub subscriber_id: Uuid,
    pub email: String,
    pub email_subject: Option<String>,
    pub ab_variant: Option<AbVariant>,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub opened_at: Option<i64>,
    pub clicked_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClickEvent {
    pub id: Uuid,
    pub delivery_log_id: Uuid,
    pub subscriber_id: Uuid,
    pub clicked_url: String,
    pub clicked_at: i64,
}
