use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "campaign_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "schedule_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    None,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ab_variant")]
pub enum AbVariant {
    A,
    B,
}

/// Recurrence parameters kept as JSON on the campaign row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub hour: u32,
    pub minute: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub subject: String,
    pub content: String,
    pub status: CampaignStatus,
    pub scheduled_at: Option<i64>,
    pub schedule_type: ScheduleKind,
    pub schedule_config: Option<serde_json::Value>,
    pub last_sent_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub recipient_count: Option<i32>,
    pub contact_list_id: Option<Uuid>,
    pub template_id: Option<String>,
    pub reply_to: Option<String>,
    pub slug: Option<String>,
    pub is_published: bool,
    pub excerpt: Option<String>,
    pub ab_test_enabled: bool,
    pub ab_subject_b: Option<String>,
    pub ab_from_name_b: Option<String>,
    pub ab_wait_hours: i32,
    pub ab_test_sent_at: Option<i64>,
    pub ab_winner: Option<AbVariant>,
    pub created_at: i64,
}

impl Campaign {
    pub fn schedule_config(&self) -> Option<ScheduleConfig> {
        self.schedule_config
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaignRequest {
    pub subject: String,
    pub content: String,
    pub scheduled_at: Option<i64>,
    pub schedule_type: Option<ScheduleKind>,
    pub schedule_config: Option<ScheduleConfig>,
    pub contact_list_id: Option<Uuid>,
    pub template_id: Option<String>,
    pub reply_to: Option<String>,
    pub slug: Option<String>,
    pub is_published: Option<bool>,
    pub excerpt: Option<String>,
    pub ab_test_enabled: Option<bool>,
    pub ab_subject_b: Option<String>,
    pub ab_from_name_b: Option<String>,
    pub ab_wait_hours: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateCampaignRequest {
    pub subject: Option<String>,
    pub content: Option<String>,
    pub status: Option<CampaignStatus>,
    pub scheduled_at: Option<i64>,
    pub schedule_type: Option<ScheduleKind>,
    pub schedule_config: Option<ScheduleConfig>,
    pub contact_list_id: Option<Uuid>,
    pub template_id: Option<String>,
    pub reply_to: Option<String>,
    pub slug: Option<String>,
    pub is_published: Option<bool>,
    pub excerpt: Option<String>,
    pub ab_test_enabled: Option<bool>,
    pub ab_subject_b: Option<String>,
    pub ab_from_name_b: Option<String>,
    pub ab_wait_hours: Option<i32>,
}
