use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    /// "HH:MM" in the deployment's regional offset.
    pub default_send_time: String,
    pub reply_to: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SequenceStep {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub step_number: i32,
    pub delay_days: i32,
    pub delay_time: Option<String>,
    /// When set (including 0), the step runs minutes after the previous
    /// step's send instead of day-anchored.
    pub delay_minutes: Option<i32>,
    pub subject: String,
    pub content: String,
    pub template_id: Option<String>,
    pub is_enabled: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SequenceEnrollment {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub sequence_id: Uuid,
    pub current_step: i32,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSequenceRequest {
    pub name: String,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub default_send_time: Option<String>,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSequenceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub default_send_time: Option<String>,
    pub reply_to: Option<String>,
    /// When present, replaces the whole step set atomically.
    pub steps: Option<Vec<StepInput>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepInput {
    pub step_number: i32,
    #[serde(default)]
    pub delay_days: i32,
    pub delay_time: Option<String>,
    pub delay_minutes: Option<i32>,
    pub subject: String,
    pub content: String,
    pub template_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollRequest {
    pub subscriber_id: Uuid,
}
