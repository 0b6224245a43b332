use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub email: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub contact_id: String,
    pub business_number: String,
    pub status: String,
    pub last_message: String,
    pub last_message_time: String,
    pub last_incoming_at: String,
    pub unread_count: i64,
    pub assigned_agent_id: Option<String>,
    pub assigned_at: String,
    pub created_at: String,
}

/// Conversation row joined with its contact, as the dashboard list and
/// detail endpoints return it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub contact_id: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub business_number: String,
    pub status: String,
    pub last_message: String,
    pub last_message_time: String,
    pub last_incoming_at: String,
    pub unread_count: i64,
    pub assigned_agent_id: Option<String>,
    pub assigned_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub direction: String,
    pub content_type: String,
    pub body: String,
    #[serde(default)]
    pub media_url: String,
    #[serde(default)]
    pub file_name: String,
    pub status: String,
    #[serde(default)]
    pub is_note: bool,
    #[serde(default)]
    pub external_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageTemplate {
    pub id: String,
    pub name: String,
    pub language: String,
    pub category: String,
    pub body: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub contact_id: String,
    pub conversation_id: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub razorpay_link_id: String,
    pub razorpay_payment_id: String,
    pub short_url: String,
    pub message_status: String,
    pub status: String,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
}

pub struct AppState {
    pub db: PgPool,
    pub http_client: reqwest::Client,
    pub whatsapp_api_url: String,
    pub whatsapp_api_token: String,
    pub razorpay_key_id: String,
    pub razorpay_key_secret: String,
    pub razorpay_webhook_secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupBody {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContactBody {
    #[serde(default)]
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub custom_fields: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchContactBody {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub tags: Option<Vec<String>>,
    pub custom_fields: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenConversationBody {
    pub contact_id: String,
    #[serde(default)]
    pub business_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub text: String,
    pub content_type: Option<String>,
    pub media_url: Option<String>,
    pub file_name: Option<String>,
    #[serde(default)]
    pub internal_note: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTemplateBody {
    pub template_name: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateBody {
    pub name: String,
    pub body: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchConversationStatusBody {
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchConversationAssigneeBody {
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentBody {
    pub contact_id: Option<String>,
    pub conversation_id: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub send_link: bool,
}
