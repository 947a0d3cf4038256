//! Persistent entities and row mapping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;
use uuid::Uuid;
use zapgate_core::{
    CampaignStatus, ContactStatus, ConversationStatus, GatewayError, MessageDirection,
    MessageStatus,
};

/// WhatsApp Business Account credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub business_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub is_active: bool,
}

impl Account {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            business_id: row.get("business_id"),
            access_token: row.get("access_token"),
            is_active: row.get("is_active"),
        }
    }
}

/// A phone identity owned by one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Number {
    pub id: Uuid,
    pub account_id: Uuid,
    pub phone_number: String,
    pub phone_number_id: String,
    pub display_name: Option<String>,
    pub is_active: bool,
}

impl Number {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            account_id: row.get("account_id"),
            phone_number: row.get("phone_number"),
            phone_number_id: row.get("phone_number_id"),
            display_name: row.get("display_name"),
            is_active: row.get("is_active"),
        }
    }
}

/// Approved message template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub account_id: Uuid,
    /// When set, the template may only be sent from this number.
    pub number_id: Option<Uuid>,
    pub name: String,
    pub language: String,
    pub category: Option<String>,
    /// Declared body variable names, in placeholder order.
    pub variables: Vec<String>,
}

impl Template {
    pub fn from_row(row: &Row) -> Result<Self, GatewayError> {
        let variables: serde_json::Value = row.get("variables");
        let variables = serde_json::from_value(variables)
            .map_err(|e| GatewayError::Database(format!("template variables: {}", e)))?;
        Ok(Self {
            id: row.get("id"),
            account_id: row.get("account_id"),
            number_id: row.get("number_id"),
            name: row.get("name"),
            language: row.get("language"),
            category: row.get("category"),
            variables,
        })
    }
}

/// Human agent identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operator {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub is_active: bool,
    pub max_concurrent: i32,
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Operator {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            email: row.get("email"),
            is_active: row.get("is_active"),
            max_concurrent: row.get("max_concurrent"),
            is_online: row.get("is_online"),
            last_seen_at: row.get("last_seen_at"),
        }
    }
}

/// An operator together with its current open-conversation count.
#[derive(Debug, Clone)]
pub struct OperatorLoad {
    pub operator: Operator,
    pub open_count: i64,
}

/// Closing-reason taxonomy entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tabulation {
    pub id: Uuid,
    pub name: String,
    pub requires_notes: bool,
    pub is_active: bool,
}

impl Tabulation {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            requires_notes: row.get("requires_notes"),
            is_active: row.get("is_active"),
        }
    }
}

/// The routing unit between one customer and one operator on one number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub number_id: Uuid,
    pub customer_phone: String,
    pub customer_name: Option<String>,
    pub status: ConversationStatus,
    pub operator_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_agent_message_at: Option<DateTime<Utc>>,
    pub last_customer_message_at: Option<DateTime<Utc>>,
    pub manual_attempts_count: i32,
    pub manual_attempts_window_start: Option<DateTime<Utc>>,
    pub manual_blocked_until: Option<DateTime<Utc>>,
    pub cpc_marked_at: Option<DateTime<Utc>>,
    pub cpc_marked_by: Option<Uuid>,
    pub tabulation_id: Option<Uuid>,
    pub notes: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn from_row(row: &Row) -> Result<Self, GatewayError> {
        let status: String = row.get("status");
        Ok(Self {
            id: row.get("id"),
            number_id: row.get("number_id"),
            customer_phone: row.get("customer_phone"),
            customer_name: row.get("customer_name"),
            status: ConversationStatus::parse(&status)
                .ok_or_else(|| GatewayError::Database(format!("conversation status: {}", status)))?,
            operator_id: row.get("operator_id"),
            last_message_at: row.get("last_message_at"),
            last_agent_message_at: row.get("last_agent_message_at"),
            last_customer_message_at: row.get("last_customer_message_at"),
            manual_attempts_count: row.get("manual_attempts_count"),
            manual_attempts_window_start: row.get("manual_attempts_window_start"),
            manual_blocked_until: row.get("manual_blocked_until"),
            cpc_marked_at: row.get("cpc_marked_at"),
            cpc_marked_by: row.get("cpc_marked_by"),
            tabulation_id: row.get("tabulation_id"),
            notes: row.get("notes"),
            closed_at: row.get("closed_at"),
            created_at: row.get("created_at"),
        })
    }
}

/// One inbound or outbound message unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub number_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub direction: MessageDirection,
    pub message_type: String,
    pub content: serde_json::Value,
    pub status: MessageStatus,
    pub provider_message_id: Option<String>,
    pub wamid: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub message_timestamp: DateTime<Utc>,
}

impl Message {
    pub fn from_row(row: &Row) -> Result<Self, GatewayError> {
        let direction: String = row.get("direction");
        let status: String = row.get("status");
        Ok(Self {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            number_id: row.get("number_id"),
            campaign_id: row.get("campaign_id"),
            direction: MessageDirection::parse(&direction)
                .ok_or_else(|| GatewayError::Database(format!("message direction: {}", direction)))?,
            message_type: row.get("message_type"),
            content: row.get("content"),
            status: MessageStatus::parse(&status)
                .ok_or_else(|| GatewayError::Database(format!("message status: {}", status)))?,
            provider_message_id: row.get("provider_message_id"),
            wamid: row.get("wamid"),
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            message_timestamp: row.get("message_timestamp"),
        })
    }
}

/// Bulk template-send job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub account_id: Uuid,
    pub number_id: Uuid,
    pub template_id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub rate_limit: i32,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub read_count: i32,
    pub failed_count: i32,
    pub csv_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn from_row(row: &Row) -> Result<Self, GatewayError> {
        let status: String = row.get("status");
        Ok(Self {
            id: row.get("id"),
            account_id: row.get("account_id"),
            number_id: row.get("number_id"),
            template_id: row.get("template_id"),
            name: row.get("name"),
            status: CampaignStatus::parse(&status)
                .ok_or_else(|| GatewayError::Database(format!("campaign status: {}", status)))?,
            rate_limit: row.get("rate_limit"),
            total_recipients: row.get("total_recipients"),
            sent_count: row.get("sent_count"),
            delivered_count: row.get("delivered_count"),
            read_count: row.get("read_count"),
            failed_count: row.get("failed_count"),
            csv_path: row.get("csv_path"),
            started_at: row.get("started_at"),
            created_at: row.get("created_at"),
        })
    }
}

/// One row per (campaign, phone)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContact {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub phone_number: String,
    pub status: ContactStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_status_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

impl CampaignContact {
    pub fn from_row(row: &Row) -> Result<Self, GatewayError> {
        let status: String = row.get("status");
        Ok(Self {
            id: row.get("id"),
            campaign_id: row.get("campaign_id"),
            phone_number: row.get("phone_number"),
            status: ContactStatus::parse(&status)
                .ok_or_else(|| GatewayError::Database(format!("contact status: {}", status)))?,
            last_attempt_at: row.get("last_attempt_at"),
            last_sent_at: row.get("last_sent_at"),
            last_status_at: row.get("last_status_at"),
            failed_reason: row.get("failed_reason"),
        })
    }
}

/// Per-campaign contact accounting for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContactCounts {
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub skipped_24h: i64,
}
