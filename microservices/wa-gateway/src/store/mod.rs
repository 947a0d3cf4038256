//! Persistence layer
//!
//! `Store` is the seam between the pipeline logic and PostgreSQL. All
//! cross-worker synchronization lives behind it: conditional updates,
//! upserts against unique indexes, and atomic counter increments.

mod pg;

#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zapgate_core::{
    CampaignStatus, ContactStatus, ConversationEventType, ConversationStatus, EventSource,
    MessageDirection, MessageStatus, Result,
};

use crate::model::{
    Account, Campaign, CampaignContact, Conversation, ContactCounts, Message, Number, Operator,
    OperatorLoad, Tabulation, Template,
};

pub use pg::PgStore;

/// Append-only audit record written for every message, tabulation, and
/// CPC action. The campaign compliance gate queries this log by phone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub conversation_id: Option<Uuid>,
    pub number_id: Option<Uuid>,
    pub customer_phone: String,
    pub source: EventSource,
    pub direction: Option<MessageDirection>,
    pub event_type: ConversationEventType,
    pub payload: Option<serde_json::Value>,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    // --- webhook audit log ---

    async fn insert_webhook_event(&self, payload: &serde_json::Value) -> Result<Uuid>;
    async fn mark_webhook_processed(&self, id: Uuid) -> Result<()>;

    // --- directory (read-mostly collaborators) ---

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>>;
    async fn get_number(&self, id: Uuid) -> Result<Option<Number>>;
    async fn find_number_by_phone_number_id(&self, phone_number_id: &str)
        -> Result<Option<Number>>;
    async fn get_template(&self, id: Uuid) -> Result<Option<Template>>;
    async fn get_operator(&self, id: Uuid) -> Result<Option<Operator>>;
    async fn get_tabulation(&self, id: Uuid) -> Result<Option<Tabulation>>;

    /// Active operators with their current open-conversation load,
    /// least-loaded first (ties by id).
    async fn list_operator_loads(&self) -> Result<Vec<OperatorLoad>>;

    async fn set_operator_presence(&self, id: Uuid, online: bool, now: DateTime<Utc>)
        -> Result<()>;

    // --- conversations ---

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;
    async fn find_open_conversation(
        &self,
        customer_phone: &str,
        number_id: Uuid,
    ) -> Result<Option<Conversation>>;

    /// Insert an OPEN conversation, tolerating a concurrent insert for the
    /// same (phone, number): on conflict the winner's row is returned with
    /// `created = false`.
    async fn create_open_conversation(
        &self,
        number_id: Uuid,
        customer_phone: &str,
        customer_name: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<(Conversation, bool)>;

    /// Assign only while the operator is still under its cap; returns
    /// whether the assignment happened.
    async fn assign_if_under_capacity(
        &self,
        conversation_id: Uuid,
        operator_id: Uuid,
        max_concurrent: i32,
    ) -> Result<bool>;

    /// Record an inbound message on the conversation: bumps
    /// `last_message_at` and `last_customer_message_at`.
    async fn touch_conversation_inbound(&self, id: Uuid, timestamp: DateTime<Utc>) -> Result<()>;

    /// Side effects of a successful manual send on the eligibility
    /// counters.
    async fn record_manual_send(
        &self,
        id: Uuid,
        attempts_count: i32,
        window_start: DateTime<Utc>,
        blocked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn close_conversation(
        &self,
        id: Uuid,
        tabulation_id: Uuid,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_cpc(
        &self,
        id: Uuid,
        value: bool,
        operator_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_conversations(
        &self,
        operator_id: Option<Uuid>,
        status: Option<ConversationStatus>,
    ) -> Result<Vec<Conversation>>;

    // --- messages ---

    /// Look a message up by either provider reference (message id or wamid).
    async fn find_message_by_provider_id(&self, reference: &str) -> Result<Option<Message>>;
    async fn insert_message(&self, message: &Message) -> Result<()>;

    /// Conditional status transition keyed on the stored status; returns
    /// whether the update applied (false when another worker won).
    async fn apply_message_status(
        &self,
        id: Uuid,
        expected: MessageStatus,
        status: MessageStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool>;

    // --- conversation events ---

    async fn append_event(&self, event: &EventRecord) -> Result<()>;
    async fn has_campaign_event_since(&self, phone: &str, since: DateTime<Utc>) -> Result<bool>;
    async fn has_cpc_mark_since(&self, phone: &str, since: DateTime<Utc>) -> Result<bool>;

    // --- campaigns ---

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()>;
    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>>;
    async fn list_campaigns(&self) -> Result<Vec<Campaign>>;
    async fn delete_campaign(&self, id: Uuid) -> Result<()>;

    /// Transition the campaign status only from one of `from`; returns
    /// whether the transition applied.
    async fn update_campaign_status(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool>;

    async fn set_campaign_started(
        &self,
        id: Uuid,
        total_recipients: i32,
        csv_path: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn increment_campaign_sent(&self, id: Uuid) -> Result<()>;
    async fn increment_campaign_failed(&self, id: Uuid) -> Result<()>;
    async fn increment_campaign_delivered(&self, id: Uuid) -> Result<()>;
    async fn increment_campaign_read(&self, id: Uuid) -> Result<()>;
    /// A `failed` status correcting an earlier `sent`: failed +1, sent -1.
    async fn reconcile_campaign_failure(&self, id: Uuid) -> Result<()>;

    // --- campaign contacts ---

    /// Idempotent per-(campaign, phone) upsert; re-running an upload
    /// reuses the existing row.
    async fn upsert_campaign_contact(
        &self,
        campaign_id: Uuid,
        phone_number: &str,
    ) -> Result<CampaignContact>;

    async fn mark_contact(
        &self,
        id: Uuid,
        status: ContactStatus,
        failed_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn touch_contact_status(
        &self,
        campaign_id: Uuid,
        phone_number: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn contact_counts(&self, campaign_id: Uuid) -> Result<ContactCounts>;
}
