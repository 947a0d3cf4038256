//! In-memory store mirroring the SQL semantics, used by unit tests so the
//! routing, dispatch, and reconciliation logic run without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;
use zapgate_core::{
    CampaignStatus, ContactStatus, ConversationEventType, ConversationStatus, EventSource,
    MessageStatus, Result,
};

use crate::model::{
    Account, Campaign, CampaignContact, Conversation, ContactCounts, Message, Number, Operator,
    OperatorLoad, Tabulation, Template,
};

use super::{EventRecord, Store};

#[derive(Debug, Clone)]
struct StoredEvent {
    record: EventRecord,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    accounts: Vec<Account>,
    numbers: Vec<Number>,
    templates: Vec<Template>,
    operators: Vec<Operator>,
    tabulations: Vec<Tabulation>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    events: Vec<StoredEvent>,
    campaigns: Vec<Campaign>,
    contacts: Vec<CampaignContact>,
    webhook_events: Vec<(Uuid, serde_json::Value, bool)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account: Account) {
        self.inner.lock().accounts.push(account);
    }

    pub fn add_number(&self, number: Number) {
        self.inner.lock().numbers.push(number);
    }

    pub fn add_template(&self, template: Template) {
        self.inner.lock().templates.push(template);
    }

    pub fn add_operator(&self, operator: Operator) {
        self.inner.lock().operators.push(operator);
    }

    pub fn add_tabulation(&self, tabulation: Tabulation) {
        self.inner.lock().tabulations.push(tabulation);
    }

    pub fn add_campaign(&self, campaign: Campaign) {
        self.inner.lock().campaigns.push(campaign);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().messages.clone()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.lock().conversations.clone()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.inner.lock().events.iter().map(|e| e.record.clone()).collect()
    }

    pub fn contacts(&self) -> Vec<CampaignContact> {
        self.inner.lock().contacts.clone()
    }

    /// Backdate an event so compliance-window tests can cross the 24h line.
    pub fn backdate_events(&self, phone: &str, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        for event in &mut inner.events {
            if event.record.customer_phone == phone {
                event.created_at = created_at;
            }
        }
    }

    fn open_count(inner: &Inner, operator_id: Uuid) -> i64 {
        inner
            .conversations
            .iter()
            .filter(|c| c.operator_id == Some(operator_id) && c.status == ConversationStatus::Open)
            .count() as i64
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_webhook_event(&self, payload: &serde_json::Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.inner.lock().webhook_events.push((id, payload.clone(), false));
        Ok(id)
    }

    async fn mark_webhook_processed(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.webhook_events.iter_mut().find(|(eid, _, _)| *eid == id) {
            entry.2 = true;
        }
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.inner.lock().accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn get_number(&self, id: Uuid) -> Result<Option<Number>> {
        Ok(self.inner.lock().numbers.iter().find(|n| n.id == id).cloned())
    }

    async fn find_number_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Number>> {
        Ok(self
            .inner
            .lock()
            .numbers
            .iter()
            .find(|n| n.phone_number_id == phone_number_id)
            .cloned())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        Ok(self.inner.lock().templates.iter().find(|t| t.id == id).cloned())
    }

    async fn get_operator(&self, id: Uuid) -> Result<Option<Operator>> {
        Ok(self.inner.lock().operators.iter().find(|o| o.id == id).cloned())
    }

    async fn get_tabulation(&self, id: Uuid) -> Result<Option<Tabulation>> {
        Ok(self.inner.lock().tabulations.iter().find(|t| t.id == id).cloned())
    }

    async fn list_operator_loads(&self) -> Result<Vec<OperatorLoad>> {
        let inner = self.inner.lock();
        let mut loads: Vec<OperatorLoad> = inner
            .operators
            .iter()
            .filter(|o| o.is_active)
            .map(|o| OperatorLoad {
                operator: o.clone(),
                open_count: Self::open_count(&inner, o.id),
            })
            .collect();
        loads.sort_by(|a, b| {
            a.open_count
                .cmp(&b.open_count)
                .then(a.operator.id.cmp(&b.operator.id))
        });
        Ok(loads)
    }

    async fn set_operator_presence(
        &self,
        id: Uuid,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.operators.iter_mut().find(|o| o.id == id) {
            op.is_online = online;
            op.last_seen_at = Some(now);
        }
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.inner.lock().conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn find_open_conversation(
        &self,
        customer_phone: &str,
        number_id: Uuid,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .inner
            .lock()
            .conversations
            .iter()
            .find(|c| {
                c.customer_phone == customer_phone
                    && c.number_id == number_id
                    && c.status == ConversationStatus::Open
            })
            .cloned())
    }

    async fn create_open_conversation(
        &self,
        number_id: Uuid,
        customer_phone: &str,
        customer_name: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .conversations
            .iter()
            .find(|c| {
                c.customer_phone == customer_phone
                    && c.number_id == number_id
                    && c.status == ConversationStatus::Open
            })
            .cloned()
        {
            return Ok((existing, false));
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            number_id,
            customer_phone: customer_phone.to_string(),
            customer_name: customer_name.map(str::to_string),
            status: ConversationStatus::Open,
            operator_id: None,
            last_message_at: Some(timestamp),
            last_agent_message_at: None,
            last_customer_message_at: Some(timestamp),
            manual_attempts_count: 0,
            manual_attempts_window_start: None,
            manual_blocked_until: None,
            cpc_marked_at: None,
            cpc_marked_by: None,
            tabulation_id: None,
            notes: None,
            closed_at: None,
            created_at: timestamp,
        };
        inner.conversations.push(conversation.clone());
        Ok((conversation, true))
    }

    async fn assign_if_under_capacity(
        &self,
        conversation_id: Uuid,
        operator_id: Uuid,
        max_concurrent: i32,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if Self::open_count(&inner, operator_id) >= max_concurrent as i64 {
            return Ok(false);
        }
        if let Some(conv) = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id && c.status == ConversationStatus::Open)
        {
            conv.operator_id = Some(operator_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn touch_conversation_inbound(&self, id: Uuid, timestamp: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(conv) = inner.conversations.iter_mut().find(|c| c.id == id) {
            conv.last_message_at = Some(timestamp);
            conv.last_customer_message_at = Some(timestamp);
        }
        Ok(())
    }

    async fn record_manual_send(
        &self,
        id: Uuid,
        attempts_count: i32,
        window_start: DateTime<Utc>,
        blocked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(conv) = inner.conversations.iter_mut().find(|c| c.id == id) {
            conv.manual_attempts_count = attempts_count;
            conv.manual_attempts_window_start = Some(window_start);
            conv.manual_blocked_until = Some(blocked_until);
            conv.last_agent_message_at = Some(now);
            conv.last_message_at = Some(now);
        }
        Ok(())
    }

    async fn close_conversation(
        &self,
        id: Uuid,
        tabulation_id: Uuid,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(conv) = inner.conversations.iter_mut().find(|c| c.id == id) {
            conv.status = ConversationStatus::Closed;
            conv.tabulation_id = Some(tabulation_id);
            if notes.is_some() {
                conv.notes = notes.map(str::to_string);
            }
            conv.closed_at = Some(now);
        }
        Ok(())
    }

    async fn set_cpc(
        &self,
        id: Uuid,
        value: bool,
        operator_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(conv) = inner.conversations.iter_mut().find(|c| c.id == id) {
            if value {
                conv.cpc_marked_at = Some(now);
                conv.cpc_marked_by = operator_id;
            } else {
                conv.cpc_marked_at = None;
                conv.cpc_marked_by = None;
            }
        }
        Ok(())
    }

    async fn list_conversations(
        &self,
        operator_id: Option<Uuid>,
        status: Option<ConversationStatus>,
    ) -> Result<Vec<Conversation>> {
        Ok(self
            .inner
            .lock()
            .conversations
            .iter()
            .filter(|c| operator_id.map_or(true, |id| c.operator_id == Some(id)))
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn find_message_by_provider_id(&self, reference: &str) -> Result<Option<Message>> {
        Ok(self
            .inner
            .lock()
            .messages
            .iter()
            .find(|m| {
                m.provider_message_id.as_deref() == Some(reference)
                    || m.wamid.as_deref() == Some(reference)
            })
            .cloned())
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        self.inner.lock().messages.push(message.clone());
        Ok(())
    }

    async fn apply_message_status(
        &self,
        id: Uuid,
        expected: MessageStatus,
        status: MessageStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if let Some(msg) = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.status == expected)
        {
            msg.status = status;
            if error_code.is_some() {
                msg.error_code = error_code.map(str::to_string);
            }
            if error_message.is_some() {
                msg.error_message = error_message.map(str::to_string);
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn append_event(&self, event: &EventRecord) -> Result<()> {
        self.inner.lock().events.push(StoredEvent {
            record: event.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn has_campaign_event_since(&self, phone: &str, since: DateTime<Utc>) -> Result<bool> {
        Ok(self.inner.lock().events.iter().any(|e| {
            e.record.customer_phone == phone
                && e.record.source == EventSource::Campaign
                && e.created_at > since
        }))
    }

    async fn has_cpc_mark_since(&self, phone: &str, since: DateTime<Utc>) -> Result<bool> {
        Ok(self.inner.lock().events.iter().any(|e| {
            e.record.customer_phone == phone
                && e.record.event_type == ConversationEventType::CpcMarked
                && e.created_at > since
        }))
    }

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.inner.lock().campaigns.push(campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>> {
        Ok(self.inner.lock().campaigns.iter().find(|c| c.id == id).cloned())
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        Ok(self.inner.lock().campaigns.clone())
    }

    async fn delete_campaign(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.campaigns.retain(|c| c.id != id);
        inner.contacts.retain(|c| c.campaign_id != id);
        Ok(())
    }

    async fn update_campaign_status(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if let Some(campaign) = inner
            .campaigns
            .iter_mut()
            .find(|c| c.id == id && from.contains(&c.status))
        {
            campaign.status = to;
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_campaign_started(
        &self,
        id: Uuid,
        total_recipients: i32,
        csv_path: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(campaign) = inner.campaigns.iter_mut().find(|c| c.id == id) {
            campaign.status = CampaignStatus::Processing;
            campaign.total_recipients = total_recipients;
            campaign.csv_path = Some(csv_path.to_string());
            campaign.started_at = Some(now);
        }
        Ok(())
    }

    async fn increment_campaign_sent(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.campaigns.iter_mut().find(|c| c.id == id) {
            c.sent_count += 1;
        }
        Ok(())
    }

    async fn increment_campaign_failed(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.campaigns.iter_mut().find(|c| c.id == id) {
            c.failed_count += 1;
        }
        Ok(())
    }

    async fn increment_campaign_delivered(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.campaigns.iter_mut().find(|c| c.id == id) {
            c.delivered_count += 1;
        }
        Ok(())
    }

    async fn increment_campaign_read(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.campaigns.iter_mut().find(|c| c.id == id) {
            c.read_count += 1;
        }
        Ok(())
    }

    async fn reconcile_campaign_failure(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.campaigns.iter_mut().find(|c| c.id == id) {
            c.failed_count += 1;
            c.sent_count = (c.sent_count - 1).max(0);
        }
        Ok(())
    }

    async fn upsert_campaign_contact(
        &self,
        campaign_id: Uuid,
        phone_number: &str,
    ) -> Result<CampaignContact> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .contacts
            .iter()
            .find(|c| c.campaign_id == campaign_id && c.phone_number == phone_number)
            .cloned()
        {
            return Ok(existing);
        }
        let contact = CampaignContact {
            id: Uuid::new_v4(),
            campaign_id,
            phone_number: phone_number.to_string(),
            status: ContactStatus::Pending,
            last_attempt_at: None,
            last_sent_at: None,
            last_status_at: None,
            failed_reason: None,
        };
        inner.contacts.push(contact.clone());
        Ok(contact)
    }

    async fn mark_contact(
        &self,
        id: Uuid,
        status: ContactStatus,
        failed_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(contact) = inner.contacts.iter_mut().find(|c| c.id == id) {
            contact.status = status;
            contact.last_attempt_at = Some(now);
            match status {
                ContactStatus::Sent => {
                    contact.last_sent_at = Some(now);
                    contact.failed_reason = None;
                }
                ContactStatus::Failed => {
                    contact.failed_reason = failed_reason.map(str::to_string);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn touch_contact_status(
        &self,
        campaign_id: Uuid,
        phone_number: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(contact) = inner
            .contacts
            .iter_mut()
            .find(|c| c.campaign_id == campaign_id && c.phone_number == phone_number)
        {
            contact.last_status_at = Some(now);
        }
        Ok(())
    }

    async fn contact_counts(&self, campaign_id: Uuid) -> Result<ContactCounts> {
        let inner = self.inner.lock();
        let mut counts = ContactCounts::default();
        for contact in inner.contacts.iter().filter(|c| c.campaign_id == campaign_id) {
            match contact.status {
                ContactStatus::Pending => counts.pending += 1,
                ContactStatus::Sent => counts.sent += 1,
                ContactStatus::Failed => counts.failed += 1,
                ContactStatus::Skipped24h => counts.skipped_24h += 1,
            }
        }
        Ok(counts)
    }
}
