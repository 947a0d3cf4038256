//! Campaign dispatch worker
//!
//! One job per recipient. Before sending, the 24h no-repeat gate checks
//! the conversation-event log for a recent CAMPAIGN send or CPC mark to
//! the same phone. Paused campaigns postpone their jobs without burning
//! retry attempts, so concurrent campaigns keep flowing.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;
use zapgate_core::{
    CampaignStatus, ContactStatus, ConversationEventType, EventSource, MessageDirection,
    MessageStatus,
};

use crate::model::Message;
use crate::queue::{JobError, JobHandler, JobResult};
use crate::store::{EventRecord, Store};
use crate::whatsapp::WhatsAppApi;

/// Hours a phone is protected after a campaign send or CPC mark.
pub const COMPLIANCE_WINDOW_HOURS: i64 = 24;

/// Delay before a paused campaign's job is looked at again.
const PAUSE_RECHECK: Duration = Duration::from_secs(30);

/// One recipient send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSendJob {
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    pub phone: String,
    pub params: Vec<String>,
}

pub struct CampaignDispatcher {
    store: Arc<dyn Store>,
    whatsapp: Arc<dyn WhatsAppApi>,
}

impl CampaignDispatcher {
    pub fn new(store: Arc<dyn Store>, whatsapp: Arc<dyn WhatsAppApi>) -> Self {
        Self { store, whatsapp }
    }
}

#[async_trait]
impl JobHandler<CampaignSendJob> for CampaignDispatcher {
    async fn handle(&self, job: &CampaignSendJob) -> JobResult {
        let campaign = match self.store.get_campaign(job.campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => return Err(JobError::Discard("campaign no longer exists".into())),
            Err(e) => return Err(JobError::Retry(e.to_string())),
        };

        match campaign.status {
            CampaignStatus::Paused => return Err(JobError::Postpone(PAUSE_RECHECK)),
            CampaignStatus::Cancelled | CampaignStatus::Failed | CampaignStatus::Completed => {
                return Err(JobError::Discard(format!(
                    "campaign is {}",
                    campaign.status.as_str()
                )))
            }
            CampaignStatus::Pending | CampaignStatus::Processing => {}
        }

        let now = Utc::now();
        let window_start = now - ChronoDuration::hours(COMPLIANCE_WINDOW_HOURS);

        let recently_contacted = self
            .store
            .has_campaign_event_since(&job.phone, window_start)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?
            || self
                .store
                .has_cpc_mark_since(&job.phone, window_start)
                .await
                .map_err(|e| JobError::Retry(e.to_string()))?;

        if recently_contacted {
            debug!(phone = %job.phone, campaign = %campaign.id, "Within 24h window, skipping");
            self.store
                .mark_contact(job.contact_id, ContactStatus::Skipped24h, None, now)
                .await
                .map_err(|e| JobError::Retry(e.to_string()))?;
            return Ok(());
        }

        let template = match self.store.get_template(campaign.template_id).await {
            Ok(Some(template)) => template,
            Ok(None) => return Err(JobError::Discard("campaign template missing".into())),
            Err(e) => return Err(JobError::Retry(e.to_string())),
        };
        let number = match self.store.get_number(campaign.number_id).await {
            Ok(Some(number)) => number,
            Ok(None) => return Err(JobError::Discard("campaign number missing".into())),
            Err(e) => return Err(JobError::Retry(e.to_string())),
        };
        let account = match self.store.get_account(number.account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return Err(JobError::Discard("campaign account missing".into())),
            Err(e) => return Err(JobError::Retry(e.to_string())),
        };

        let provider_id = match self
            .whatsapp
            .send_template(
                &number,
                &account.access_token,
                &job.phone,
                &template,
                &job.params,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let reason = e.to_string();
                if let Err(mark_err) = self
                    .store
                    .mark_contact(job.contact_id, ContactStatus::Failed, Some(&reason), now)
                    .await
                {
                    error!(error = %mark_err, "Failed to record contact failure");
                }
                if let Err(count_err) = self.store.increment_campaign_failed(campaign.id).await {
                    error!(error = %count_err, "Failed to bump campaign failed counter");
                }
                return Err(JobError::Retry(reason));
            }
        };

        // From here on the provider has accepted the message. A failed
        // write is logged loudly and never retried: a retry would re-send.
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: None,
            number_id: number.id,
            campaign_id: Some(campaign.id),
            direction: MessageDirection::Outbound,
            message_type: "template".to_string(),
            content: json!({
                "template": template.name,
                "to": job.phone,
                "parameters": job.params,
            }),
            status: MessageStatus::Sent,
            provider_message_id: Some(provider_id.0.clone()),
            wamid: None,
            error_code: None,
            error_message: None,
            message_timestamp: now,
        };
        if let Err(e) = self.store.insert_message(&message).await {
            error!(
                error = %e,
                provider_message_id = %provider_id.0,
                campaign = %campaign.id,
                "Sent but could not persist campaign message"
            );
        }
        if let Err(e) = self
            .store
            .mark_contact(job.contact_id, ContactStatus::Sent, None, now)
            .await
        {
            error!(error = %e, contact = %job.contact_id, "Sent but could not mark contact");
        }
        if let Err(e) = self
            .store
            .append_event(&EventRecord {
                conversation_id: None,
                number_id: Some(number.id),
                customer_phone: job.phone.clone(),
                source: EventSource::Campaign,
                direction: Some(MessageDirection::Outbound),
                event_type: ConversationEventType::MessageSent,
                payload: Some(json!({ "campaign_id": campaign.id, "template": template.name })),
            })
            .await
        {
            error!(error = %e, campaign = %campaign.id, "Sent but could not append campaign event");
        }
        if let Err(e) = self.store.increment_campaign_sent(campaign.id).await {
            error!(error = %e, campaign = %campaign.id, "Sent but could not bump sent counter");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, Campaign, Number, Template};
    use crate::store::memory::MemoryStore;
    use crate::whatsapp::ProviderMessageId;
    use parking_lot::Mutex;
    use zapgate_core::{GatewayError, Result};

    struct MockWhatsApp {
        sent: Mutex<Vec<(String, Vec<String>)>>,
        fail: Mutex<bool>,
    }

    impl MockWhatsApp {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl WhatsAppApi for MockWhatsApp {
        async fn send_text(
            &self,
            _number: &Number,
            _access_token: &str,
            _to: &str,
            _body: &str,
            _preview_url: bool,
        ) -> Result<ProviderMessageId> {
            Ok(ProviderMessageId("wamid.text".to_string()))
        }

        async fn send_template(
            &self,
            _number: &Number,
            _access_token: &str,
            to: &str,
            _template: &Template,
            params: &[String],
        ) -> Result<ProviderMessageId> {
            if *self.fail.lock() {
                return Err(GatewayError::Provider("provider down".into()));
            }
            self.sent.lock().push((to.to_string(), params.to_vec()));
            Ok(ProviderMessageId(format!("wamid.out-{}", to)))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        whatsapp: Arc<MockWhatsApp>,
        campaign: Campaign,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let account = Account {
            id: Uuid::new_v4(),
            name: "acme".to_string(),
            business_id: "biz-1".to_string(),
            access_token: "token".to_string(),
            is_active: true,
        };
        let number = Number {
            id: Uuid::new_v4(),
            account_id: account.id,
            phone_number: "5511888887777".to_string(),
            phone_number_id: "pn-1".to_string(),
            display_name: None,
            is_active: true,
        };
        let template = Template {
            id: Uuid::new_v4(),
            account_id: account.id,
            number_id: Some(number.id),
            name: "promo".to_string(),
            language: "pt_BR".to_string(),
            category: None,
            variables: vec!["nome".to_string()],
        };
        let campaign = Campaign {
            id: Uuid::new_v4(),
            account_id: account.id,
            number_id: number.id,
            template_id: template.id,
            name: "maio".to_string(),
            status: CampaignStatus::Processing,
            rate_limit: 60,
            total_recipients: 1,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            failed_count: 0,
            csv_path: None,
            started_at: None,
            created_at: Utc::now(),
        };
        store.add_account(account);
        store.add_number(number);
        store.add_template(template);
        store.add_campaign(campaign.clone());
        Fixture {
            store,
            whatsapp: MockWhatsApp::new(),
            campaign,
        }
    }

    async fn contact(fixture: &Fixture, phone: &str) -> CampaignSendJob {
        let contact = fixture
            .store
            .upsert_campaign_contact(fixture.campaign.id, phone)
            .await
            .unwrap();
        CampaignSendJob {
            campaign_id: fixture.campaign.id,
            contact_id: contact.id,
            phone: phone.to_string(),
            params: vec!["Maria".to_string()],
        }
    }

    #[tokio::test]
    async fn successful_send_records_everything() {
        let fixture = fixture().await;
        let job = contact(&fixture, "5511999998888").await;
        let dispatcher =
            CampaignDispatcher::new(fixture.store.clone(), fixture.whatsapp.clone());

        dispatcher.handle(&job).await.unwrap();

        assert_eq!(fixture.whatsapp.sent.lock().len(), 1);

        let campaign = fixture
            .store
            .get_campaign(fixture.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.sent_count, 1);

        let contacts = fixture.store.contacts();
        assert_eq!(contacts[0].status, ContactStatus::Sent);
        assert!(contacts[0].last_sent_at.is_some());

        // Standalone message: campaign sends are pre-conversation
        let messages = fixture.store.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].conversation_id.is_none());
        assert_eq!(messages[0].campaign_id, Some(fixture.campaign.id));

        let events = fixture.store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, EventSource::Campaign);
    }

    #[tokio::test]
    async fn recent_campaign_event_skips_contact() {
        let fixture = fixture().await;
        let job = contact(&fixture, "5511999998888").await;
        let dispatcher =
            CampaignDispatcher::new(fixture.store.clone(), fixture.whatsapp.clone());

        // A campaign touched this phone two hours ago
        fixture
            .store
            .append_event(&EventRecord {
                conversation_id: None,
                number_id: None,
                customer_phone: job.phone.clone(),
                source: EventSource::Campaign,
                direction: Some(MessageDirection::Outbound),
                event_type: ConversationEventType::MessageSent,
                payload: None,
            })
            .await
            .unwrap();
        fixture
            .store
            .backdate_events(&job.phone, Utc::now() - ChronoDuration::hours(2));

        dispatcher.handle(&job).await.unwrap();

        assert!(fixture.whatsapp.sent.lock().is_empty());
        assert_eq!(fixture.store.contacts()[0].status, ContactStatus::Skipped24h);
    }

    #[tokio::test]
    async fn stale_campaign_event_does_not_skip() {
        let fixture = fixture().await;
        let job = contact(&fixture, "5511999998888").await;
        let dispatcher =
            CampaignDispatcher::new(fixture.store.clone(), fixture.whatsapp.clone());

        fixture
            .store
            .append_event(&EventRecord {
                conversation_id: None,
                number_id: None,
                customer_phone: job.phone.clone(),
                source: EventSource::Campaign,
                direction: Some(MessageDirection::Outbound),
                event_type: ConversationEventType::MessageSent,
                payload: None,
            })
            .await
            .unwrap();
        fixture
            .store
            .backdate_events(&job.phone, Utc::now() - ChronoDuration::hours(25));

        dispatcher.handle(&job).await.unwrap();

        assert_eq!(fixture.whatsapp.sent.lock().len(), 1);
        assert_eq!(fixture.store.contacts()[0].status, ContactStatus::Sent);
    }

    #[tokio::test]
    async fn recent_cpc_mark_skips_contact() {
        let fixture = fixture().await;
        let job = contact(&fixture, "5511999998888").await;
        let dispatcher =
            CampaignDispatcher::new(fixture.store.clone(), fixture.whatsapp.clone());

        fixture
            .store
            .append_event(&EventRecord {
                conversation_id: None,
                number_id: None,
                customer_phone: job.phone.clone(),
                source: EventSource::Operator,
                direction: None,
                event_type: ConversationEventType::CpcMarked,
                payload: None,
            })
            .await
            .unwrap();

        dispatcher.handle(&job).await.unwrap();

        assert!(fixture.whatsapp.sent.lock().is_empty());
        assert_eq!(fixture.store.contacts()[0].status, ContactStatus::Skipped24h);
    }

    #[tokio::test]
    async fn provider_failure_marks_contact_and_retries() {
        let fixture = fixture().await;
        let job = contact(&fixture, "5511999998888").await;
        *fixture.whatsapp.fail.lock() = true;
        let dispatcher =
            CampaignDispatcher::new(fixture.store.clone(), fixture.whatsapp.clone());

        let result = dispatcher.handle(&job).await;
        assert!(matches!(result, Err(JobError::Retry(_))));

        let contacts = fixture.store.contacts();
        assert_eq!(contacts[0].status, ContactStatus::Failed);
        assert!(contacts[0].failed_reason.as_deref().unwrap().contains("provider down"));

        let campaign = fixture
            .store
            .get_campaign(fixture.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.failed_count, 1);
    }

    #[tokio::test]
    async fn paused_campaign_postpones_without_attempt() {
        let fixture = fixture().await;
        let job = contact(&fixture, "5511999998888").await;
        fixture
            .store
            .update_campaign_status(
                fixture.campaign.id,
                &[CampaignStatus::Processing],
                CampaignStatus::Paused,
            )
            .await
            .unwrap();
        let dispatcher =
            CampaignDispatcher::new(fixture.store.clone(), fixture.whatsapp.clone());

        let result = dispatcher.handle(&job).await;
        assert!(matches!(result, Err(JobError::Postpone(_))));
        assert!(fixture.whatsapp.sent.lock().is_empty());
        assert_eq!(fixture.store.contacts()[0].status, ContactStatus::Pending);
    }

    #[tokio::test]
    async fn deleted_campaign_discards_job() {
        let fixture = fixture().await;
        let job = contact(&fixture, "5511999998888").await;
        fixture.store.delete_campaign(fixture.campaign.id).await.unwrap();
        let dispatcher =
            CampaignDispatcher::new(fixture.store.clone(), fixture.whatsapp.clone());

        let result = dispatcher.handle(&job).await;
        assert!(matches!(result, Err(JobError::Discard(_))));
    }
}
