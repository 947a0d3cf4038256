//! Incoming-message router
//!
//! Consumes inbound-message jobs: dedup by provider id, conversation
//! lookup-or-create, and the transbordo hand-off that assigns a new
//! conversation to the least-loaded active operator with spare capacity.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;
use zapgate_core::{
    ConversationEventType, EventSource, GatewayError, MessageDirection, MessageStatus, PhoneNumber,
};

use crate::model::{Conversation, Message};
use crate::presence::{PresenceGateway, PushEvent};
use crate::queue::{JobError, JobHandler, JobResult};
use crate::store::{EventRecord, Store};
use crate::webhook::InboundMessageJob;

pub struct IncomingMessageRouter {
    store: Arc<dyn Store>,
    presence: Arc<PresenceGateway>,
}

impl IncomingMessageRouter {
    pub fn new(store: Arc<dyn Store>, presence: Arc<PresenceGateway>) -> Self {
        Self { store, presence }
    }

    /// Pick the least-loaded active operator and try to assign. Only the
    /// single min-load candidate is considered; a full candidate leaves
    /// the conversation unassigned rather than falling through.
    async fn assign_operator(&self, conversation_id: Uuid) -> Result<Option<Uuid>, GatewayError> {
        let loads = self.store.list_operator_loads().await?;
        let Some(candidate) = loads.first() else {
            tracing::debug!(%conversation_id, "No active operator, leaving unassigned");
            return Ok(None);
        };

        if candidate.open_count >= candidate.operator.max_concurrent as i64 {
            tracing::debug!(
                %conversation_id,
                operator = %candidate.operator.id,
                "Least-loaded operator at capacity, leaving unassigned"
            );
            return Ok(None);
        }

        // Conditional update closes the race with a concurrent assignment
        // landing on the same operator.
        let assigned = self
            .store
            .assign_if_under_capacity(
                conversation_id,
                candidate.operator.id,
                candidate.operator.max_concurrent,
            )
            .await?;

        Ok(assigned.then_some(candidate.operator.id))
    }

    async fn resolve_conversation(
        &self,
        job: &InboundMessageJob,
        phone: &PhoneNumber,
        number_id: Uuid,
    ) -> Result<(Conversation, bool), GatewayError> {
        if let Some(existing) = self
            .store
            .find_open_conversation(phone.as_str(), number_id)
            .await?
        {
            self.store
                .touch_conversation_inbound(existing.id, job.timestamp)
                .await?;
            return Ok((existing, false));
        }

        let (mut conversation, created) = self
            .store
            .create_open_conversation(
                number_id,
                phone.as_str(),
                job.contact_name.as_deref(),
                job.timestamp,
            )
            .await?;

        if !created {
            // Another worker created it between our lookup and insert.
            self.store
                .touch_conversation_inbound(conversation.id, job.timestamp)
                .await?;
            return Ok((conversation, false));
        }

        if let Some(operator_id) = self.assign_operator(conversation.id).await? {
            conversation.operator_id = Some(operator_id);
        }
        Ok((conversation, true))
    }
}

#[async_trait]
impl JobHandler<InboundMessageJob> for IncomingMessageRouter {
    async fn handle(&self, job: &InboundMessageJob) -> JobResult {
        // Provider redelivery guard: either reference may have been seen.
        let seen = match self
            .store
            .find_message_by_provider_id(&job.provider_message_id)
            .await
        {
            Ok(seen) => seen.is_some(),
            Err(e) => return Err(JobError::Retry(e.to_string())),
        };
        if seen {
            tracing::debug!(
                provider_message_id = %job.provider_message_id,
                "Duplicate inbound message, skipping"
            );
            return Ok(());
        }
        if let Some(wamid) = &job.wamid {
            if wamid != &job.provider_message_id {
                match self.store.find_message_by_provider_id(wamid).await {
                    Ok(Some(_)) => return Ok(()),
                    Ok(None) => {}
                    Err(e) => return Err(JobError::Retry(e.to_string())),
                }
            }
        }

        let number = match self
            .store
            .find_number_by_phone_number_id(&job.phone_number_id)
            .await
        {
            Ok(Some(number)) => number,
            Ok(None) => {
                return Err(JobError::Discard(format!(
                    "no number registered for phone_number_id {}",
                    job.phone_number_id
                )))
            }
            Err(e) => return Err(JobError::Retry(e.to_string())),
        };

        let Some(phone) = PhoneNumber::normalize(&job.from) else {
            return Err(JobError::Discard(format!(
                "unparseable sender phone: {}",
                job.from
            )));
        };

        let (conversation, created) = self
            .resolve_conversation(job, &phone, number.id)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Some(conversation.id),
            number_id: number.id,
            campaign_id: None,
            direction: MessageDirection::Inbound,
            message_type: job.message_type.clone(),
            content: job.content.clone(),
            status: MessageStatus::Delivered,
            provider_message_id: Some(job.provider_message_id.clone()),
            wamid: job.wamid.clone(),
            error_code: None,
            error_message: None,
            message_timestamp: job.timestamp,
        };
        self.store
            .insert_message(&message)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;

        let event = EventRecord {
            conversation_id: Some(conversation.id),
            number_id: Some(number.id),
            customer_phone: phone.as_str().to_string(),
            source: EventSource::Operator,
            direction: Some(MessageDirection::Inbound),
            event_type: ConversationEventType::MessageReceived,
            payload: None,
        };
        if let Err(e) = self.store.append_event(&event).await {
            tracing::warn!(error = %e, "Failed to append message_received event");
        }

        // Unassigned conversations are not pushed; operators pick those up
        // from the conversation list.
        if let Some(operator_id) = conversation.operator_id {
            let event = if created {
                PushEvent::NewConversation {
                    conversation: conversation.clone(),
                }
            } else {
                PushEvent::NewMessage {
                    conversation_id: conversation.id,
                    message,
                }
            };
            self.presence.push_to_operator(operator_id, event);
        }

        Ok(())
    }
}
