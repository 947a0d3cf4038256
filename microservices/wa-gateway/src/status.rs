//! Status reconciler
//!
//! Consumes delivery-status jobs, applies rank-gated message transitions,
//! keeps campaign aggregates in step, and relays the change to the
//! assigned operator with the message's original direction.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use zapgate_core::MessageStatus;

use crate::presence::{PresenceGateway, PushEvent};
use crate::queue::{JobError, JobHandler, JobResult};
use crate::store::Store;
use crate::webhook::StatusUpdateJob;

pub struct StatusReconciler {
    store: Arc<dyn Store>,
    presence: Arc<PresenceGateway>,
}

impl StatusReconciler {
    pub fn new(store: Arc<dyn Store>, presence: Arc<PresenceGateway>) -> Self {
        Self { store, presence }
    }
}

#[async_trait]
impl JobHandler<StatusUpdateJob> for StatusReconciler {
    async fn handle(&self, job: &StatusUpdateJob) -> JobResult {
        let message = match self
            .store
            .find_message_by_provider_id(&job.provider_message_id)
            .await
        {
            Ok(Some(message)) => message,
            Ok(None) => {
                // Status for a message we never stored is not actionable.
                debug!(
                    provider_message_id = %job.provider_message_id,
                    status = %job.status,
                    "Status for unknown message, dropping"
                );
                return Ok(());
            }
            Err(e) => return Err(JobError::Retry(e.to_string())),
        };

        let Some(new_status) = MessageStatus::parse(&job.status) else {
            debug!(status = %job.status, "Unrecognized provider status, dropping");
            return Ok(());
        };

        // Only forward transitions apply; duplicate or out-of-order
        // webhooks become no-ops and never double-count.
        if new_status.rank() <= message.status.rank() {
            return Ok(());
        }

        let applied = self
            .store
            .apply_message_status(
                message.id,
                message.status,
                new_status,
                job.error_code.as_deref(),
                job.error_message.as_deref(),
            )
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;

        if !applied {
            // Another worker applied a transition first; its run owns the
            // counter updates.
            return Ok(());
        }

        if let Some(campaign_id) = message.campaign_id {
            let counter_update = match new_status {
                MessageStatus::Delivered => {
                    self.store.increment_campaign_delivered(campaign_id).await
                }
                MessageStatus::Read => self.store.increment_campaign_read(campaign_id).await,
                MessageStatus::Failed => {
                    self.store.reconcile_campaign_failure(campaign_id).await
                }
                MessageStatus::Sent => Ok(()),
            };
            if let Err(e) = counter_update {
                warn!(error = %e, %campaign_id, "Failed to update campaign counters");
            }

            if let Some(phone) = message.content.get("to").and_then(|v| v.as_str()) {
                if let Err(e) = self
                    .store
                    .touch_contact_status(campaign_id, phone, Utc::now())
                    .await
                {
                    warn!(error = %e, %campaign_id, "Failed to stamp contact status time");
                }
            }
        }

        if let Some(conversation_id) = message.conversation_id {
            let conversation = self
                .store
                .get_conversation(conversation_id)
                .await
                .map_err(|e| JobError::Retry(e.to_string()))?;
            if let Some(operator_id) = conversation.and_then(|c| c.operator_id) {
                self.presence.push_to_operator(
                    operator_id,
                    PushEvent::MessageStatusChanged {
                        conversation_id,
                        message_id: message.id,
                        status: new_status,
                        // The stored direction, not re-derived: the UI
                        // tells inbound read receipts from outbound ones.
                        direction: message.direction,
                    },
                );
            }
        }

        Ok(())
    }
}
