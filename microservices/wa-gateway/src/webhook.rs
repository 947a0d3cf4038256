//! Webhook ingestor
//!
//! Persists the raw callback for audit, acknowledges inside the provider's
//! timeout budget, and fans messages/statuses out to the job queues from a
//! spawned task. Downstream failures never reach the acknowledgment.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, warn};

use crate::api::AppState;
use crate::store::Store;

/// Job consumed by the incoming-message router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessageJob {
    pub provider_message_id: String,
    pub wamid: Option<String>,
    pub from: String,
    pub phone_number_id: String,
    pub message_type: String,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub contact_name: Option<String>,
}

/// Job consumed by the status reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateJob {
    pub provider_message_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub recipient_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    value: Option<ChangeValue>,
}

#[derive(Debug, Deserialize)]
struct ChangeValue {
    metadata: Option<Metadata>,
    #[serde(default)]
    contacts: Vec<WebhookContact>,
    #[serde(default)]
    messages: Vec<serde_json::Value>,
    #[serde(default)]
    statuses: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookContact {
    wa_id: Option<String>,
    profile: Option<ContactProfile>,
}

#[derive(Debug, Deserialize)]
struct ContactProfile {
    name: Option<String>,
}

/// Verification handshake: echo `hub.challenge` back when the token
/// matches. Public by design.
pub async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == "subscribe"
        && !challenge.is_empty()
        && verify_token == state.config.webhook_verify_token
    {
        return (StatusCode::OK, challenge).into_response();
    }

    (StatusCode::FORBIDDEN, "verification failed").into_response()
}

/// Callback ingestion: persist, ack, process asynchronously.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    let event_id = match state.store.insert_webhook_event(&payload).await {
        Ok(id) => Some(id),
        Err(e) => {
            // The provider retries on non-2xx; losing the audit row is
            // preferable to a redelivery storm.
            error!(error = %e, "Failed to persist webhook event");
            None
        }
    };

    tokio::spawn(async move {
        let (messages, statuses) = extract_jobs(&payload);
        let message_count = messages.len();
        let status_count = statuses.len();

        for job in messages {
            state.incoming_queue.enqueue(job);
        }
        for job in statuses {
            state.status_queue.enqueue(job);
        }

        if let Some(id) = event_id {
            if let Err(e) = state.store.mark_webhook_processed(id).await {
                warn!(error = %e, webhook_event = %id, "Failed to flag webhook as processed");
            }
        }

        debug!(message_count, status_count, "Webhook fan-out complete");
    });

    (StatusCode::OK, "EVENT_RECEIVED")
}

/// Walk `entry[] -> changes[] -> value` and build queue jobs.
pub fn extract_jobs(payload: &serde_json::Value) -> (Vec<InboundMessageJob>, Vec<StatusUpdateJob>) {
    let parsed: WebhookPayload = match serde_json::from_value(payload.clone()) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Unrecognized webhook payload shape");
            return (Vec::new(), Vec::new());
        }
    };

    let mut messages = Vec::new();
    let mut statuses = Vec::new();

    for entry in parsed.entry {
        for change in entry.changes {
            if let Some(field) = &change.field {
                if field != "messages" {
                    continue;
                }
            }
            let Some(value) = change.value else { continue };
            let phone_number_id = value
                .metadata
                .as_ref()
                .and_then(|m| m.phone_number_id.clone())
                .unwrap_or_default();

            let names: HashMap<String, String> = value
                .contacts
                .iter()
                .filter_map(|c| {
                    let wa_id = c.wa_id.clone()?;
                    let name = c.profile.as_ref()?.name.clone()?;
                    Some((wa_id, name))
                })
                .collect();

            for message in &value.messages {
                let Some(id) = message.get("id").and_then(|v| v.as_str()) else {
                    warn!("Inbound message without id, skipping");
                    continue;
                };
                let from = message
                    .get("from")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                messages.push(InboundMessageJob {
                    provider_message_id: id.to_string(),
                    wamid: Some(id.to_string()),
                    contact_name: names.get(&from).cloned(),
                    from,
                    phone_number_id: phone_number_id.clone(),
                    message_type: message
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("text")
                        .to_string(),
                    content: message.clone(),
                    timestamp: provider_timestamp(message.get("timestamp")),
                });
            }

            for status in &value.statuses {
                let Some(id) = status.get("id").and_then(|v| v.as_str()) else {
                    warn!("Status update without message id, skipping");
                    continue;
                };
                let error = status
                    .get("errors")
                    .and_then(|v| v.as_array())
                    .and_then(|errors| errors.first());
                statuses.push(StatusUpdateJob {
                    provider_message_id: id.to_string(),
                    status: status
                        .get("status")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    timestamp: provider_timestamp(status.get("timestamp")),
                    recipient_id: status
                        .get("recipient_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    error_code: error
                        .and_then(|e| e.get("code"))
                        .map(|c| c.to_string().trim_matches('"').to_string()),
                    error_message: error
                        .and_then(|e| e.get("title"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                });
            }
        }
    }

    (messages, statuses)
}

/// Provider timestamps are unix seconds encoded as strings.
fn provider_timestamp(value: Option<&serde_json::Value>) -> DateTime<Utc> {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}
