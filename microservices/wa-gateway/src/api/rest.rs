//! REST API handlers

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;
use zapgate_core::{
    ConversationEventType, ConversationStatus, EventSource, GatewayError, MessageDirection,
    MessageStatus,
};

use crate::campaign::NewCampaign;
use crate::eligibility::{compute_eligibility, manual_send_effects, send_denial};
use crate::model::{Conversation, Message};
use crate::presence::PushEvent;
use crate::store::{EventRecord, Store};

use super::{ApiError, ApiResponse, ApiResult, AppState};

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn ready_check() -> &'static str {
    "OK"
}

// --- conversations ---

#[derive(Debug, Deserialize)]
pub struct ConversationsQuery {
    pub operator_id: Option<Uuid>,
    pub status: Option<String>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ConversationsQuery>,
) -> ApiResult<Json<ApiResponse<Vec<Conversation>>>> {
    let status = match &query.status {
        None => None,
        Some(raw) => Some(ConversationStatus::parse(raw).ok_or_else(|| {
            ApiError(GatewayError::Validation(format!(
                "unknown conversation status: {}",
                raw
            )))
        })?),
    };
    let conversations = state
        .store
        .list_conversations(query.operator_id, status)
        .await?;
    Ok(ApiResponse::success(conversations))
}

async fn load_conversation(state: &AppState, id: Uuid) -> ApiResult<Conversation> {
    state
        .store
        .get_conversation(id)
        .await?
        .ok_or_else(|| ApiError(GatewayError::NotFound("conversation".into())))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Conversation>>> {
    let conversation = load_conversation(&state, id).await?;
    Ok(ApiResponse::success(conversation))
}

pub async fn get_eligibility(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let conversation = load_conversation(&state, id).await?;
    let eligibility = compute_eligibility(&conversation, Utc::now());
    Ok(ApiResponse::success(eligibility).into_response())
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageRequest {
    #[validate(length(min = 1, max = 4096))]
    pub text: String,
    pub preview_url: Option<bool>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    request
        .validate()
        .map_err(|e| ApiError(GatewayError::Validation(e.to_string())))?;

    let conversation = load_conversation(&state, id).await?;
    if conversation.status != ConversationStatus::Open {
        return Err(ApiError(GatewayError::Conflict(
            "conversation is closed".into(),
        )));
    }

    let now = Utc::now();
    let eligibility = compute_eligibility(&conversation, now);
    if let Some(denial) = send_denial(&eligibility) {
        // Denial is an explained outcome, not an exception
        let body = Json(serde_json::json!({
            "success": false,
            "error": denial.message(),
            "reason": denial.reason_code(),
            "eligibility": eligibility,
        }));
        return Ok((StatusCode::UNPROCESSABLE_ENTITY, body).into_response());
    }

    let number = state
        .store
        .get_number(conversation.number_id)
        .await?
        .ok_or_else(|| ApiError(GatewayError::NotFound("number".into())))?;
    let account = state
        .store
        .get_account(number.account_id)
        .await?
        .ok_or_else(|| ApiError(GatewayError::NotFound("account".into())))?;

    let provider_id = state
        .whatsapp
        .send_text(
            &number,
            &account.access_token,
            &conversation.customer_phone,
            &request.text,
            request.preview_url.unwrap_or(false),
        )
        .await?;

    let effects = manual_send_effects(&conversation, now);
    state
        .store
        .record_manual_send(
            conversation.id,
            effects.attempts_count,
            effects.window_start,
            effects.blocked_until,
            now,
        )
        .await?;

    let message = Message {
        id: Uuid::new_v4(),
        conversation_id: Some(conversation.id),
        number_id: number.id,
        campaign_id: None,
        direction: MessageDirection::Outbound,
        message_type: "text".to_string(),
        content: serde_json::json!({
            "text": { "body": request.text },
            "to": conversation.customer_phone,
        }),
        status: MessageStatus::Sent,
        provider_message_id: Some(provider_id.0.clone()),
        wamid: None,
        error_code: None,
        error_message: None,
        message_timestamp: now,
    };
    if let Err(e) = state.store.insert_message(&message).await {
        // Already on the wire; never re-send because a write failed
        tracing::error!(
            error = %e,
            provider_message_id = %provider_id.0,
            "Sent but could not persist operator message"
        );
    }

    if let Err(e) = state
        .store
        .append_event(&EventRecord {
            conversation_id: Some(conversation.id),
            number_id: Some(number.id),
            customer_phone: conversation.customer_phone.clone(),
            source: EventSource::Operator,
            direction: Some(MessageDirection::Outbound),
            event_type: ConversationEventType::MessageSent,
            payload: None,
        })
        .await
    {
        tracing::warn!(error = %e, "Failed to append message_sent event");
    }

    if let Some(operator_id) = conversation.operator_id {
        state.presence.push_to_operator(
            operator_id,
            PushEvent::NewMessage {
                conversation_id: conversation.id,
                message: message.clone(),
            },
        );
    }

    Ok(ApiResponse::success(message).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CloseConversationRequest {
    pub tabulation_id: Uuid,
    pub notes: Option<String>,
}

pub async fn close_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CloseConversationRequest>,
) -> ApiResult<Json<ApiResponse<Conversation>>> {
    let conversation = load_conversation(&state, id).await?;
    if conversation.status != ConversationStatus::Open {
        return Err(ApiError(GatewayError::Conflict(
            "conversation is already closed".into(),
        )));
    }

    let tabulation = state
        .store
        .get_tabulation(request.tabulation_id)
        .await?
        .ok_or_else(|| ApiError(GatewayError::NotFound("tabulation".into())))?;
    let notes = request.notes.as_deref().map(str::trim).filter(|n| !n.is_empty());
    if tabulation.requires_notes && notes.is_none() {
        return Err(ApiError(GatewayError::Validation(format!(
            "tabulation '{}' requires notes",
            tabulation.name
        ))));
    }

    let now = Utc::now();
    state
        .store
        .close_conversation(conversation.id, tabulation.id, notes, now)
        .await?;

    if let Err(e) = state
        .store
        .append_event(&EventRecord {
            conversation_id: Some(conversation.id),
            number_id: Some(conversation.number_id),
            customer_phone: conversation.customer_phone.clone(),
            source: EventSource::Operator,
            direction: None,
            event_type: ConversationEventType::TabulationApplied,
            payload: Some(serde_json::json!({ "tabulation_id": tabulation.id })),
        })
        .await
    {
        tracing::warn!(error = %e, "Failed to append tabulation event");
    }

    let closed = load_conversation(&state, id).await?;
    Ok(ApiResponse::success(closed))
}

#[derive(Debug, Deserialize)]
pub struct AssignConversationRequest {
    pub operator_id: Uuid,
}

pub async fn assign_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<AssignConversationRequest>,
) -> ApiResult<Json<ApiResponse<Conversation>>> {
    let conversation = load_conversation(&state, id).await?;
    if conversation.status != ConversationStatus::Open {
        return Err(ApiError(GatewayError::Conflict(
            "conversation is closed".into(),
        )));
    }

    let operator = state
        .store
        .get_operator(request.operator_id)
        .await?
        .ok_or_else(|| ApiError(GatewayError::NotFound("operator".into())))?;
    if !operator.is_active {
        return Err(ApiError(GatewayError::Validation(
            "operator is inactive".into(),
        )));
    }

    let assigned = state
        .store
        .assign_if_under_capacity(conversation.id, operator.id, operator.max_concurrent)
        .await?;
    if !assigned {
        return Err(ApiError(GatewayError::Conflict(
            "operator is at max concurrent conversations".into(),
        )));
    }

    // Tell the previous owner it lost the conversation
    if let Some(previous) = conversation.operator_id {
        if previous != operator.id {
            state.presence.push_to_operator(
                previous,
                PushEvent::ConversationUnassigned {
                    conversation_id: conversation.id,
                },
            );
        }
    }

    let updated = load_conversation(&state, id).await?;
    state.presence.push_to_operator(
        operator.id,
        PushEvent::NewConversation {
            conversation: updated.clone(),
        },
    );

    Ok(ApiResponse::success(updated))
}

#[derive(Debug, Deserialize)]
pub struct CpcRequest {
    pub value: bool,
    pub operator_id: Option<Uuid>,
}

pub async fn set_cpc(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CpcRequest>,
) -> ApiResult<Json<ApiResponse<Conversation>>> {
    let conversation = load_conversation(&state, id).await?;
    let now = Utc::now();

    state
        .store
        .set_cpc(conversation.id, request.value, request.operator_id, now)
        .await?;

    let event_type = if request.value {
        ConversationEventType::CpcMarked
    } else {
        ConversationEventType::CpcCleared
    };
    if let Err(e) = state
        .store
        .append_event(&EventRecord {
            conversation_id: Some(conversation.id),
            number_id: Some(conversation.number_id),
            customer_phone: conversation.customer_phone.clone(),
            source: EventSource::Operator,
            direction: None,
            event_type,
            payload: request
                .operator_id
                .map(|op| serde_json::json!({ "operator_id": op })),
        })
        .await
    {
        tracing::warn!(error = %e, "Failed to append CPC event");
    }

    let updated = load_conversation(&state, id).await?;
    Ok(ApiResponse::success(updated))
}

// --- campaigns ---

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCampaignRequest {
    pub account_id: Uuid,
    pub number_id: Uuid,
    pub template_id: Uuid,
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    /// Messages per minute
    #[validate(range(min = 1, max = 600))]
    pub rate_limit: i32,
}

pub async fn create_campaign(
    State(state): State<AppState>,
    Json(request): Json<CreateCampaignRequest>,
) -> ApiResult<Json<ApiResponse<crate::model::Campaign>>> {
    request
        .validate()
        .map_err(|e| ApiError(GatewayError::Validation(e.to_string())))?;

    let campaign = state
        .campaigns
        .create(NewCampaign {
            account_id: request.account_id,
            number_id: request.number_id,
            template_id: request.template_id,
            name: request.name,
            rate_limit: request.rate_limit,
        })
        .await?;
    Ok(ApiResponse::success(campaign))
}

pub async fn list_campaigns(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<Vec<crate::model::Campaign>>>> {
    let campaigns = state.campaigns.list().await?;
    Ok(ApiResponse::success(campaigns))
}

pub async fn upload_campaign_csv(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> ApiResult<Json<ApiResponse<crate::model::Campaign>>> {
    let mut upload: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(GatewayError::Validation(format!("multipart: {}", e))))?
    {
        let is_csv = field
            .file_name()
            .map(|name| name.to_lowercase().ends_with(".csv"))
            .unwrap_or(false)
            || field
                .content_type()
                .map(|ct| ct.contains("csv"))
                .unwrap_or(false);
        if !is_csv {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError(GatewayError::Validation(format!("upload read: {}", e))))?;
        upload = Some(bytes.to_vec());
        break;
    }

    let data = upload.ok_or_else(|| {
        ApiError(GatewayError::Validation(
            "multipart upload must contain a CSV file".into(),
        ))
    })?;
    if data.len() > state.config.max_csv_bytes {
        return Err(ApiError(GatewayError::Validation(format!(
            "CSV exceeds the {} byte limit",
            state.config.max_csv_bytes
        ))));
    }

    let campaign = state.campaigns.upload_csv(id, &data).await?;
    Ok(ApiResponse::success(campaign))
}

pub async fn pause_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.campaigns.pause(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resume_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.campaigns.resume(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.campaigns.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn campaign_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<crate::campaign::CampaignStats>>> {
    let stats = state.campaigns.stats(id).await?;
    Ok(ApiResponse::success(stats))
}
