//! HTTP surface
//!
//! Public webhook + realtime channel, and the operator/campaign API
//! behind the shared-secret guard.

pub mod rest;
pub mod websocket;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use zapgate_core::{GatewayConfig, GatewayError};

use crate::campaign::{CampaignSendJob, CampaignService};
use crate::presence::PresenceGateway;
use crate::queue::JobQueue;
use crate::store::Store;
use crate::webhook::{self, InboundMessageJob, StatusUpdateJob};
use crate::whatsapp::WhatsAppApi;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub presence: Arc<PresenceGateway>,
    pub campaigns: Arc<CampaignService>,
    pub whatsapp: Arc<dyn WhatsAppApi>,
    pub config: Arc<GatewayConfig>,
    pub incoming_queue: JobQueue<InboundMessageJob>,
    pub status_queue: JobQueue<StatusUpdateJob>,
    pub campaign_queue: JobQueue<CampaignSendJob>,
}

/// Generic API response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// Error wrapper translating the service taxonomy into HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.0.to_string(),
            "code": self.0.error_code(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Shared-secret guard: bearer token or `x-api-key` header.
async fn require_secret(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let headers = request.headers();
    let bearer_ok = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == state.config.api_secret)
        .unwrap_or(false);
    let api_key_ok = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|key| key == state.config.api_secret)
        .unwrap_or(false);

    if bearer_ok || api_key_ok {
        next.run(request).await
    } else {
        ApiError(GatewayError::Auth("invalid or missing credentials".into())).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/conversations", get(rest::list_conversations))
        .route("/conversations/{id}", get(rest::get_conversation))
        .route("/conversations/{id}/eligibility", get(rest::get_eligibility))
        .route("/conversations/{id}/messages", post(rest::send_message))
        .route("/conversations/{id}/close", post(rest::close_conversation))
        .route("/conversations/{id}/assign", put(rest::assign_conversation))
        .route("/conversations/{id}/cpc", post(rest::set_cpc))
        .route(
            "/campaigns",
            post(rest::create_campaign).get(rest::list_campaigns),
        )
        .route("/campaigns/{id}", delete(rest::delete_campaign))
        .route("/campaigns/{id}/upload-csv", post(rest::upload_campaign_csv))
        .route("/campaigns/{id}/pause", post(rest::pause_campaign))
        .route("/campaigns/{id}/resume", post(rest::resume_campaign))
        .route("/campaigns/{id}/stats", get(rest::campaign_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_secret,
        ))
        .layer(DefaultBodyLimit::max(state.config.max_csv_bytes));

    Router::new()
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::ready_check))
        .route(
            "/webhook",
            get(webhook::verify_webhook).post(webhook::receive_webhook),
        )
        .route("/ws", get(websocket::ws_handler))
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
