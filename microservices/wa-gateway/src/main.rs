//! WhatsApp Gateway service entrypoint

use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use zapgate_core::{
    DependencyStatus, GatewayConfig, GatewayError, GatewayService, HealthStatus, ReadinessStatus,
    Result, ServiceRuntime,
};
use zapgate_db::{DbPool, PoolConfig};

use wa_gateway::api::{self, AppState};
use wa_gateway::campaign::{CampaignDispatcher, CampaignSendJob, CampaignService};
use wa_gateway::presence::PresenceGateway;
use wa_gateway::queue::{JobQueue, QueueOptions, RateLimit};
use wa_gateway::router::IncomingMessageRouter;
use wa_gateway::status::StatusReconciler;
use wa_gateway::store::{PgStore, Store};
use wa_gateway::webhook::{InboundMessageJob, StatusUpdateJob};
use wa_gateway::whatsapp::GraphApiClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wa_gateway=debug".parse().unwrap()),
        )
        .json()
        .init();

    info!("Starting WhatsApp gateway");

    let service = Arc::new(WaGatewayService::new().await?);
    ServiceRuntime::run(service).await
}

pub struct WaGatewayService {
    config: Arc<GatewayConfig>,
    store: Arc<PgStore>,
    state: AppState,
    start_time: std::time::Instant,
}

impl WaGatewayService {
    pub async fn new() -> Result<Self> {
        let config = Arc::new(GatewayConfig::from_env()?);

        let pool = DbPool::new(PoolConfig {
            url: config.database_url.clone(),
            ..PoolConfig::from_env()
        })
        .await
        .map_err(|e| GatewayError::Database(e.to_string()))?;
        zapgate_db::ensure_schema(&pool)
            .await
            .map_err(|e| GatewayError::Database(e.to_string()))?;

        let store = Arc::new(PgStore::new(pool));
        let presence = Arc::new(PresenceGateway::new());
        let whatsapp = Arc::new(GraphApiClient::new(
            &config.graph_api_base,
            &config.graph_api_version,
            Duration::from_secs(config.provider_timeout_secs),
        )?);

        let incoming_queue: JobQueue<InboundMessageJob> = JobQueue::new(
            "incoming-messages",
            QueueOptions {
                concurrency: config.incoming_concurrency,
                rate_limit: None,
                max_attempts: config.max_job_attempts,
                backoff_base: Duration::from_millis(config.retry_backoff_ms),
            },
        );
        let status_queue: JobQueue<StatusUpdateJob> = JobQueue::new(
            "status-updates",
            QueueOptions {
                concurrency: config.status_concurrency,
                rate_limit: None,
                max_attempts: config.max_job_attempts,
                backoff_base: Duration::from_millis(config.retry_backoff_ms),
            },
        );
        let campaign_queue: JobQueue<CampaignSendJob> = JobQueue::new(
            "campaign-sends",
            QueueOptions {
                concurrency: config.campaign_concurrency,
                rate_limit: Some(RateLimit {
                    max: config.campaign_sends_per_minute,
                    window: Duration::from_secs(60),
                }),
                max_attempts: config.max_job_attempts,
                backoff_base: Duration::from_millis(config.retry_backoff_ms),
            },
        );

        let store_dyn: Arc<dyn Store> = store.clone();
        let campaigns = Arc::new(CampaignService::new(
            store_dyn.clone(),
            campaign_queue.clone(),
            config.upload_dir.clone(),
        ));

        let state = AppState {
            store: store_dyn,
            presence,
            campaigns,
            whatsapp,
            config: config.clone(),
            incoming_queue,
            status_queue,
            campaign_queue,
        };

        Ok(Self {
            config,
            store,
            state,
            start_time: std::time::Instant::now(),
        })
    }
}

#[async_trait::async_trait]
impl GatewayService for WaGatewayService {
    fn service_id(&self) -> &'static str {
        "wa-gateway"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        ReadinessStatus {
            ready: self.store.is_healthy().await,
            dependencies: vec![DependencyStatus {
                name: "postgres".to_string(),
                available: self.store.is_healthy().await,
                latency_ms: None,
            }],
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down WhatsApp gateway");
        self.state.incoming_queue.shutdown();
        self.state.status_queue.shutdown();
        self.state.campaign_queue.shutdown();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        // Queue workers run alongside the HTTP path; the relational store
        // is their only synchronization point.
        self.state.incoming_queue.start(Arc::new(IncomingMessageRouter::new(
            self.state.store.clone(),
            self.state.presence.clone(),
        )));
        self.state.status_queue.start(Arc::new(StatusReconciler::new(
            self.state.store.clone(),
            self.state.presence.clone(),
        )));
        self.state.campaign_queue.start(Arc::new(CampaignDispatcher::new(
            self.state.store.clone(),
            self.state.whatsapp.clone(),
        )));

        let app = api::router(self.state.clone());
        info!(bind = %self.config.http_bind, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(&self.config.http_bind).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
