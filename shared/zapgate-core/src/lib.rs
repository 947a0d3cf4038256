//! ZapGate Core
//!
//! Shared domain types, error taxonomy, configuration, and service
//! lifecycle used by the gateway services.

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use config::GatewayConfig;
pub use domain::{
    is_valid_cpf, CampaignStatus, ContactStatus, ConversationEventType, ConversationStatus,
    EventSource, MessageDirection, MessageStatus, PhoneNumber,
};
pub use error::{GatewayError, Result};
pub use service::{
    DependencyStatus, GatewayService, HealthStatus, ReadinessStatus, ServiceRuntime,
};
