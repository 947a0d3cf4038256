//! Idempotent schema bootstrap

use tracing::info;

use crate::{DbError, DbPool, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    business_id TEXT NOT NULL UNIQUE,
    access_token TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS numbers (
    id UUID PRIMARY KEY,
    account_id UUID NOT NULL REFERENCES accounts(id),
    phone_number TEXT NOT NULL UNIQUE,
    phone_number_id TEXT NOT NULL UNIQUE,
    display_name TEXT,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS templates (
    id UUID PRIMARY KEY,
    account_id UUID NOT NULL REFERENCES accounts(id),
    number_id UUID REFERENCES numbers(id),
    name TEXT NOT NULL,
    language TEXT NOT NULL DEFAULT 'pt_BR',
    category TEXT,
    variables JSONB NOT NULL DEFAULT '[]',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS operators (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT UNIQUE,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    max_concurrent INT NOT NULL DEFAULT 5,
    is_online BOOLEAN NOT NULL DEFAULT FALSE,
    last_seen_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS tabulations (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    requires_notes BOOLEAN NOT NULL DEFAULT FALSE,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS conversations (
    id UUID PRIMARY KEY,
    number_id UUID NOT NULL REFERENCES numbers(id),
    customer_phone TEXT NOT NULL,
    customer_name TEXT,
    status TEXT NOT NULL DEFAULT 'open',
    operator_id UUID REFERENCES operators(id),
    last_message_at TIMESTAMPTZ,
    last_agent_message_at TIMESTAMPTZ,
    last_customer_message_at TIMESTAMPTZ,
    manual_attempts_count INT NOT NULL DEFAULT 0,
    manual_attempts_window_start TIMESTAMPTZ,
    manual_blocked_until TIMESTAMPTZ,
    cpc_marked_at TIMESTAMPTZ,
    cpc_marked_by UUID,
    tabulation_id UUID REFERENCES tabulations(id),
    notes TEXT,
    closed_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- At most one OPEN conversation per (customer, number); concurrent
-- creates collide here and fall back to re-reading the winner's row.
CREATE UNIQUE INDEX IF NOT EXISTS conversations_open_unique
    ON conversations (customer_phone, number_id) WHERE status = 'open';
CREATE INDEX IF NOT EXISTS conversations_operator_open_idx
    ON conversations (operator_id) WHERE status = 'open';

CREATE TABLE IF NOT EXISTS messages (
    id UUID PRIMARY KEY,
    conversation_id UUID REFERENCES conversations(id),
    number_id UUID NOT NULL REFERENCES numbers(id),
    campaign_id UUID,
    direction TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    content JSONB NOT NULL,
    status TEXT NOT NULL DEFAULT 'sent',
    provider_message_id TEXT,
    wamid TEXT,
    error_code TEXT,
    error_message TEXT,
    message_timestamp TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS messages_provider_id_idx ON messages (provider_message_id);
CREATE INDEX IF NOT EXISTS messages_wamid_idx ON messages (wamid);
CREATE INDEX IF NOT EXISTS messages_conversation_idx ON messages (conversation_id);

CREATE TABLE IF NOT EXISTS conversation_events (
    id UUID PRIMARY KEY,
    conversation_id UUID,
    number_id UUID,
    customer_phone TEXT NOT NULL,
    source TEXT NOT NULL,
    direction TEXT,
    event_type TEXT NOT NULL,
    payload JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS conversation_events_phone_idx
    ON conversation_events (customer_phone, created_at);

CREATE TABLE IF NOT EXISTS campaigns (
    id UUID PRIMARY KEY,
    account_id UUID NOT NULL REFERENCES accounts(id),
    number_id UUID NOT NULL REFERENCES numbers(id),
    template_id UUID NOT NULL REFERENCES templates(id),
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    rate_limit INT NOT NULL DEFAULT 60,
    total_recipients INT NOT NULL DEFAULT 0,
    sent_count INT NOT NULL DEFAULT 0,
    delivered_count INT NOT NULL DEFAULT 0,
    read_count INT NOT NULL DEFAULT 0,
    failed_count INT NOT NULL DEFAULT 0,
    csv_path TEXT,
    started_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS campaign_contacts (
    id UUID PRIMARY KEY,
    campaign_id UUID NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    phone_number TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    last_attempt_at TIMESTAMPTZ,
    last_sent_at TIMESTAMPTZ,
    last_status_at TIMESTAMPTZ,
    failed_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (campaign_id, phone_number)
);

CREATE TABLE IF NOT EXISTS webhook_events (
    id UUID PRIMARY KEY,
    payload JSONB NOT NULL,
    processed BOOLEAN NOT NULL DEFAULT FALSE,
    received_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Create all tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &DbPool) -> Result<()> {
    let conn = pool.get().await?;
    conn.batch_execute(SCHEMA).await.map_err(DbError::Query)?;
    info!("Database schema ensured");
    Ok(())
}
