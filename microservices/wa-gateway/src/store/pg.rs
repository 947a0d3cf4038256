//! PostgreSQL-backed store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use zapgate_core::{
    CampaignStatus, ContactStatus, ConversationStatus, GatewayError, MessageStatus, Result,
};
use zapgate_db::DbPool;

use crate::model::{
    Account, Campaign, CampaignContact, Conversation, ContactCounts, Message, Number, Operator,
    OperatorLoad, Tabulation, Template,
};

use super::{EventRecord, Store};

fn db_err<E: std::fmt::Display>(e: E) -> GatewayError {
    GatewayError::Database(e.to_string())
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn is_healthy(&self) -> bool {
        self.pool.is_healthy().await
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object> {
        self.pool.get().await.map_err(db_err)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_webhook_event(&self, payload: &serde_json::Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.conn()
            .await?
            .execute(
                "INSERT INTO webhook_events (id, payload) VALUES ($1, $2)",
                &[&id, payload],
            )
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    async fn mark_webhook_processed(&self, id: Uuid) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE webhook_events SET processed = TRUE WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        let row = self
            .conn()
            .await?
            .query_opt("SELECT * FROM accounts WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| Account::from_row(&r)))
    }

    async fn get_number(&self, id: Uuid) -> Result<Option<Number>> {
        let row = self
            .conn()
            .await?
            .query_opt("SELECT * FROM numbers WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| Number::from_row(&r)))
    }

    async fn find_number_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Number>> {
        let row = self
            .conn()
            .await?
            .query_opt(
                "SELECT * FROM numbers WHERE phone_number_id = $1",
                &[&phone_number_id],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| Number::from_row(&r)))
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        let row = self
            .conn()
            .await?
            .query_opt("SELECT * FROM templates WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        row.map(|r| Template::from_row(&r)).transpose()
    }

    async fn get_operator(&self, id: Uuid) -> Result<Option<Operator>> {
        let row = self
            .conn()
            .await?
            .query_opt("SELECT * FROM operators WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| Operator::from_row(&r)))
    }

    async fn get_tabulation(&self, id: Uuid) -> Result<Option<Tabulation>> {
        let row = self
            .conn()
            .await?
            .query_opt("SELECT * FROM tabulations WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| Tabulation::from_row(&r)))
    }

    async fn list_operator_loads(&self) -> Result<Vec<OperatorLoad>> {
        let rows = self
            .conn()
            .await?
            .query(
                "SELECT o.id, o.name, o.email, o.is_active, o.max_concurrent,
                        o.is_online, o.last_seen_at,
                        count(c.id) AS open_count
                 FROM operators o
                 LEFT JOIN conversations c
                   ON c.operator_id = o.id AND c.status = 'open'
                 WHERE o.is_active = TRUE
                 GROUP BY o.id, o.name, o.email, o.is_active, o.max_concurrent,
                          o.is_online, o.last_seen_at
                 ORDER BY open_count ASC, o.id ASC",
                &[],
            )
            .await
            .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|r| OperatorLoad {
                operator: Operator::from_row(r),
                open_count: r.get("open_count"),
            })
            .collect())
    }

    async fn set_operator_presence(
        &self,
        id: Uuid,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE operators SET is_online = $2, last_seen_at = $3 WHERE id = $1",
                &[&id, &online, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .await?
            .query_opt("SELECT * FROM conversations WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        row.map(|r| Conversation::from_row(&r)).transpose()
    }

    async fn find_open_conversation(
        &self,
        customer_phone: &str,
        number_id: Uuid,
    ) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .await?
            .query_opt(
                "SELECT * FROM conversations
                 WHERE customer_phone = $1 AND number_id = $2 AND status = 'open'",
                &[&customer_phone, &number_id],
            )
            .await
            .map_err(db_err)?;
        row.map(|r| Conversation::from_row(&r)).transpose()
    }

    async fn create_open_conversation(
        &self,
        number_id: Uuid,
        customer_phone: &str,
        customer_name: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        let inserted = conn
            .execute(
                "INSERT INTO conversations
                     (id, number_id, customer_phone, customer_name, status,
                      last_message_at, last_customer_message_at, created_at)
                 VALUES ($1, $2, $3, $4, 'open', $5, $5, $5)
                 ON CONFLICT (customer_phone, number_id) WHERE status = 'open'
                 DO NOTHING",
                &[&id, &number_id, &customer_phone, &customer_name, &timestamp],
            )
            .await
            .map_err(db_err)?;

        if inserted == 1 {
            let row = conn
                .query_one("SELECT * FROM conversations WHERE id = $1", &[&id])
                .await
                .map_err(db_err)?;
            return Ok((Conversation::from_row(&row)?, true));
        }

        // Lost the race; another worker created it between lookup and insert.
        let row = conn
            .query_one(
                "SELECT * FROM conversations
                 WHERE customer_phone = $1 AND number_id = $2 AND status = 'open'",
                &[&customer_phone, &number_id],
            )
            .await
            .map_err(db_err)?;
        Ok((Conversation::from_row(&row)?, false))
    }

    async fn assign_if_under_capacity(
        &self,
        conversation_id: Uuid,
        operator_id: Uuid,
        max_concurrent: i32,
    ) -> Result<bool> {
        let updated = self
            .conn()
            .await?
            .execute(
                "UPDATE conversations SET operator_id = $2
                 WHERE id = $1 AND status = 'open'
                   AND (SELECT count(*) FROM conversations
                        WHERE operator_id = $2 AND status = 'open')
                       < $3::bigint",
                &[&conversation_id, &operator_id, &(max_concurrent as i64)],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn touch_conversation_inbound(&self, id: Uuid, timestamp: DateTime<Utc>) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE conversations
                 SET last_message_at = $2, last_customer_message_at = $2
                 WHERE id = $1",
                &[&id, &timestamp],
            )
            .await
            .map_err(db_err)?;
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
        self.conn()
            .await?
            .execute(
                "UPDATE conversations
                 SET manual_attempts_count = $2,
                     manual_attempts_window_start = $3,
                     manual_blocked_until = $4,
                     last_agent_message_at = $5,
                     last_message_at = $5
                 WHERE id = $1",
                &[&id, &attempts_count, &window_start, &blocked_until, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn close_conversation(
        &self,
        id: Uuid,
        tabulation_id: Uuid,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE conversations
                 SET status = 'closed', tabulation_id = $2, notes = COALESCE($3, notes),
                     closed_at = $4
                 WHERE id = $1",
                &[&id, &tabulation_id, &notes, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_cpc(
        &self,
        id: Uuid,
        value: bool,
        operator_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn().await?;
        if value {
            conn.execute(
                "UPDATE conversations SET cpc_marked_at = $2, cpc_marked_by = $3 WHERE id = $1",
                &[&id, &now, &operator_id],
            )
            .await
            .map_err(db_err)?;
        } else {
            conn.execute(
                "UPDATE conversations SET cpc_marked_at = NULL, cpc_marked_by = NULL WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn list_conversations(
        &self,
        operator_id: Option<Uuid>,
        status: Option<ConversationStatus>,
    ) -> Result<Vec<Conversation>> {
        let status = status.map(|s| s.as_str());
        let rows = self
            .conn()
            .await?
            .query(
                "SELECT * FROM conversations
                 WHERE ($1::uuid IS NULL OR operator_id = $1)
                   AND ($2::text IS NULL OR status = $2)
                 ORDER BY last_message_at DESC NULLS LAST",
                &[&operator_id, &status],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(Conversation::from_row).collect()
    }

    async fn find_message_by_provider_id(&self, reference: &str) -> Result<Option<Message>> {
        let row = self
            .conn()
            .await?
            .query_opt(
                "SELECT * FROM messages
                 WHERE provider_message_id = $1 OR wamid = $1
                 LIMIT 1",
                &[&reference],
            )
            .await
            .map_err(db_err)?;
        row.map(|r| Message::from_row(&r)).transpose()
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "INSERT INTO messages
                     (id, conversation_id, number_id, campaign_id, direction, message_type,
                      content, status, provider_message_id, wamid, error_code, error_message,
                      message_timestamp)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                &[
                    &message.id,
                    &message.conversation_id,
                    &message.number_id,
                    &message.campaign_id,
                    &message.direction.as_str(),
                    &message.message_type,
                    &message.content,
                    &message.status.as_str(),
                    &message.provider_message_id,
                    &message.wamid,
                    &message.error_code,
                    &message.error_message,
                    &message.message_timestamp,
                ],
            )
            .await
            .map_err(db_err)?;
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
        let updated = self
            .conn()
            .await?
            .execute(
                "UPDATE messages
                 SET status = $3,
                     error_code = COALESCE($4, error_code),
                     error_message = COALESCE($5, error_message)
                 WHERE id = $1 AND status = $2",
                &[
                    &id,
                    &expected.as_str(),
                    &status.as_str(),
                    &error_code,
                    &error_message,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn append_event(&self, event: &EventRecord) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "INSERT INTO conversation_events
                     (id, conversation_id, number_id, customer_phone, source, direction,
                      event_type, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &Uuid::new_v4(),
                    &event.conversation_id,
                    &event.number_id,
                    &event.customer_phone,
                    &event.source.as_str(),
                    &event.direction.map(|d| d.as_str()),
                    &event.event_type.as_str(),
                    &event.payload,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn has_campaign_event_since(&self, phone: &str, since: DateTime<Utc>) -> Result<bool> {
        let row = self
            .conn()
            .await?
            .query_one(
                "SELECT EXISTS(
                     SELECT 1 FROM conversation_events
                     WHERE customer_phone = $1 AND source = 'campaign' AND created_at > $2
                 )",
                &[&phone, &since],
            )
            .await
            .map_err(db_err)?;
        Ok(row.get(0))
    }

    async fn has_cpc_mark_since(&self, phone: &str, since: DateTime<Utc>) -> Result<bool> {
        let row = self
            .conn()
            .await?
            .query_one(
                "SELECT EXISTS(
                     SELECT 1 FROM conversation_events
                     WHERE customer_phone = $1 AND event_type = 'cpc_marked' AND created_at > $2
                 )",
                &[&phone, &since],
            )
            .await
            .map_err(db_err)?;
        Ok(row.get(0))
    }

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "INSERT INTO campaigns
                     (id, account_id, number_id, template_id, name, status, rate_limit,
                      created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &campaign.id,
                    &campaign.account_id,
                    &campaign.number_id,
                    &campaign.template_id,
                    &campaign.name,
                    &campaign.status.as_str(),
                    &campaign.rate_limit,
                    &campaign.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>> {
        let row = self
            .conn()
            .await?
            .query_opt("SELECT * FROM campaigns WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        row.map(|r| Campaign::from_row(&r)).transpose()
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let rows = self
            .conn()
            .await?
            .query("SELECT * FROM campaigns ORDER BY created_at DESC", &[])
            .await
            .map_err(db_err)?;
        rows.iter().map(Campaign::from_row).collect()
    }

    async fn delete_campaign(&self, id: Uuid) -> Result<()> {
        self.conn()
            .await?
            .execute("DELETE FROM campaigns WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_campaign_status(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let updated = self
            .conn()
            .await?
            .execute(
                "UPDATE campaigns SET status = $3 WHERE id = $1 AND status = ANY($2)",
                &[&id, &from, &to.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn set_campaign_started(
        &self,
        id: Uuid,
        total_recipients: i32,
        csv_path: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE campaigns
                 SET status = 'processing', total_recipients = $2, csv_path = $3,
                     started_at = $4
                 WHERE id = $1",
                &[&id, &total_recipients, &csv_path, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_campaign_sent(&self, id: Uuid) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE campaigns SET sent_count = sent_count + 1 WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_campaign_failed(&self, id: Uuid) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE campaigns SET failed_count = failed_count + 1 WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_campaign_delivered(&self, id: Uuid) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE campaigns SET delivered_count = delivered_count + 1 WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_campaign_read(&self, id: Uuid) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE campaigns SET read_count = read_count + 1 WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn reconcile_campaign_failure(&self, id: Uuid) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "UPDATE campaigns
                 SET failed_count = failed_count + 1,
                     sent_count = GREATEST(sent_count - 1, 0)
                 WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_campaign_contact(
        &self,
        campaign_id: Uuid,
        phone_number: &str,
    ) -> Result<CampaignContact> {
        let row = self
            .conn()
            .await?
            .query_one(
                "INSERT INTO campaign_contacts (id, campaign_id, phone_number)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (campaign_id, phone_number)
                 DO UPDATE SET phone_number = EXCLUDED.phone_number
                 RETURNING *",
                &[&Uuid::new_v4(), &campaign_id, &phone_number],
            )
            .await
            .map_err(db_err)?;
        CampaignContact::from_row(&row)
    }

    async fn mark_contact(
        &self,
        id: Uuid,
        status: ContactStatus,
        failed_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn().await?;
        match status {
            ContactStatus::Sent => {
                conn.execute(
                    "UPDATE campaign_contacts
                     SET status = 'sent', last_attempt_at = $2, last_sent_at = $2,
                         failed_reason = NULL
                     WHERE id = $1",
                    &[&id, &now],
                )
                .await
                .map_err(db_err)?;
            }
            ContactStatus::Failed => {
                conn.execute(
                    "UPDATE campaign_contacts
                     SET status = 'failed', last_attempt_at = $2, failed_reason = $3
                     WHERE id = $1",
                    &[&id, &now, &failed_reason],
                )
                .await
                .map_err(db_err)?;
            }
            ContactStatus::Skipped24h => {
                conn.execute(
                    "UPDATE campaign_contacts
                     SET status = 'skipped_24h', last_attempt_at = $2
                     WHERE id = $1",
                    &[&id, &now],
                )
                .await
                .map_err(db_err)?;
            }
            ContactStatus::Pending => {
                conn.execute(
                    "UPDATE campaign_contacts SET status = 'pending' WHERE id = $1",
                    &[&id],
                )
                .await
                .map_err(db_err)?;
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
        self.conn()
            .await?
            .execute(
                "UPDATE campaign_contacts SET last_status_at = $3
                 WHERE campaign_id = $1 AND phone_number = $2",
                &[&campaign_id, &phone_number, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn contact_counts(&self, campaign_id: Uuid) -> Result<ContactCounts> {
        let rows = self
            .conn()
            .await?
            .query(
                "SELECT status, count(*) AS total FROM campaign_contacts
                 WHERE campaign_id = $1 GROUP BY status",
                &[&campaign_id],
            )
            .await
            .map_err(db_err)?;

        let mut counts = ContactCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let total: i64 = row.get("total");
            match status.as_str() {
                "pending" => counts.pending = total,
                "sent" => counts.sent = total,
                "failed" => counts.failed = total,
                "skipped_24h" => counts.skipped_24h = total,
                _ => {}
            }
        }
        Ok(counts)
    }
}
