//! Campaign service
//!
//! Create, CSV upload + start, pause/resume, delete, and stats. The
//! dispatch worker lives in [`dispatch`]; recipient parsing in [`csv`].

pub mod csv;
pub mod dispatch;

use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use zapgate_core::{CampaignStatus, GatewayError, Result};

use crate::model::{Campaign, ContactCounts};
use crate::queue::JobQueue;
use crate::store::Store;

pub use dispatch::{CampaignDispatcher, CampaignSendJob, COMPLIANCE_WINDOW_HOURS};

/// Campaign creation input, already request-validated at the API edge.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub account_id: Uuid,
    pub number_id: Uuid,
    pub template_id: Uuid,
    pub name: String,
    pub rate_limit: i32,
}

#[derive(Debug, Serialize)]
pub struct CampaignStats {
    pub campaign: Campaign,
    pub contacts: ContactCounts,
}

pub struct CampaignService {
    store: Arc<dyn Store>,
    queue: JobQueue<CampaignSendJob>,
    upload_dir: PathBuf,
}

impl CampaignService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: JobQueue<CampaignSendJob>,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            queue,
            upload_dir: upload_dir.into(),
        }
    }

    /// Validate the account/number/template linkage and insert a PENDING
    /// campaign.
    pub async fn create(&self, new: NewCampaign) -> Result<Campaign> {
        let account = self
            .store
            .get_account(new.account_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("account".into()))?;
        if !account.is_active {
            return Err(GatewayError::Validation("account is inactive".into()));
        }

        let number = self
            .store
            .get_number(new.number_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("number".into()))?;
        if number.account_id != account.id {
            return Err(GatewayError::Validation(
                "number belongs to a different account".into(),
            ));
        }

        let template = self
            .store
            .get_template(new.template_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("template".into()))?;
        if template.account_id != account.id {
            return Err(GatewayError::Validation(
                "template belongs to a different account".into(),
            ));
        }
        if let Some(template_number) = template.number_id {
            if template_number != number.id {
                return Err(GatewayError::Validation(
                    "template is bound to a different number".into(),
                ));
            }
        }

        let campaign = Campaign {
            id: Uuid::new_v4(),
            account_id: account.id,
            number_id: number.id,
            template_id: template.id,
            name: new.name,
            status: CampaignStatus::Pending,
            rate_limit: new.rate_limit,
            total_recipients: 0,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            failed_count: 0,
            csv_path: None,
            started_at: None,
            created_at: Utc::now(),
        };
        self.store.insert_campaign(&campaign).await?;
        info!(campaign = %campaign.id, name = %campaign.name, "Campaign created");
        Ok(campaign)
    }

    /// Parse the recipient list, upsert contacts, enqueue one paced send
    /// job per valid recipient, and move the campaign to PROCESSING. Any
    /// parse or enqueue error fails the campaign.
    pub async fn upload_csv(&self, id: Uuid, data: &[u8]) -> Result<Campaign> {
        let campaign = self
            .store
            .get_campaign(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("campaign".into()))?;
        if campaign.status != CampaignStatus::Pending {
            return Err(GatewayError::Conflict(format!(
                "campaign is {}, expected pending",
                campaign.status.as_str()
            )));
        }

        let template = self
            .store
            .get_template(campaign.template_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("template".into()))?;

        let parsed = match csv::parse_recipients(data, &template.variables) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fail_campaign(id).await;
                return Err(e);
            }
        };
        if parsed.skipped > 0 {
            warn!(
                campaign = %id,
                skipped = parsed.skipped,
                "Recipient rows skipped during CSV ingestion"
            );
        }

        let csv_path = self.upload_dir.join(format!("{}.csv", id));
        if let Err(e) = self.persist_upload(&csv_path, data).await {
            self.fail_campaign(id).await;
            return Err(e);
        }

        let mut jobs = Vec::with_capacity(parsed.recipients.len());
        for (index, recipient) in parsed.recipients.iter().enumerate() {
            let contact = match self
                .store
                .upsert_campaign_contact(id, &recipient.phone)
                .await
            {
                Ok(contact) => contact,
                Err(e) => {
                    self.fail_campaign(id).await;
                    return Err(e);
                }
            };
            jobs.push((
                CampaignSendJob {
                    campaign_id: id,
                    contact_id: contact.id,
                    phone: recipient.phone.clone(),
                    params: recipient.params.clone(),
                },
                csv::pacing_delay(index, campaign.rate_limit as u32),
            ));
        }

        let total = jobs.len() as i32;
        self.queue.enqueue_bulk(jobs);
        self.store
            .set_campaign_started(id, total, &csv_path.to_string_lossy(), Utc::now())
            .await?;

        info!(campaign = %id, recipients = total, skipped = parsed.skipped, "Campaign started");
        self.store
            .get_campaign(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("campaign".into()))
    }

    pub async fn pause(&self, id: Uuid) -> Result<()> {
        let applied = self
            .store
            .update_campaign_status(id, &[CampaignStatus::Processing], CampaignStatus::Paused)
            .await?;
        if applied {
            info!(campaign = %id, "Campaign paused");
            return Ok(());
        }
        self.transition_conflict(id, "only processing campaigns can be paused")
            .await
    }

    pub async fn resume(&self, id: Uuid) -> Result<()> {
        let applied = self
            .store
            .update_campaign_status(id, &[CampaignStatus::Paused], CampaignStatus::Processing)
            .await?;
        if applied {
            info!(campaign = %id, "Campaign resumed");
            return Ok(());
        }
        self.transition_conflict(id, "only paused campaigns can be resumed")
            .await
    }

    /// Cancel queued jobs, delete the stored upload, and drop the row.
    /// In-flight sends are not interrupted.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let campaign = self
            .store
            .get_campaign(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("campaign".into()))?;

        let removed = self.queue.remove_pending(|job| job.campaign_id == id);
        info!(campaign = %id, removed_jobs = removed, "Campaign jobs cancelled");

        if let Some(path) = &campaign.csv_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(error = %e, path = %path, "Could not delete campaign upload");
            }
        }

        self.store.delete_campaign(id).await
    }

    pub async fn list(&self) -> Result<Vec<Campaign>> {
        self.store.list_campaigns().await
    }

    pub async fn stats(&self, id: Uuid) -> Result<CampaignStats> {
        let campaign = self
            .store
            .get_campaign(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("campaign".into()))?;
        let contacts = self.store.contact_counts(id).await?;
        Ok(CampaignStats { campaign, contacts })
    }

    async fn persist_upload(&self, path: &PathBuf, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| GatewayError::Internal(format!("upload dir: {}", e)))?;
        tokio::fs::write(path, data)
            .await
            .map_err(|e| GatewayError::Internal(format!("upload write: {}", e)))
    }

    async fn fail_campaign(&self, id: Uuid) {
        let any_state = [
            CampaignStatus::Pending,
            CampaignStatus::Processing,
            CampaignStatus::Paused,
        ];
        if let Err(e) = self
            .store
            .update_campaign_status(id, &any_state, CampaignStatus::Failed)
            .await
        {
            warn!(error = %e, campaign = %id, "Could not mark campaign failed");
        }
    }

    async fn transition_conflict(&self, id: Uuid, reason: &str) -> Result<()> {
        match self.store.get_campaign(id).await? {
            None => Err(GatewayError::NotFound("campaign".into())),
            Some(_) => Err(GatewayError::Conflict(reason.into())),
        }
    }
}
