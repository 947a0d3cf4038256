//! WhatsApp Cloud API client

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use zapgate_core::{GatewayError, Result};

use crate::model::{Number, Template};

/// Provider-assigned id of an accepted outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessageId(pub String);

/// Outbound send surface, behind a trait so the dispatcher and the manual
/// send path can run against a test double.
#[async_trait]
pub trait WhatsAppApi: Send + Sync + 'static {
    async fn send_text(
        &self,
        number: &Number,
        access_token: &str,
        to: &str,
        body: &str,
        preview_url: bool,
    ) -> Result<ProviderMessageId>;

    async fn send_template(
        &self,
        number: &Number,
        access_token: &str,
        to: &str,
        template: &Template,
        params: &[String],
    ) -> Result<ProviderMessageId>;
}

/// Graph API client
pub struct GraphApiClient {
    http_client: reqwest::Client,
    base_url: String,
    api_version: String,
}

impl GraphApiClient {
    pub fn new(base_url: &str, api_version: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
        })
    }

    fn messages_url(&self, number: &Number) -> String {
        format!(
            "{}/{}/{}/messages",
            self.base_url, self.api_version, number.phone_number_id
        )
    }

    async fn post_message(
        &self,
        number: &Number,
        access_token: &str,
        payload: serde_json::Value,
    ) -> Result<ProviderMessageId> {
        let response = self
            .http_client
            .post(self.messages_url(number))
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(e.to_string())
                } else {
                    GatewayError::Network(e.to_string())
                }
            })?;

        if response.status().is_success() {
            let result: serde_json::Value = response
                .json()
                .await
                .map_err(|e| GatewayError::Provider(format!("response parse: {}", e)))?;

            let message_id = result["messages"][0]["id"]
                .as_str()
                .ok_or_else(|| GatewayError::Provider("response missing message id".into()))?
                .to_string();

            Ok(ProviderMessageId(message_id))
        } else {
            let error_text = response.text().await.unwrap_or_default();
            Err(GatewayError::Provider(error_text))
        }
    }
}

#[async_trait]
impl WhatsAppApi for GraphApiClient {
    async fn send_text(
        &self,
        number: &Number,
        access_token: &str,
        to: &str,
        body: &str,
        preview_url: bool,
    ) -> Result<ProviderMessageId> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "body": body, "preview_url": preview_url },
        });
        self.post_message(number, access_token, payload).await
    }

    async fn send_template(
        &self,
        number: &Number,
        access_token: &str,
        to: &str,
        template: &Template,
        params: &[String],
    ) -> Result<ProviderMessageId> {
        let mut template_payload = json!({
            "name": template.name,
            "language": { "code": template.language },
        });
        if !params.is_empty() {
            template_payload["components"] = json!([{
                "type": "body",
                "parameters": params.iter().map(|p| json!({
                    "type": "text",
                    "text": p,
                })).collect::<Vec<_>>(),
            }]);
        }

        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "template",
            "template": template_payload,
        });
        self.post_message(number, access_token, payload).await
    }
}
