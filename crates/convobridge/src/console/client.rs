//! HTTP implementation of [`ConsoleApi`] for a Chatwoot-style account API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    ConsoleApi, ConsoleConfig, ConsoleError, Contact, Conversation, Inbox, NewContact,
    OutgoingMessage, Priority, Result,
};

/// Header carrying the account access token.
const AUTH_HEADER: &str = "api_access_token";

/// Console client shared by every tenant.
///
/// Tenant coordinates travel with each call, so one connection pool serves
/// all accounts.
#[derive(Debug, Clone)]
pub struct HttpConsoleClient {
    http: Client,
}

impl HttpConsoleClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    fn url(config: &ConsoleConfig, path: &str) -> String {
        format!(
            "{}/api/v1/accounts/{}/{}",
            config.base_url.trim_end_matches('/'),
            config.account_id,
            path
        )
    }

    fn get(&self, config: &ConsoleConfig, path: &str) -> RequestBuilder {
        self.http
            .get(Self::url(config, path))
            .header(AUTH_HEADER, &config.auth_token)
    }

    fn post(&self, config: &ConsoleConfig, path: &str) -> RequestBuilder {
        self.http
            .post(Self::url(config, path))
            .header(AUTH_HEADER, &config.auth_token)
    }

    /// Parse a successful JSON response or convert an error response.
    async fn json_response<T: DeserializeOwned>(response: Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::parse_error(response).await);
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ConsoleError::UnexpectedResponse(e.to_string()))
    }

    async fn parse_error(response: Response) -> ConsoleError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        ConsoleError::Rejected {
            status,
            message: error_message(&text).unwrap_or_else(|| format!("HTTP {status}")),
        }
    }
}

#[async_trait]
impl ConsoleApi for HttpConsoleClient {
    async fn find_or_create_contact(
        &self,
        config: &ConsoleConfig,
        inbox_id: u64,
        contact: &NewContact,
    ) -> Result<Contact> {
        let response = self
            .get(config, "contacts/search")
            .query(&[("q", contact.identifier.as_str())])
            .send()
            .await?;
        let found: Payload<Vec<Contact>> = Self::json_response(response).await?;
        if let Some(existing) = pick_contact(found.payload, &contact.identifier) {
            return Ok(existing);
        }

        let body = json!({
            "inbox_id": inbox_id,
            "name": contact.name,
            "identifier": contact.identifier,
            "phone_number": phone_number(&contact.identifier),
        });
        let response = self.post(config, "contacts").json(&body).send().await?;
        let created: Payload<CreatedContact> = Self::json_response(response).await?;
        Ok(created.payload.contact)
    }

    async fn find_or_create_conversation(
        &self,
        config: &ConsoleConfig,
        inbox_id: u64,
        contact_id: u64,
    ) -> Result<Conversation> {
        let response = self
            .get(config, &format!("contacts/{contact_id}/conversations"))
            .send()
            .await?;
        let found: Payload<Vec<Conversation>> = Self::json_response(response).await?;
        if let Some(open) = found
            .payload
            .into_iter()
            .find(|c| c.inbox_id == inbox_id && !c.is_resolved())
        {
            return Ok(open);
        }

        let body = json!({
            "inbox_id": inbox_id,
            "contact_id": contact_id,
            "status": "open",
        });
        let response = self.post(config, "conversations").json(&body).send().await?;
        Self::json_response(response).await
    }

    async fn send_message(
        &self,
        config: &ConsoleConfig,
        conversation_id: u64,
        message: &OutgoingMessage,
    ) -> Result<u64> {
        let mut body = json!({
            "content": message.content,
            "message_type": message.message_type,
            "private": message.private,
        });
        if !message.attachments.is_empty() {
            body["attachments"] = json!(message.attachments);
        }

        let response = self
            .post(config, &format!("conversations/{conversation_id}/messages"))
            .json(&body)
            .send()
            .await?;
        let created: CreatedMessage = Self::json_response(response).await?;
        Ok(created.id)
    }

    async fn set_conversation_priority(
        &self,
        config: &ConsoleConfig,
        conversation_id: u64,
        priority: Priority,
    ) -> Result<()> {
        let response = self
            .post(
                config,
                &format!("conversations/{conversation_id}/toggle_priority"),
            )
            .json(&json!({ "priority": priority }))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::parse_error(response).await)
        }
    }

    async fn list_inboxes(&self, config: &ConsoleConfig) -> Result<Vec<Inbox>> {
        let response = self.get(config, "inboxes").send().await?;
        let inboxes: Payload<Vec<Inbox>> = Self::json_response(response).await?;
        Ok(inboxes.payload)
    }
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Deserialize)]
struct Payload<T> {
    payload: T,
}

#[derive(Deserialize)]
struct CreatedContact {
    contact: Contact,
}

#[derive(Deserialize)]
struct CreatedMessage {
    id: u64,
}

/// Search is fuzzy on the console side; only an exact match counts.
fn pick_contact(candidates: Vec<Contact>, identifier: &str) -> Option<Contact> {
    let phone = phone_number(identifier);
    candidates.into_iter().find(|c| {
        c.identifier.as_deref() == Some(identifier)
            || (phone.is_some() && c.phone_number == phone)
    })
}

/// E.164 form of a purely numeric transport address.
fn phone_number(identifier: &str) -> Option<String> {
    let digits = identifier.trim_start_matches('+');
    (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .then(|| format!("+{digits}"))
}

/// Extract a human-readable message from an error body.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "error", "errors"]
        .iter()
        .find_map(|field| match value.get(field)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .map(|i| i.as_str().map(str::to_string).unwrap_or_else(|| i.to_string()))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            _ => None,
        })
}
