//! [`SessionRegistry`] backed by a transport sidecar's HTTP API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::ready;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use convobridge_transport_protocol::{
    CreateSessionRequest, OutboundText, SendReceipt, SessionState, TransportEvent,
};

use super::sse::{SseFrame, SseStream};
use super::{EventStream, Result, SessionRegistry, TransportError, TransportSession};

/// Registry of sessions hosted by one sidecar.
#[derive(Debug, Clone)]
pub struct SidecarRegistry {
    base_url: String,
    http: Client,
    /// Event feeds are long-lived, so they use a client without a request timeout.
    stream_http: Client,
}

impl SidecarRegistry {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::builder().timeout(request_timeout).build()?,
            stream_http: Client::builder().build()?,
        })
    }

    fn session_handle(&self, tenant_id: &str) -> SidecarSession {
        SidecarSession {
            tenant_id: tenant_id.to_string(),
            url: format!("{}/sessions/{}", self.base_url, tenant_id),
            http: self.http.clone(),
            stream_http: self.stream_http.clone(),
        }
    }
}

#[async_trait]
impl SessionRegistry for SidecarRegistry {
    async fn get_session(&self, tenant_id: &str) -> Result<Option<Arc<dyn TransportSession>>> {
        let url = format!("{}/sessions/{}", self.base_url, tenant_id);
        let response = self.http.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let _: SessionState = json_response(response).await?;
        Ok(Some(Arc::new(self.session_handle(tenant_id))))
    }

    async fn create_session(&self, request: &CreateSessionRequest) -> Result<()> {
        let url = format!("{}/sessions", self.base_url);
        let response = self.http.post(&url).json(request).send().await?;
        expect_success(response).await
    }
}

// ============================================================================
// SidecarSession
// ============================================================================

struct SidecarSession {
    tenant_id: String,
    url: String,
    http: Client,
    stream_http: Client,
}

impl SidecarSession {
    async fn command(&self, action: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/{}", self.url, action))
            .send()
            .await?;
        expect_success(response).await
    }
}

#[async_trait]
impl TransportSession for SidecarSession {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    async fn state(&self) -> Result<SessionState> {
        let response = self.http.get(&self.url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(TransportError::NoSession(self.tenant_id.clone()));
        }
        json_response(response).await
    }

    async fn connect(&self) -> Result<()> {
        self.command("connect").await
    }

    async fn disconnect(&self) -> Result<()> {
        self.command("disconnect").await
    }

    async fn logout(&self) -> Result<()> {
        self.command("logout").await
    }

    async fn send_text(&self, message: &OutboundText) -> Result<SendReceipt> {
        let response = self
            .http
            .post(format!("{}/messages", self.url))
            .json(message)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(TransportError::NotConnected);
        }
        json_response(response).await
    }

    async fn upload(&self, file_name: &str, mime_type: &str, data: Vec<u8>) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/media", self.url))
            .query(&[("file_name", file_name)])
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(data)
            .send()
            .await?;
        let uploaded: Uploaded = json_response(response).await?;
        Ok(uploaded.media_id)
    }

    async fn events(&self) -> Result<EventStream> {
        let response = self
            .stream_http
            .get(format!("{}/events", self.url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let tenant = self.tenant_id.clone();
        let feed_tenant = tenant.clone();
        let events = SseStream::new(Box::pin(response.bytes_stream()))
            .take_while(move |frame| {
                if let Err(e) = frame {
                    warn!(tenant = %feed_tenant, error = %e, "Session event feed broke");
                }
                ready(frame.is_ok())
            })
            .filter_map(move |frame| ready(frame.ok().and_then(|f| decode_event(&tenant, f))));
        Ok(events.boxed())
    }
}

#[derive(Deserialize)]
struct Uploaded {
    media_id: String,
}

fn decode_event(tenant: &str, frame: SseFrame) -> Option<TransportEvent> {
    match serde_json::from_str(&frame.data) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(tenant = %tenant, error = %e, "Ignoring undecodable session event");
            None
        }
    }
}

async fn json_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(rejected(response).await);
    }
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

async fn expect_success(response: Response) -> Result<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(rejected(response).await)
    }
}

async fn rejected(response: Response) -> TransportError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .ok()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("HTTP {status}"));
    TransportError::Rejected { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_trims_base_url() {
        let registry =
            SidecarRegistry::new("http://127.0.0.1:4000/", Duration::from_secs(5)).unwrap();
        let session = registry.session_handle("acme");
        assert_eq!(session.url, "http://127.0.0.1:4000/sessions/acme");
        assert_eq!(session.tenant_id(), "acme");
    }

    #[test]
    fn decode_event_skips_garbage() {
        let ok = decode_event(
            "acme",
            SseFrame {
                event: None,
                data: r#"{"code":"XY"}"#.to_string(),
            },
        );
        assert_eq!(ok, Some(TransportEvent::challenge("XY")));

        let bad = decode_event(
            "acme",
            SseFrame {
                event: None,
                data: "not json".to_string(),
            },
        );
        assert!(bad.is_none());
    }
}
