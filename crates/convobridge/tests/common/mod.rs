//! Common test utilities: recording console, scriptable transport and a
//! bridge wired to both.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::connect_info::MockConnectInfo;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use convobridge::bridge::Bridge;
use convobridge::cache::Caches;
use convobridge::config::{CacheConfig, Timings};
use convobridge::console::{
    Attachment, ConsoleApi, ConsoleConfig, ConsoleError, Contact, Conversation, Inbox, MessageType, NewContact,
    OutgoingMessage, Priority,
};
use convobridge::server::{self, AppState};
use convobridge::tenant::{MemoryTenantStore, TenantRecord};
use convobridge::transport::{
    EventStream, Result as TransportResult, SessionRegistry, TransportError, TransportSession,
};
use convobridge_transport_protocol::{
    CreateSessionRequest, OutboundText, SendReceipt, SessionEventKind, SessionState,
    TransportEvent,
};

pub const TENANT: &str = "acme";
pub const TENANT_IDENTITY: &str = "5511999990000";
pub const INBOX_ID: u64 = 1;

// ============================================================================
// Recording console
// ============================================================================

#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub conversation_id: u64,
    pub content: String,
    pub message_type: MessageType,
    pub private: bool,
    pub attachments: Vec<Attachment>,
}

/// In-memory console that records every call.
#[derive(Default)]
pub struct FakeConsole {
    next_id: AtomicU64,
    contacts: Mutex<HashMap<String, u64>>,
    conversations: Mutex<HashMap<u64, u64>>,
    messages: Mutex<Vec<PostedMessage>>,
    priorities: Mutex<Vec<(u64, Priority)>>,
    contact_creates: AtomicU32,
    conversation_creates: AtomicU32,
    fail_sends: AtomicBool,
    send_latency_ms: AtomicU64,
}

impl FakeConsole {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(100),
            ..Default::default()
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<PostedMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Private notes whose text contains `needle`.
    pub fn notes_containing(&self, needle: &str) -> Vec<PostedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.private && m.content.contains(needle))
            .collect()
    }

    pub fn count_notes(&self, needle: &str) -> usize {
        self.notes_containing(needle).len()
    }

    pub fn incoming(&self) -> Vec<PostedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.message_type == MessageType::Incoming)
            .collect()
    }

    pub fn priorities(&self) -> Vec<(u64, Priority)> {
        self.priorities.lock().unwrap().clone()
    }

    pub fn contact_creates(&self) -> u32 {
        self.contact_creates.load(Ordering::SeqCst)
    }

    pub fn conversation_creates(&self) -> u32 {
        self.conversation_creates.load(Ordering::SeqCst)
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every `send_message` take `latency`.
    pub fn set_send_latency(&self, latency: Duration) {
        self.send_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn has_contact(&self, identifier: &str) -> bool {
        self.contacts.lock().unwrap().contains_key(identifier)
    }
}

#[async_trait]
impl ConsoleApi for FakeConsole {
    async fn find_or_create_contact(
        &self,
        _config: &ConsoleConfig,
        _inbox_id: u64,
        contact: &NewContact,
    ) -> convobridge::console::Result<Contact> {
        // Yield so concurrent resolutions interleave like real HTTP calls.
        tokio::task::yield_now().await;
        let mut contacts = self.contacts.lock().unwrap();
        let id = match contacts.get(&contact.identifier) {
            Some(id) => *id,
            None => {
                self.contact_creates.fetch_add(1, Ordering::SeqCst);
                let id = self.next_id();
                contacts.insert(contact.identifier.clone(), id);
                id
            }
        };
        Ok(Contact {
            id,
            name: Some(contact.name.clone()),
            identifier: Some(contact.identifier.clone()),
            phone_number: None,
        })
    }

    async fn find_or_create_conversation(
        &self,
        _config: &ConsoleConfig,
        inbox_id: u64,
        contact_id: u64,
    ) -> convobridge::console::Result<Conversation> {
        tokio::task::yield_now().await;
        let mut conversations = self.conversations.lock().unwrap();
        let id = match conversations.get(&contact_id) {
            Some(id) => *id,
            None => {
                self.conversation_creates.fetch_add(1, Ordering::SeqCst);
                let id = self.next_id();
                conversations.insert(contact_id, id);
                id
            }
        };
        Ok(Conversation {
            id,
            inbox_id,
            status: Some("open".to_string()),
        })
    }

    async fn send_message(
        &self,
        _config: &ConsoleConfig,
        conversation_id: u64,
        message: &OutgoingMessage,
    ) -> convobridge::console::Result<u64> {
        let latency = self.send_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ConsoleError::Rejected {
                status: 503,
                message: "console unavailable".to_string(),
            });
        }
        self.messages.lock().unwrap().push(PostedMessage {
            conversation_id,
            content: message.content.clone(),
            message_type: message.message_type,
            private: message.private,
            attachments: message.attachments.clone(),
        });
        Ok(self.next_id())
    }

    async fn set_conversation_priority(
        &self,
        _config: &ConsoleConfig,
        conversation_id: u64,
        priority: Priority,
    ) -> convobridge::console::Result<()> {
        self.priorities
            .lock()
            .unwrap()
            .push((conversation_id, priority));
        Ok(())
    }

    async fn list_inboxes(&self, _config: &ConsoleConfig) -> convobridge::console::Result<Vec<Inbox>> {
        Ok(vec![Inbox {
            id: INBOX_ID,
            name: "WhatsApp".to_string(),
        }])
    }
}

// ============================================================================
// Scriptable transport
// ============================================================================

/// A transport session whose state the test controls.
///
/// Only connecting an unpaired session issues a challenge, optionally after
/// a delay. Subscribers see events emitted after they subscribed.
pub struct FakeSession {
    tenant_id: String,
    connected: AtomicBool,
    logged_in: AtomicBool,
    challenges: Arc<AtomicU32>,
    challenge_delay_ms: AtomicU64,
    renders_qr: AtomicBool,
    fail_state: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    sent: Mutex<Vec<OutboundText>>,
    connects: AtomicU32,
    disconnects: AtomicU32,
    logouts: AtomicU32,
}

impl FakeSession {
    pub fn new(tenant_id: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            tenant_id: tenant_id.to_string(),
            connected: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            challenges: Arc::new(AtomicU32::new(0)),
            challenge_delay_ms: AtomicU64::new(0),
            renders_qr: AtomicBool::new(false),
            fail_state: AtomicBool::new(false),
            events,
            sent: Mutex::new(Vec::new()),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            logouts: AtomicU32::new(0),
        })
    }

    /// A connected, authenticated session.
    pub fn healthy(tenant_id: &str) -> Arc<Self> {
        let session = Self::new(tenant_id);
        session.connected.store(true, Ordering::SeqCst);
        session.logged_in.store(true, Ordering::SeqCst);
        session
    }

    fn emit_challenge(&self) {
        let challenges = Arc::clone(&self.challenges);
        let events = self.events.clone();
        let renders_qr = self.renders_qr.load(Ordering::SeqCst);
        let issue = move || {
            let n = challenges.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = events.send(TransportEvent::Challenge {
                code: format!("CODE-{n}"),
                qr_ascii: renders_qr.then(|| format!("QR-ASCII-{n}")),
                qr_image: renders_qr.then(|| format!("data:image/png;base64,QR{n}")),
            });
        };

        let delay = self.challenge_delay_ms.load(Ordering::SeqCst);
        if delay == 0 {
            issue();
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                issue();
            });
        }
    }

    /// Issue challenges `delay` after connecting.
    pub fn set_challenge_delay(&self, delay: Duration) {
        self.challenge_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Attach QR renderings to issued challenges.
    pub fn set_renders_qr(&self, renders: bool) {
        self.renders_qr.store(renders, Ordering::SeqCst);
    }

    /// Make `state` fail as an unreachable sidecar would.
    pub fn set_fail_state(&self, fail: bool) {
        self.fail_state.store(fail, Ordering::SeqCst);
    }

    /// The device approved the pending challenge.
    pub fn approve(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.logged_in.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Status {
            event: SessionEventKind::Success,
            reason: None,
        });
    }

    pub fn emit_timeout(&self) {
        let _ = self.events.send(TransportEvent::Status {
            event: SessionEventKind::Timeout,
            reason: None,
        });
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }

    pub fn challenges_issued(&self) -> u32 {
        self.challenges.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundText> {
        self.sent.lock().unwrap().clone()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> u32 {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    async fn state(&self) -> TransportResult<SessionState> {
        if self.fail_state.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                status: 502,
                message: "sidecar unreachable".to_string(),
            });
        }
        Ok(SessionState {
            tenant_id: self.tenant_id.clone(),
            connected: self.connected.load(Ordering::SeqCst),
            logged_in: self.logged_in.load(Ordering::SeqCst),
            identity: None,
            connected_since: None,
        })
    }

    async fn connect(&self) -> TransportResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        if !self.logged_in.load(Ordering::SeqCst) {
            self.emit_challenge();
        }
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> TransportResult<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        self.logged_in.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, message: &OutboundText) -> TransportResult<SendReceipt> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(SendReceipt {
            message_id: format!("wamid.{}", sent.len()),
            timestamp: Utc::now(),
        })
    }

    async fn upload(&self, file_name: &str, _mime_type: &str, _data: Vec<u8>) -> TransportResult<String> {
        Ok(format!("media-{file_name}"))
    }

    async fn events(&self) -> TransportResult<EventStream> {
        Ok(BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed())
    }
}

/// Registry over [`FakeSession`]s.
pub struct FakeRegistry {
    sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
    /// When false, `create_session` succeeds but no session ever appears.
    creates_sessions: AtomicBool,
    create_calls: AtomicU32,
    create_delay_ms: AtomicU64,
    challenge_delay_ms: AtomicU64,
    fail_lookups: AtomicBool,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            creates_sessions: AtomicBool::new(true),
            create_calls: AtomicU32::new(0),
            create_delay_ms: AtomicU64::new(0),
            challenge_delay_ms: AtomicU64::new(0),
            fail_lookups: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, session: Arc<FakeSession>) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.tenant_id.clone(), session);
    }

    pub fn remove(&self, tenant_id: &str) {
        self.sessions.lock().unwrap().remove(tenant_id);
    }

    pub fn session(&self, tenant_id: &str) -> Option<Arc<FakeSession>> {
        self.sessions.lock().unwrap().get(tenant_id).cloned()
    }

    pub fn set_creates_sessions(&self, creates: bool) {
        self.creates_sessions.store(creates, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Make `create_session` take `delay` before the session appears.
    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Challenge delay of sessions this registry creates.
    pub fn set_challenge_delay(&self, delay: Duration) {
        self.challenge_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make `get_session` fail as an unreachable sidecar would.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionRegistry for FakeRegistry {
    async fn get_session(&self, tenant_id: &str) -> TransportResult<Option<Arc<dyn TransportSession>>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                status: 502,
                message: "sidecar unreachable".to_string(),
            });
        }
        Ok(self
            .session(tenant_id)
            .map(|s| s as Arc<dyn TransportSession>))
    }

    async fn create_session(&self, request: &CreateSessionRequest) -> TransportResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.creates_sessions.load(Ordering::SeqCst) && self.session(&request.tenant_id).is_none() {
            let session = FakeSession::new(&request.tenant_id);
            session.set_challenge_delay(Duration::from_millis(
                self.challenge_delay_ms.load(Ordering::SeqCst),
            ));
            self.insert(session);
        }
        Ok(())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub fn console_config() -> ConsoleConfig {
    ConsoleConfig {
        base_url: "http://console.test".to_string(),
        account_id: 7,
        auth_token: "console-token".to_string(),
        inbox_name: "whatsapp".to_string(),
    }
}

pub fn tenant_record(id: &str) -> TenantRecord {
    TenantRecord {
        id: id.to_string(),
        identity: TENANT_IDENTITY.to_string(),
        display_name: Some("Acme Support".to_string()),
        transport_token: "transport-token".to_string(),
        subscriptions: vec!["Message".to_string()],
        console: console_config(),
        last_pairing_challenge: None,
    }
}

/// A bridge over fakes, with the test's handles to them.
pub struct Harness {
    pub bridge: Bridge,
    pub console: Arc<FakeConsole>,
    pub registry: Arc<FakeRegistry>,
    pub tenants: Arc<MemoryTenantStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timings(Timings::default())
    }

    pub fn with_timings(timings: Timings) -> Self {
        let console = Arc::new(FakeConsole::new());
        let registry = Arc::new(FakeRegistry::new());
        let tenants = Arc::new(MemoryTenantStore::new());
        tenants.upsert(tenant_record(TENANT));

        let bridge = Bridge::new(
            console.clone(),
            registry.clone(),
            tenants.clone(),
            Caches::from_config(&CacheConfig::default()),
            timings,
        );
        Self {
            bridge,
            console,
            registry,
            tenants,
        }
    }

    /// Router with loopback connect info, as `serve` would see a local client.
    pub fn app(&self, api_token: Option<&str>) -> Router {
        let state = AppState {
            bridge: self.bridge.clone(),
            api_token: api_token.map(str::to_string),
            max_connections: 16,
        };
        server::build_app(state, 30).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 50000))))
    }
}

/// Let spawned tasks run. Under a paused clock this also advances time by `d`.
pub async fn run_for(d: Duration) {
    tokio::time::sleep(d).await;
}

/// Let spawned tasks finish their immediate work without moving time much.
pub async fn settle() {
    run_for(Duration::from_millis(10)).await;
}
