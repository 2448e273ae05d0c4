use crate::dispatch::MessageDispatcher;
use crate::router::SessionHandle;
use crate::transport::{Transport, TransportAuth, TransportFactory};
use crate::types::contact::{AccountIdentity, GroupMetadata};
use crate::types::events::{EventSenders, EventStreams, GroupParticipantsUpdate, event_channels};
use crate::types::message::{InboundMessage, MessagePayload};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// A transport that records every call and answers from canned state.
#[derive(Default)]
pub struct MockTransport {
    user: RwLock<Option<AccountIdentity>>,
    groups: DashMap<String, GroupMetadata>,
    pairing_code: Mutex<String>,
    pairing_requests: Mutex<Vec<(String, Option<String>)>>,
    fail_pairing: AtomicBool,
    sent: Mutex<Vec<(String, MessagePayload)>>,
    group_fetches: AtomicUsize,
    disconnected: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        let transport = Self::default();
        transport.set_pairing_code("ABCD1234EFGH5678");
        transport
    }

    pub fn set_user(&self, user: AccountIdentity) {
        *self.user.write().expect("user lock poisoned") = Some(user);
    }

    pub fn add_group(&self, metadata: GroupMetadata) {
        self.groups.insert(metadata.id.clone(), metadata);
    }

    pub fn set_pairing_code(&self, code: &str) {
        *self.pairing_code.lock().expect("pairing code lock poisoned") = code.to_string();
    }

    pub fn fail_pairing(&self, fail: bool) {
        self.fail_pairing.store(fail, Ordering::SeqCst);
    }

    pub fn pairing_requests(&self) -> Vec<(String, Option<String>)> {
        self.pairing_requests
            .lock()
            .expect("pairing request lock poisoned")
            .clone()
    }

    pub fn sent_messages(&self) -> Vec<(String, MessagePayload)> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }

    pub fn group_fetch_count(&self) -> usize {
        self.group_fetches.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request_pairing_code(
        &self,
        phone_number: &str,
        custom_code: Option<&str>,
    ) -> Result<String, anyhow::Error> {
        self.pairing_requests
            .lock()
            .expect("pairing request lock poisoned")
            .push((phone_number.to_string(), custom_code.map(str::to_owned)));
        if self.fail_pairing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("pairing rejected by mock"));
        }
        match custom_code {
            Some(code) => Ok(code.to_string()),
            None => Ok(self
                .pairing_code
                .lock()
                .expect("pairing code lock poisoned")
                .clone()),
        }
    }

    async fn fetch_group_metadata(&self, jid: &str) -> Result<GroupMetadata, anyhow::Error> {
        self.group_fetches.fetch_add(1, Ordering::SeqCst);
        self.groups
            .get(jid)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("group {jid} not found"))
    }

    async fn send_message(
        &self,
        jid: &str,
        payload: &MessagePayload,
    ) -> Result<String, anyhow::Error> {
        let mut bytes = [0u8; 6];
        rand::rng().fill_bytes(&mut bytes);
        let suffix: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        self.sent
            .lock()
            .expect("sent lock poisoned")
            .push((jid.to_string(), payload.clone()));
        Ok(format!("BAE5{suffix}"))
    }

    fn user(&self) -> Option<AccountIdentity> {
        self.user.read().expect("user lock poisoned").clone()
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// One transport session created by [`MockTransportFactory`]. Tests push
/// events through `events` as if they came from the server.
pub struct MockSession {
    pub transport: Arc<MockTransport>,
    pub events: EventSenders,
    pub auth: TransportAuth,
}

/// Hands every created session to the test through a channel.
pub struct MockTransportFactory {
    sessions: mpsc::UnboundedSender<MockSession>,
    created: AtomicUsize,
    fail_creates: AtomicBool,
}

impl MockTransportFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Self {
            sessions: tx,
            created: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
        });
        (factory, rx)
    }

    /// Number of `create_transport` calls so far, including failed ones.
    pub fn create_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create_transport(
        &self,
        auth: TransportAuth,
    ) -> Result<(Arc<dyn Transport>, EventStreams), anyhow::Error> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("mock transport refused to start"));
        }

        let transport = Arc::new(MockTransport::new());
        if let Some(me) = auth.credentials.me.clone() {
            transport.set_user(me);
        }
        let (events, streams) = event_channels();
        let _ = self.sessions.send(MockSession {
            transport: transport.clone(),
            events,
            auth,
        });
        Ok((transport, streams))
    }
}

/// Records every event it is handed. Fails for ids registered with
/// [`RecordingDispatcher::fail_on`] (message ids or group ids).
#[derive(Default)]
pub struct RecordingDispatcher {
    messages: Mutex<Vec<InboundMessage>>,
    statuses: Mutex<Vec<InboundMessage>>,
    group_updates: Mutex<Vec<GroupParticipantsUpdate>>,
    failing_ids: DashMap<String, ()>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, id: &str) {
        self.failing_ids.insert(id.to_string(), ());
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().expect("messages lock poisoned").clone()
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.id).collect()
    }

    pub fn status_ids(&self) -> Vec<String> {
        self.statuses
            .lock()
            .expect("statuses lock poisoned")
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn group_updates(&self) -> Vec<GroupParticipantsUpdate> {
        self.group_updates
            .lock()
            .expect("group updates lock poisoned")
            .clone()
    }

    fn check(&self, id: &str) -> Result<(), anyhow::Error> {
        if self.failing_ids.contains_key(id) {
            Err(anyhow::anyhow!("handler failed for {id}"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn handle_message(
        &self,
        _session: &SessionHandle,
        message: InboundMessage,
    ) -> Result<(), anyhow::Error> {
        let id = message.id.clone();
        self.messages
            .lock()
            .expect("messages lock poisoned")
            .push(message);
        self.check(&id)
    }

    async fn handle_status(
        &self,
        _session: &SessionHandle,
        message: InboundMessage,
    ) -> Result<(), anyhow::Error> {
        let id = message.id.clone();
        self.statuses
            .lock()
            .expect("statuses lock poisoned")
            .push(message);
        self.check(&id)
    }

    async fn handle_group_participants_update(
        &self,
        _session: &SessionHandle,
        update: GroupParticipantsUpdate,
    ) -> Result<(), anyhow::Error> {
        let id = update.id.clone();
        self.group_updates
            .lock()
            .expect("group updates lock poisoned")
            .push(update);
        self.check(&id)
    }
}
