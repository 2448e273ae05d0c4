//! A transport backed by an external protocol engine running as a child
//! process, spoken to with newline-delimited JSON over its stdio.
//!
//! Frames written to the sidecar's stdin:
//! - `{"type":"init","credentials":{..}}` once, right after spawning
//! - `{"type":"call","id":"..","method":"..","params":{..}}` for imperative operations
//! - `{"type":"reply","id":"..","result":..}` answering a sidecar request
//!
//! Frames read from its stdout:
//! - `{"type":"event","event":{"name":"connection.update","data":{..}}}`
//! - `{"type":"response","id":"..","result":..,"error":null}`
//! - `{"type":"request","id":"..","method":"getMessage"|"keys.get"|"keys.set","params":{..}}`

use super::{Transport, TransportAuth, TransportFactory};
use crate::store::Credentials;
use crate::types::contact::{AccountIdentity, GroupMetadata};
use crate::types::events::{
    ConnectionStatus, ConnectionUpdate, DisconnectReason, EventSenders, EventStreams,
    TransportEvent, event_channels,
};
use crate::types::message::MessagePayload;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Duration, timeout};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Event {
        event: TransportEvent,
    },
    Response {
        id: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Init {
        credentials: &'a Credentials,
    },
    Call {
        id: &'a str,
        method: &'a str,
        params: Value,
    },
    Reply {
        id: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetMessageParams {
    remote_jid: String,
    id: String,
}

#[derive(Deserialize)]
struct KeysGetParams {
    category: String,
    ids: Vec<String>,
}

#[derive(Deserialize)]
struct KeysSetParams {
    category: String,
    entries: HashMap<String, Option<Value>>,
}

type ResponseWaiter = oneshot::Sender<Result<Value, String>>;

pub struct SidecarTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    response_waiters: Mutex<HashMap<String, ResponseWaiter>>,
    unique_id: String,
    id_counter: AtomicU64,
    user: std::sync::RwLock<Option<AccountIdentity>>,
    call_timeout: Duration,
}

impl SidecarTransport {
    fn new(
        stdin: ChildStdin,
        child: Child,
        user: Option<AccountIdentity>,
        call_timeout: Duration,
    ) -> Self {
        let mut unique_id_bytes = [0u8; 2];
        rand::rng().fill_bytes(&mut unique_id_bytes);

        Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            response_waiters: Mutex::new(HashMap::new()),
            unique_id: format!("{}.{}", unique_id_bytes[0], unique_id_bytes[1]),
            id_counter: AtomicU64::new(0),
            user: std::sync::RwLock::new(user),
            call_timeout,
        }
    }

    fn generate_request_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }

    async fn write_frame(&self, frame: &Outbound<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Sends a call and waits for the matching response.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let req_id = self.generate_request_id();
        let (tx, rx) = oneshot::channel();
        self.response_waiters
            .lock()
            .await
            .insert(req_id.clone(), tx);

        let frame = Outbound::Call {
            id: &req_id,
            method,
            params,
        };
        if let Err(e) = self.write_frame(&frame).await {
            self.response_waiters.lock().await.remove(&req_id);
            return Err(e);
        }

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(anyhow!("{method} failed: {message}")),
            Ok(Err(_)) => Err(anyhow!("transport closed before answering {method}")),
            Err(_) => {
                self.response_waiters.lock().await.remove(&req_id);
                Err(anyhow!("{method} timed out after {:?}", self.call_timeout))
            }
        }
    }

    fn set_user(&self, user: AccountIdentity) {
        if let Ok(mut guard) = self.user.write() {
            *guard = Some(user);
        }
    }

    async fn handle_response(&self, id: String, result: Value, error: Option<String>) {
        match self.response_waiters.lock().await.remove(&id) {
            Some(waiter) => {
                let outcome = match error {
                    Some(message) => Err(message),
                    None => Ok(result),
                };
                if waiter.send(outcome).is_err() {
                    debug!(target: "Transport/Sidecar", "Waiter for {id} was dropped");
                }
            }
            None => warn!(target: "Transport/Sidecar", "Response for unknown request {id}"),
        }
    }

    async fn answer_request(&self, auth: &TransportAuth, method: &str, params: Value) -> Result<Value> {
        match method {
            "getMessage" => {
                let params: GetMessageParams = serde_json::from_value(params)?;
                let payload = auth
                    .message_loader
                    .load_message(&params.remote_jid, &params.id)
                    .await;
                Ok(serde_json::to_value(payload)?)
            }
            "keys.get" => {
                let params: KeysGetParams = serde_json::from_value(params)?;
                let mut found = Map::new();
                for id in params.ids {
                    if let Some(value) = auth.keys.read_key(&params.category, &id).await? {
                        found.insert(id, value);
                    }
                }
                Ok(Value::Object(found))
            }
            "keys.set" => {
                let params: KeysSetParams = serde_json::from_value(params)?;
                for (id, value) in params.entries {
                    auth.keys
                        .write_key(&params.category, &id, value.as_ref())
                        .await?;
                }
                Ok(Value::Null)
            }
            other => Err(anyhow!("unsupported request method {other}")),
        }
    }

    async fn reply(&self, id: &str, outcome: Result<Value>) {
        let frame = match outcome {
            Ok(result) => Outbound::Reply {
                id,
                result: Some(result),
                error: None,
            },
            Err(e) => Outbound::Reply {
                id,
                result: None,
                error: Some(e.to_string()),
            },
        };
        if let Err(e) = self.write_frame(&frame).await {
            warn!(target: "Transport/Sidecar", "Failed to answer request {id}: {e}");
        }
    }

    /// Reads frames until the sidecar closes its stdout. Guarantees the
    /// session loop sees a closed connection update before the channels end.
    ///
    /// Events are handed to [`forward_events`] without waiting, so responses
    /// to calls made from the session loop are still read while its
    /// channels are full.
    async fn read_loop(
        self: Arc<Self>,
        stdout: ChildStdout,
        events: mpsc::UnboundedSender<TransportEvent>,
        auth: TransportAuth,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        let mut reported_close = false;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "Transport/Sidecar", "Error reading from sidecar: {e}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let frame: Inbound = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(target: "Transport/Sidecar", "Ignoring malformed frame ({e}): {line}");
                    continue;
                }
            };

            match frame {
                Inbound::Event { event } => {
                    match &event {
                        TransportEvent::ConnectionUpdate(update) => {
                            if update.status == Some(ConnectionStatus::Closed) {
                                reported_close = true;
                            }
                        }
                        TransportEvent::CredsUpdate(update) => {
                            if let Some(me) = &update.me {
                                self.set_user(me.clone());
                            }
                        }
                        _ => {}
                    }
                    if events.send(event).is_err() {
                        debug!(target: "Transport/Sidecar", "Session loop gone, stopping reader");
                        return;
                    }
                }
                Inbound::Response { id, result, error } => {
                    self.handle_response(id, result, error).await;
                }
                Inbound::Request { id, method, params } => {
                    let this = self.clone();
                    let auth = auth.clone();
                    tokio::spawn(async move {
                        let outcome = this.answer_request(&auth, &method, params).await;
                        this.reply(&id, outcome).await;
                    });
                }
            }
        }

        info!(target: "Transport/Sidecar", "Sidecar output closed");
        self.response_waiters.lock().await.clear();
        if !reported_close {
            let _ = events.send(TransportEvent::ConnectionUpdate(ConnectionUpdate::closed(
                DisconnectReason::ConnectionLost,
            )));
        }
    }
}

/// Moves decoded events into the bounded per-kind channels in arrival order.
async fn forward_events(mut events: mpsc::UnboundedReceiver<TransportEvent>, senders: EventSenders) {
    while let Some(event) = events.recv().await {
        if senders.dispatch(event).await.is_err() {
            debug!(target: "Transport/Sidecar", "Session loop gone, dropping queued events");
            return;
        }
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    async fn request_pairing_code(
        &self,
        phone_number: &str,
        custom_code: Option<&str>,
    ) -> Result<String> {
        let value = self
            .call(
                "requestPairingCode",
                json!({ "phoneNumber": phone_number, "customCode": custom_code }),
            )
            .await?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("pairing code response was not a string: {value}"))
    }

    async fn fetch_group_metadata(&self, jid: &str) -> Result<GroupMetadata> {
        let value = self.call("groupMetadata", json!({ "jid": jid })).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn send_message(&self, jid: &str, payload: &MessagePayload) -> Result<String> {
        let value = self
            .call("sendMessage", json!({ "jid": jid, "message": payload }))
            .await?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("sendMessage response carried no id: {value}"))
    }

    fn user(&self) -> Option<AccountIdentity> {
        self.user.read().ok().and_then(|user| user.clone())
    }

    async fn disconnect(&self) {
        info!(target: "Transport/Sidecar", "Stopping transport sidecar");
        if let Err(e) = self.child.lock().await.start_kill() {
            debug!(target: "Transport/Sidecar", "Sidecar already stopped: {e}");
        }
    }
}

/// Spawns one sidecar process per transport session.
#[derive(Debug, Clone)]
pub struct SidecarTransportFactory {
    program: PathBuf,
    args: Vec<String>,
    call_timeout: Duration,
}

impl SidecarTransportFactory {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

#[async_trait]
impl TransportFactory for SidecarTransportFactory {
    async fn create_transport(
        &self,
        auth: TransportAuth,
    ) -> Result<(Arc<dyn Transport>, EventStreams)> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                anyhow!(
                    "failed to spawn transport sidecar {}: {e}",
                    self.program.display()
                )
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("sidecar stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("sidecar stdout is not piped"))?;

        let (senders, streams) = event_channels();
        let transport = Arc::new(SidecarTransport::new(
            stdin,
            child,
            auth.credentials.me.clone(),
            self.call_timeout,
        ));
        transport
            .write_frame(&Outbound::Init {
                credentials: &auth.credentials,
            })
            .await?;
        debug!(target: "Transport/Sidecar", "Spawned {} and sent credentials", self.program.display());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(event_rx, senders));
        tokio::spawn(transport.clone().read_loop(stdout, event_tx, auth));
        Ok((transport, streams))
    }
}
