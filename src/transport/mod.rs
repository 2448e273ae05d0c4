//! The boundary to the chat transport.
//!
//! The transport owns the socket, encryption and multi-device sync. This
//! crate only drives it through [`Transport`] and consumes the per-kind
//! event channels it returns from [`TransportFactory::create_transport`].

pub mod sidecar;

use crate::store::{CredentialStore, Credentials};
use crate::types::contact::{AccountIdentity, GroupMetadata};
use crate::types::events::EventStreams;
use crate::types::message::MessagePayload;
use async_trait::async_trait;
use std::sync::Arc;

pub use sidecar::{SidecarTransport, SidecarTransportFactory};

/// Answers the transport's retransmission requests from locally retained payloads.
#[async_trait]
pub trait MessageLoader: Send + Sync {
    async fn load_message(&self, chat: &str, message_id: &str) -> Option<MessagePayload>;
}

/// Everything a transport needs to authenticate a new connection.
#[derive(Clone)]
pub struct TransportAuth {
    pub credentials: Credentials,
    pub keys: Arc<CredentialStore>,
    pub message_loader: Arc<dyn MessageLoader>,
}

/// An established (or establishing) transport session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Asks the server for a pairing code for `phone_number` (digits only).
    async fn request_pairing_code(
        &self,
        phone_number: &str,
        custom_code: Option<&str>,
    ) -> Result<String, anyhow::Error>;

    async fn fetch_group_metadata(&self, jid: &str) -> Result<GroupMetadata, anyhow::Error>;

    /// Sends a message and returns its identifier.
    async fn send_message(
        &self,
        jid: &str,
        payload: &MessagePayload,
    ) -> Result<String, anyhow::Error>;

    /// The account this session is logged in as, once known.
    fn user(&self) -> Option<AccountIdentity>;

    async fn disconnect(&self);
}

/// Creates a transport session bound to the given credentials. Connection
/// establishment continues asynchronously after this returns; progress is
/// reported on the `connection` channel.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_transport(
        &self,
        auth: TransportAuth,
    ) -> Result<(Arc<dyn Transport>, EventStreams), anyhow::Error>;
}
