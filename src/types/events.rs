use crate::store::credentials::CredentialsUpdate;
use crate::types::message::{RawMessage, UpsertKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

// The size of each per-kind event channel.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    #[serde(alias = "close")]
    Closed,
}

/// Why the transport closed the connection. Serialized as its status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum DisconnectReason {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    ServiceUnavailable,
    RestartRequired,
    Unknown(i32),
}

impl From<i32> for DisconnectReason {
    fn from(code: i32) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            _ => Self::Unknown(code),
        }
    }
}

impl From<DisconnectReason> for i32 {
    fn from(reason: DisconnectReason) -> Self {
        reason.code()
    }
}

impl DisconnectReason {
    pub fn code(&self) -> i32 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::ServiceUnavailable => 503,
            Self::RestartRequired => 515,
            Self::Unknown(code) => *code,
        }
    }

    /// The authenticated session was explicitly ended; the stored credentials
    /// are no longer valid.
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LoggedOut => "logged out",
            Self::Forbidden => "forbidden",
            Self::ConnectionLost => "connection lost",
            Self::MultideviceMismatch => "multi-device mismatch",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionReplaced => "connection replaced",
            Self::BadSession => "bad session",
            Self::ServiceUnavailable => "service unavailable",
            Self::RestartRequired => "restart required",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "{} ({})", label, self.code())
    }
}

/// A `connection.update` event. Any field may be absent in a partial update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default, rename = "connection")]
    pub status: Option<ConnectionStatus>,
    #[serde(default)]
    pub last_disconnect: Option<DisconnectReason>,
    #[serde(default)]
    pub qr: Option<String>,
}

impl ConnectionUpdate {
    pub fn open() -> Self {
        Self {
            status: Some(ConnectionStatus::Open),
            ..Default::default()
        }
    }

    pub fn closed(reason: impl Into<Option<DisconnectReason>>) -> Self {
        Self {
            status: Some(ConnectionStatus::Closed),
            last_disconnect: reason.into(),
            qr: None,
        }
    }

    pub fn qr(code: impl Into<String>) -> Self {
        Self {
            qr: Some(code.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesUpsert {
    pub messages: Vec<RawMessage>,
    #[serde(rename = "type")]
    pub kind: UpsertKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactUpdate {
    pub id: String,
    #[serde(default)]
    pub notify: Option<String>,
    #[serde(default)]
    pub verified_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParticipantsUpdate {
    pub id: String,
    pub participants: Vec<String>,
    pub action: ParticipantAction,
    #[serde(default)]
    pub author: Option<String>,
}

/// Every event the transport can emit, tagged with its wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum TransportEvent {
    #[serde(rename = "connection.update")]
    ConnectionUpdate(ConnectionUpdate),
    #[serde(rename = "messages.upsert")]
    MessagesUpsert(MessagesUpsert),
    #[serde(rename = "contacts.update")]
    ContactsUpdate(Vec<ContactUpdate>),
    #[serde(rename = "group-participants.update")]
    GroupParticipantsUpdate(GroupParticipantsUpdate),
    #[serde(rename = "creds.update")]
    CredsUpdate(CredentialsUpdate),
}

// Generates a sender half and a receiver half with one channel per event kind.
macro_rules! define_event_channels {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Producer side of the per-kind event channels, held by the transport.
        #[derive(Debug, Clone)]
        pub struct EventSenders {
            $(
                pub $field: mpsc::Sender<$type>,
            )*
        }

        /// Consumer side of the per-kind event channels, drained by the session loop.
        #[derive(Debug)]
        pub struct EventStreams {
            $(
                pub $field: mpsc::Receiver<$type>,
            )*
        }

        /// Creates a fresh set of channels for one transport session.
        pub fn event_channels() -> (EventSenders, EventStreams) {
            $(
                let $field = mpsc::channel(CHANNEL_CAPACITY);
            )*
            (
                EventSenders { $($field: $field.0,)* },
                EventStreams { $($field: $field.1,)* },
            )
        }
    };
}

define_event_channels! {
    (connection, ConnectionUpdate),
    (creds, CredentialsUpdate),
    (contacts, Vec<ContactUpdate>),
    (group_participants, GroupParticipantsUpdate),
    (messages, MessagesUpsert),
}

impl EventSenders {
    /// Routes an event into the channel for its kind. Fails only when the
    /// session loop has dropped its receivers.
    pub async fn dispatch(&self, event: TransportEvent) -> Result<(), anyhow::Error> {
        let sent = match event {
            TransportEvent::ConnectionUpdate(update) => {
                self.connection.send(update).await.is_ok()
            }
            TransportEvent::MessagesUpsert(upsert) => self.messages.send(upsert).await.is_ok(),
            TransportEvent::ContactsUpdate(updates) => self.contacts.send(updates).await.is_ok(),
            TransportEvent::GroupParticipantsUpdate(update) => {
                self.group_participants.send(update).await.is_ok()
            }
            TransportEvent::CredsUpdate(update) => self.creds.send(update).await.is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(anyhow::anyhow!("session event loop is gone"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_codes() {
        assert_eq!(DisconnectReason::from(401), DisconnectReason::LoggedOut);
        assert!(DisconnectReason::from(401).is_logged_out());
        assert!(!DisconnectReason::from(428).is_logged_out());
        assert_eq!(DisconnectReason::from(999), DisconnectReason::Unknown(999));
        assert_eq!(DisconnectReason::Unknown(999).code(), 999);
    }

    #[test]
    fn test_connection_update_wire_shape() {
        let update: ConnectionUpdate =
            serde_json::from_str(r#"{"connection":"close","lastDisconnect":401}"#).unwrap();
        assert_eq!(update, ConnectionUpdate::closed(DisconnectReason::LoggedOut));

        let qr: ConnectionUpdate = serde_json::from_str(r#"{"qr":"2@abc"}"#).unwrap();
        assert_eq!(qr.status, None);
        assert_eq!(qr.qr.as_deref(), Some("2@abc"));
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let (senders, mut streams) = event_channels();
        senders
            .dispatch(TransportEvent::ConnectionUpdate(ConnectionUpdate::open()))
            .await
            .unwrap();
        senders
            .dispatch(TransportEvent::ContactsUpdate(vec![ContactUpdate {
                id: "1@s.whatsapp.net".into(),
                notify: Some("A".into()),
                verified_name: None,
            }]))
            .await
            .unwrap();

        assert_eq!(
            streams.connection.recv().await,
            Some(ConnectionUpdate::open())
        );
        assert_eq!(streams.contacts.recv().await.map(|c| c.len()), Some(1));
        assert!(streams.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_fails_after_streams_dropped() {
        let (senders, streams) = event_channels();
        drop(streams);
        assert!(
            senders
                .dispatch(TransportEvent::ConnectionUpdate(ConnectionUpdate::open()))
                .await
                .is_err()
        );
    }
}
