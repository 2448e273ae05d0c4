//! Turns transport events into dispatcher calls and cache writes.

use crate::dispatch::MessageDispatcher;
use crate::jid_utils::{
    SYSTEM_JID, SYSTEM_NAME, decode_jid, format_international, is_group, is_status_broadcast,
};
use crate::store::{CredentialStore, CredentialsUpdate, MetadataCache, StoreError};
use crate::transport::Transport;
use crate::types::contact::{AccountIdentity, ContactRecord};
use crate::types::events::{ContactUpdate, GroupParticipantsUpdate, MessagesUpsert};
use crate::types::message::{InboundMessage, MessagePayload, UpsertKind};
use log::{debug, error, warn};
use std::sync::Arc;

/// Identifiers the bot generates for its own outgoing messages start with
/// this prefix and are exactly [`ECHO_ID_LEN`] characters long.
pub const ECHO_ID_PREFIX: &str = "BAE5";
pub const ECHO_ID_LEN: usize = 16;

/// Returns true if `id` looks like a message this bot sent itself.
pub fn is_echo_id(id: &str) -> bool {
    id.len() == ECHO_ID_LEN && id.starts_with(ECHO_ID_PREFIX)
}

/// What happened to a single message of an upsert batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to [`MessageDispatcher::handle_message`].
    Forwarded,
    /// Handed to [`MessageDispatcher::handle_status`].
    Status,
    /// The message carried no payload.
    NoPayload,
    /// Dropped by the private-mode ownership gate.
    Gated,
    /// Dropped as a reflection of one of our own messages.
    Echo,
    /// The dispatcher returned an error; it was logged.
    HandlerFailed,
}

/// The view of the live session handed to dispatchers.
#[derive(Clone)]
pub struct SessionHandle {
    transport: Arc<dyn Transport>,
    cache: Arc<MetadataCache>,
}

impl SessionHandle {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<MetadataCache>) -> Self {
        Self { transport, cache }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn user(&self) -> Option<AccountIdentity> {
        self.transport.user()
    }

    pub async fn send_message(
        &self,
        jid: &str,
        payload: MessagePayload,
    ) -> Result<String, anyhow::Error> {
        let id = self.transport.send_message(jid, &payload).await?;
        self.cache.remember_message(jid, &id, &payload);
        Ok(id)
    }

    /// Resolves a human-readable name for a contact or group.
    ///
    /// Groups: cached subject, then a live metadata fetch (written back to
    /// the cache), then the formatted number. Individuals: the system
    /// account, the bot's own identity, the cached name or verified name,
    /// then the formatted number. The cache is not consulted for the system
    /// account or the bot itself. `suppress_contact_name` skips the
    /// contact's own name, including those two; the result is never empty.
    pub async fn resolve_name(&self, jid: &str, suppress_contact_name: bool) -> String {
        let id = decode_jid(jid).into_owned();

        if is_group(&id) {
            if let Some(name) = self.cached_name(&id, suppress_contact_name) {
                return name;
            }
            match self.transport.fetch_group_metadata(&id).await {
                Ok(metadata) => {
                    if let Some(subject) = metadata.subject.filter(|s| !s.is_empty()) {
                        self.cache.upsert(ContactRecord::group(&id, subject.clone()));
                        return subject;
                    }
                }
                Err(e) => {
                    debug!(target: "Router", "Group metadata for {id} unavailable: {e}");
                }
            }
            return format_international(&id);
        }

        if id == SYSTEM_JID {
            if suppress_contact_name {
                return format_international(&id);
            }
            return SYSTEM_NAME.to_string();
        }

        if let Some(me) = self.transport.user()
            && decode_jid(&me.id) == id
        {
            return me
                .name
                .filter(|n| !suppress_contact_name && !n.is_empty())
                .unwrap_or_else(|| format_international(&id));
        }

        self.cached_name(&id, suppress_contact_name)
            .unwrap_or_else(|| format_international(&id))
    }

    fn cached_name(&self, id: &str, suppress_contact_name: bool) -> Option<String> {
        self.cache
            .get(id)
            .and_then(|record| record.info.resolve(suppress_contact_name).map(str::to_owned))
    }
}

/// Routes each kind of transport event to its destination.
pub struct EventRouter {
    cache: Arc<MetadataCache>,
    credentials: Arc<CredentialStore>,
    dispatcher: Arc<dyn MessageDispatcher>,
    public_mode: bool,
}

impl EventRouter {
    pub fn new(
        cache: Arc<MetadataCache>,
        credentials: Arc<CredentialStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        public_mode: bool,
    ) -> Self {
        Self {
            cache,
            credentials,
            dispatcher,
            public_mode,
        }
    }

    pub fn public_mode(&self) -> bool {
        self.public_mode
    }

    /// Processes an upsert batch in order. A failing handler never stops the
    /// rest of the batch.
    pub async fn route_messages(
        &self,
        session: &SessionHandle,
        upsert: MessagesUpsert,
    ) -> Vec<RouteOutcome> {
        let kind = upsert.kind;
        let mut outcomes = Vec::with_capacity(upsert.messages.len());
        for raw in upsert.messages {
            if let Some(payload) = &raw.message {
                self.cache
                    .remember_message(&raw.key.remote_jid, &raw.key.id, payload);
            }
            let outcome = match InboundMessage::from_raw(raw, kind) {
                Some(message) => self.route_message(session, message).await,
                None => RouteOutcome::NoPayload,
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn route_message(&self, session: &SessionHandle, message: InboundMessage) -> RouteOutcome {
        let id = message.id.clone();

        if is_status_broadcast(&decode_jid(&message.remote_id)) {
            return match self.dispatcher.handle_status(session, message).await {
                Ok(()) => RouteOutcome::Status,
                Err(e) => {
                    error!(target: "Router", "Status handler failed for {id}: {e:?}");
                    RouteOutcome::HandlerFailed
                }
            };
        }

        if !self.public_mode && !message.from_self && message.kind == UpsertKind::Notify {
            debug!(target: "Router", "Dropping {id} from {} (private mode)", message.remote_id);
            return RouteOutcome::Gated;
        }

        if is_echo_id(&id) {
            debug!(target: "Router", "Dropping echo of own message {id}");
            return RouteOutcome::Echo;
        }

        match self.dispatcher.handle_message(session, message).await {
            Ok(()) => RouteOutcome::Forwarded,
            Err(e) => {
                error!(target: "Router", "Message handler failed for {id}: {e:?}");
                RouteOutcome::HandlerFailed
            }
        }
    }

    /// Upserts each contact under its canonical identifier.
    pub fn route_contacts(&self, updates: Vec<ContactUpdate>) {
        for update in updates {
            let id = decode_jid(&update.id).into_owned();
            let record = if is_group(&id) {
                ContactRecord::new(&id, update.notify)
            } else {
                ContactRecord::individual(&id, update.notify, update.verified_name)
            };
            self.cache.upsert(record);
        }
    }

    pub async fn route_group_participants(
        &self,
        session: &SessionHandle,
        update: GroupParticipantsUpdate,
    ) {
        let group = update.id.clone();
        if let Err(e) = self
            .dispatcher
            .handle_group_participants_update(session, update)
            .await
        {
            warn!(target: "Router", "Group participants handler failed for {group}: {e:?}");
        }
    }

    /// Persists a credential change before returning.
    pub async fn route_credentials(&self, update: CredentialsUpdate) -> Result<(), StoreError> {
        self.credentials.apply_update(update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockTransport, RecordingDispatcher};
    use crate::types::contact::GroupMetadata;
    use crate::types::message::{MessageKey, RawMessage};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        cache: Arc<MetadataCache>,
        transport: Arc<MockTransport>,
        dispatcher: Arc<RecordingDispatcher>,
        router: EventRouter,
        session: SessionHandle,
    }

    async fn fixture(public_mode: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(MetadataCache::new(dir.path().join("store.json"), 20));
        let credentials = Arc::new(CredentialStore::open(dir.path().join("session")).await.unwrap());
        let transport = Arc::new(MockTransport::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let router = EventRouter::new(
            cache.clone(),
            credentials,
            dispatcher.clone(),
            public_mode,
        );
        let session = SessionHandle::new(transport.clone(), cache.clone());
        Fixture {
            _dir: dir,
            cache,
            transport,
            dispatcher,
            router,
            session,
        }
    }

    fn raw(id: &str, chat: &str, from_me: bool) -> RawMessage {
        RawMessage {
            key: MessageKey {
                remote_jid: chat.to_string(),
                from_me,
                id: id.to_string(),
                participant: None,
            },
            message: Some(MessagePayload::Conversation(format!("body of {id}"))),
            message_timestamp: Some(1_700_000_000),
            push_name: None,
        }
    }

    fn batch(messages: Vec<RawMessage>, kind: UpsertKind) -> MessagesUpsert {
        MessagesUpsert { messages, kind }
    }

    #[test]
    fn test_echo_id_pattern() {
        assert!(is_echo_id("BAE5XXXXXXXXXXXX"));
        assert!(!is_echo_id("BAE5XXXXXXXXXXX"));
        assert!(!is_echo_id("BAE5XXXXXXXXXXXXX"));
        assert!(!is_echo_id("3EB0XXXXXXXXXXXX"));
        assert!(!is_echo_id("normal123"));
    }

    #[tokio::test]
    async fn test_echo_dropped_and_normal_forwarded() {
        let f = fixture(true).await;
        let outcomes = f
            .router
            .route_messages(
                &f.session,
                batch(
                    vec![
                        raw("BAE5XXXXXXXXXXXX", "1@s.whatsapp.net", false),
                        raw("normal123", "1@s.whatsapp.net", false),
                    ],
                    UpsertKind::Notify,
                ),
            )
            .await;

        assert_eq!(outcomes, vec![RouteOutcome::Echo, RouteOutcome::Forwarded]);
        assert_eq!(f.dispatcher.message_ids(), vec!["normal123".to_string()]);
    }

    #[tokio::test]
    async fn test_status_messages_never_reach_message_handler() {
        let f = fixture(true).await;
        let outcomes = f
            .router
            .route_messages(
                &f.session,
                batch(
                    vec![
                        raw("S1", "status@broadcast", false),
                        raw("BAE5XXXXXXXXXXXX", "status@broadcast", true),
                    ],
                    UpsertKind::Notify,
                ),
            )
            .await;

        assert_eq!(outcomes, vec![RouteOutcome::Status, RouteOutcome::Status]);
        assert!(f.dispatcher.message_ids().is_empty());
        assert_eq!(f.dispatcher.status_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_private_mode_gate() {
        let f = fixture(false).await;
        let outcomes = f
            .router
            .route_messages(
                &f.session,
                batch(
                    vec![
                        raw("A1", "1@s.whatsapp.net", false),
                        raw("A2", "1@s.whatsapp.net", true),
                    ],
                    UpsertKind::Notify,
                ),
            )
            .await;
        assert_eq!(outcomes, vec![RouteOutcome::Gated, RouteOutcome::Forwarded]);

        // History appends bypass the gate.
        let outcomes = f
            .router
            .route_messages(
                &f.session,
                batch(vec![raw("A3", "1@s.whatsapp.net", false)], UpsertKind::Append),
            )
            .await;
        assert_eq!(outcomes, vec![RouteOutcome::Forwarded]);
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_abort_batch() {
        let f = fixture(true).await;
        f.dispatcher.fail_on("bad");
        let outcomes = f
            .router
            .route_messages(
                &f.session,
                batch(
                    vec![
                        raw("first", "1@s.whatsapp.net", false),
                        raw("bad", "1@s.whatsapp.net", false),
                        raw("last", "1@s.whatsapp.net", false),
                    ],
                    UpsertKind::Notify,
                ),
            )
            .await;
        assert_eq!(
            outcomes,
            vec![
                RouteOutcome::Forwarded,
                RouteOutcome::HandlerFailed,
                RouteOutcome::Forwarded
            ]
        );
        assert_eq!(
            f.dispatcher.message_ids(),
            vec!["first".to_string(), "bad".to_string(), "last".to_string()]
        );
    }

    #[tokio::test]
    async fn test_ephemeral_payload_is_unwrapped_and_retained() {
        let f = fixture(true).await;
        let mut message = raw("E1", "1:4@s.whatsapp.net", false);
        message.message = Some(MessagePayload::EphemeralMessage {
            message: Box::new(MessagePayload::Conversation("secret".into())),
        });
        let outcomes = f
            .router
            .route_messages(&f.session, batch(vec![message], UpsertKind::Notify))
            .await;
        assert_eq!(outcomes, vec![RouteOutcome::Forwarded]);

        let forwarded = f.dispatcher.messages();
        assert_eq!(
            forwarded[0].payload,
            MessagePayload::Conversation("secret".into())
        );
        assert!(
            f.cache
                .load_message("1@s.whatsapp.net", "E1")
                .is_some_and(|p| p.is_ephemeral())
        );
    }

    #[tokio::test]
    async fn test_message_without_payload() {
        let f = fixture(true).await;
        let mut message = raw("N1", "1@s.whatsapp.net", false);
        message.message = None;
        let outcomes = f
            .router
            .route_messages(&f.session, batch(vec![message], UpsertKind::Notify))
            .await;
        assert_eq!(outcomes, vec![RouteOutcome::NoPayload]);
    }

    #[tokio::test]
    async fn test_contacts_are_canonicalized() {
        let f = fixture(true).await;
        f.router.route_contacts(vec![
            ContactUpdate {
                id: "15550001111:7@s.whatsapp.net".into(),
                notify: Some("Alice".into()),
                verified_name: None,
            },
            ContactUpdate {
                id: "1203630@g.us".into(),
                notify: Some("Team".into()),
                verified_name: None,
            },
        ]);

        let alice = f.cache.get("15550001111@s.whatsapp.net").unwrap();
        assert_eq!(alice.id, "15550001111@s.whatsapp.net");
        assert_eq!(alice.display_name(), Some("Alice"));
        assert!(f.cache.get("1203630@g.us").unwrap().is_group());
    }

    #[tokio::test]
    async fn test_individual_name_resolution_order() {
        let f = fixture(true).await;
        let jid = "15550001111@s.whatsapp.net";
        assert_eq!(f.session.resolve_name(jid, false).await, "+15550001111");

        f.cache
            .upsert(ContactRecord::individual(jid, None, Some("Acme Inc".into())));
        assert_eq!(f.session.resolve_name(jid, false).await, "Acme Inc");

        f.cache.upsert(ContactRecord::individual(
            jid,
            Some("Alice".into()),
            Some("Acme Inc".into()),
        ));
        assert_eq!(f.session.resolve_name("15550001111:3@s.whatsapp.net", false).await, "Alice");
        assert_eq!(f.session.resolve_name(jid, true).await, "Acme Inc");

        f.cache
            .upsert(ContactRecord::individual(jid, Some("Alice".into()), None));
        assert_eq!(f.session.resolve_name(jid, true).await, "+15550001111");
    }

    #[tokio::test]
    async fn test_reserved_and_own_identity_names() {
        let f = fixture(true).await;
        assert_eq!(f.session.resolve_name(SYSTEM_JID, false).await, "WhatsApp");

        f.transport.set_user(AccountIdentity {
            id: "15559990000:2@s.whatsapp.net".into(),
            name: Some("Keeper".into()),
        });
        assert_eq!(
            f.session
                .resolve_name("15559990000@s.whatsapp.net", false)
                .await,
            "Keeper"
        );
    }

    #[tokio::test]
    async fn test_suppressed_names_skip_own_and_system_accounts() {
        let f = fixture(true).await;
        assert_eq!(f.session.resolve_name(SYSTEM_JID, true).await, "+0");

        f.transport.set_user(AccountIdentity {
            id: "15559990000:2@s.whatsapp.net".into(),
            name: Some("Keeper".into()),
        });
        // The cache is not consulted for the bot's own id.
        f.cache.upsert(ContactRecord::individual(
            "15559990000@s.whatsapp.net",
            Some("Cached".into()),
            Some("Verified".into()),
        ));
        assert_eq!(
            f.session
                .resolve_name("15559990000@s.whatsapp.net", true)
                .await,
            "+15559990000"
        );
    }

    #[tokio::test]
    async fn test_group_name_fetch_is_written_back() {
        let f = fixture(true).await;
        let gid = "1203630@g.us";
        assert_eq!(f.session.resolve_name(gid, false).await, "+1203630");
        assert_eq!(f.transport.group_fetch_count(), 1);

        f.transport.add_group(GroupMetadata {
            id: gid.into(),
            subject: Some("Team".into()),
            participants: vec![],
        });
        assert_eq!(f.session.resolve_name(gid, false).await, "Team");
        assert_eq!(f.session.resolve_name(gid, false).await, "Team");
        assert_eq!(f.transport.group_fetch_count(), 2);
        assert_eq!(
            f.cache.get(gid).and_then(|r| r.display_name().map(str::to_owned)),
            Some("Team".to_string())
        );
    }

    #[tokio::test]
    async fn test_send_message_retains_payload() {
        let f = fixture(true).await;
        let id = f
            .session
            .send_message("1@s.whatsapp.net", MessagePayload::Conversation("pong".into()))
            .await
            .unwrap();
        assert!(is_echo_id(&id));
        assert_eq!(
            f.cache.load_message("1@s.whatsapp.net", &id),
            Some(MessagePayload::Conversation("pong".into()))
        );
        assert_eq!(f.transport.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_group_participant_failures_are_swallowed() {
        let f = fixture(true).await;
        f.dispatcher.fail_on("1203630@g.us");
        f.router
            .route_group_participants(
                &f.session,
                GroupParticipantsUpdate {
                    id: "1203630@g.us".into(),
                    participants: vec!["1@s.whatsapp.net".into()],
                    action: crate::types::events::ParticipantAction::Add,
                    author: None,
                },
            )
            .await;
        assert_eq!(f.dispatcher.group_updates().len(), 1);
    }
}
