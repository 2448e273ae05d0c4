use crate::router::SessionHandle;
use crate::types::events::GroupParticipantsUpdate;
use crate::types::message::InboundMessage;
use async_trait::async_trait;
use log::info;

/// The command-handling side of the bot.
///
/// Every method may fail; the router logs the failure and moves on to the
/// next event, so an implementation never needs to guard against taking the
/// session down.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Handles a direct or group message that passed all filters.
    async fn handle_message(
        &self,
        session: &SessionHandle,
        message: InboundMessage,
    ) -> Result<(), anyhow::Error>;

    /// Handles a message posted to the status broadcast channel.
    async fn handle_status(
        &self,
        session: &SessionHandle,
        message: InboundMessage,
    ) -> Result<(), anyhow::Error> {
        let _ = (session, message);
        Ok(())
    }

    async fn handle_group_participants_update(
        &self,
        session: &SessionHandle,
        update: GroupParticipantsUpdate,
    ) -> Result<(), anyhow::Error> {
        let _ = (session, update);
        Ok(())
    }
}

/// Logs every event it receives and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatcher;

#[async_trait]
impl MessageDispatcher for LoggingDispatcher {
    async fn handle_message(
        &self,
        session: &SessionHandle,
        message: InboundMessage,
    ) -> Result<(), anyhow::Error> {
        let sender = message
            .participant
            .as_deref()
            .unwrap_or(&message.remote_id);
        let name = session.resolve_name(sender, false).await;
        info!(
            target: "Dispatch",
            "Message {} from {} in {}: {}",
            message.id,
            name,
            message.remote_id,
            message.text_content().unwrap_or("<non-text>")
        );
        Ok(())
    }

    async fn handle_status(
        &self,
        _session: &SessionHandle,
        message: InboundMessage,
    ) -> Result<(), anyhow::Error> {
        info!(
            target: "Dispatch",
            "Status update {} from {}",
            message.id,
            message.participant.as_deref().unwrap_or("unknown")
        );
        Ok(())
    }

    async fn handle_group_participants_update(
        &self,
        session: &SessionHandle,
        update: GroupParticipantsUpdate,
    ) -> Result<(), anyhow::Error> {
        let group = session.resolve_name(&update.id, false).await;
        info!(
            target: "Dispatch",
            "Group {}: {:?} {}",
            group,
            update.action,
            update.participants.join(", ")
        );
        Ok(())
    }
}
