use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tracing::info;

use common::{Action, JobStore, Message, Messenger, PeerId};

use crate::session::RoomSession;

/// Fans results out to the coordinator and to the local job state.
///
/// All three operations take the same turn, so a publication is never
/// interleaved with another message or local update.
pub struct Propagator<M> {
    messenger: Arc<M>,
    store: JobStore,
    session: watch::Receiver<RoomSession>,
    turn: Mutex<()>,
}

impl<M: Messenger> Propagator<M> {
    pub fn new(messenger: Arc<M>, store: JobStore, session: watch::Receiver<RoomSession>) -> Self {
        Self {
            messenger,
            store,
            session,
            turn: Mutex::new(()),
        }
    }

    fn coordinator(&self) -> PeerId {
        self.session.borrow().coordinator.clone()
    }

    /// Send `message` to the coordinator and apply it locally.
    ///
    /// The local state only changes once the message has been handed to the
    /// transport; if sending fails neither side sees it.
    pub async fn publish(&self, message: Message) -> Result<()> {
        let _turn = self.turn.lock().await;
        self.send_to_coordinator(&message).await?;
        self.store.dispatch(message);
        Ok(())
    }

    /// Send `message` to the coordinator only.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let _turn = self.turn.lock().await;
        self.send_to_coordinator(message).await
    }

    /// Apply `action` to the local state only.
    pub async fn apply(&self, action: impl Into<Action>) {
        let _turn = self.turn.lock().await;
        self.store.dispatch(action);
    }

    async fn send_to_coordinator(&self, message: &Message) -> Result<()> {
        let coordinator = self.coordinator();
        self.messenger
            .send_direct(&coordinator, message)
            .await
            .with_context(|| format!("failed to send {} to {coordinator}", message.kind()))?;
        info!("sent {} to {coordinator}", message.kind());
        Ok(())
    }
}
