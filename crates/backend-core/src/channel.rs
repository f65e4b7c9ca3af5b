//! Frontend-facing queues: commands in, events fanned out.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{BackendCommand, BackendEvent};

/// What a frontend reads events from. Slow readers see `Lagged` and skip ahead.
pub type EventStream = broadcast::Receiver<BackendEvent>;

#[derive(Debug, Error)]
pub enum BackendChannelError {
    #[error("runtime is no longer accepting commands")]
    CommandChannelClosed,
}

/// Sending half of the runtime's queues. The runtime keeps the command
/// receiver; every clone can queue commands and open event streams.
#[derive(Clone, Debug)]
pub struct BackendChannels {
    commands: mpsc::Sender<BackendCommand>,
    events: broadcast::Sender<BackendEvent>,
}

impl BackendChannels {
    /// Both capacities are clamped to at least one slot.
    pub fn new(
        command_capacity: usize,
        event_capacity: usize,
    ) -> (Self, mpsc::Receiver<BackendCommand>) {
        let (commands, command_rx) = mpsc::channel(command_capacity.max(1));
        let (events, _) = broadcast::channel(event_capacity.max(1));
        (Self { commands, events }, command_rx)
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Waits for queue space; fails once the runtime has stopped.
    pub async fn send_command(&self, command: BackendCommand) -> Result<(), BackendChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BackendChannelError::CommandChannelClosed)
    }

    /// Publish to whoever is subscribed right now; nobody listening is fine.
    pub fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }
}
