//! Events pushed from the client task to the host application.

use std::time::Duration;

use tokio::sync::mpsc;
use veil_shared::protocol::{ChatRequest, FileInfo, InfoEvent, MemberInfo, RoomInfo};
use veil_shared::{ClientId, TransferId};

/// Connection lifecycle. `Sleep` and `Restart` form the retry edge taken
/// after any fatal error; `Quit` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Start,
    Handshake,
    Join,
    Group,
    Tunnel,
    Run,
    Sleep(Duration),
    Restart,
    Quit,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Start => write!(f, "start"),
            ClientState::Handshake => write!(f, "handshake"),
            ClientState::Join => write!(f, "join"),
            ClientState::Group => write!(f, "group"),
            ClientState::Tunnel => write!(f, "tunnel"),
            ClientState::Run => write!(f, "run"),
            ClientState::Sleep(delay) => write!(f, "sleep({}ms)", delay.as_millis()),
            ClientState::Restart => write!(f, "restart"),
            ClientState::Quit => write!(f, "quit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    State(ClientState),
    Joined {
        client: ClientId,
        name: String,
        motd: String,
        members: Vec<MemberInfo>,
        rooms: Vec<RoomInfo>,
    },
    Member(InfoEvent),
    Chat {
        from: Option<ClientId>,
        private: bool,
        message: ChatRequest,
    },
    SearchResult {
        from: Option<ClientId>,
        keyword: String,
        files: Vec<FileInfo>,
    },
    TransferProgress {
        transfer: TransferId,
        direction: Direction,
        bytes: u64,
        total: u64,
    },
    TransferFinished {
        transfer: TransferId,
        direction: Direction,
    },
    TransferFailed {
        transfer: TransferId,
        direction: Direction,
        reason: String,
    },
    Warning(String),
}

/// Sending half of the event channel.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ClientEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ClientEvent>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: ClientEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }

    /// Queue `event` without waiting. Used on the tunnel, which must keep
    /// answering the router even when the host stops draining events.
    pub fn post(&self, event: ClientEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "Event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Event receiver dropped");
            }
        }
    }

    pub async fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(%message, "Client warning");
        self.emit(ClientEvent::Warning(message)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ClientState::Run.to_string(), "run");
        assert_eq!(
            ClientState::Sleep(Duration::from_millis(1500)).to_string(),
            "sleep(1500ms)"
        );
    }

    #[tokio::test]
    async fn test_emit_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        sink.emit(ClientEvent::State(ClientState::Start)).await;
        drop(rx);
        sink.warn("nobody listening").await;
    }

    #[tokio::test]
    async fn test_post_drops_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        sink.post(ClientEvent::State(ClientState::Start));
        sink.post(ClientEvent::State(ClientState::Run));
        assert_eq!(rx.recv().await, Some(ClientEvent::State(ClientState::Start)));
        assert!(rx.try_recv().is_err());
    }
}
