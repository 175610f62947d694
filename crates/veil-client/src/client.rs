//! Host-facing handle.
//!
//! The connection state machine runs in its own task. A [`ClientHandle`]
//! queues commands for it, each carrying a oneshot sender for its result.
//! Asynchronous traffic (chat, presence, search hits, transfer progress)
//! arrives on the event receiver returned by [`Client::spawn`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use veil_shared::protocol::{FileInfo, PingResponse, RoomRequest, RoomResponse};
use veil_shared::{ClientId, RoomId, TransferId};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{ClientEvent, EventSink};
use crate::handlers::Handlers;
use crate::machine::Machine;
use crate::share::{ChunkSink, ShareStore};

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// Work queued for the client task by a [`ClientHandle`].
pub(crate) enum ClientCommand {
    /// Group chat, room chat (`room`), or a private message (`to` non-empty).
    Chat {
        text: String,
        room: Option<RoomId>,
        to: Vec<ClientId>,
        reply: Reply<()>,
    },
    Room {
        request: RoomRequest,
        reply: Reply<RoomResponse>,
    },
    Mute {
        client: ClientId,
        mute: bool,
        reply: Reply<()>,
    },
    /// Hits arrive later as [`ClientEvent::SearchResult`].
    Search {
        keyword: String,
        reply: Reply<()>,
    },
    Browse {
        client: ClientId,
        path: String,
        reply: Reply<Vec<FileInfo>>,
    },
    Download {
        from: ClientId,
        file: FileInfo,
        sink: Box<dyn ChunkSink>,
        reply: Reply<TransferId>,
    },
    Ping {
        reverse: bool,
        reply: Reply<PingResponse>,
    },
    Quit,
}

fn refuse<T>(reply: Reply<T>) {
    let _ = reply.send(Err(ClientError::NotConnected));
}

impl ClientCommand {
    /// Answer a command that cannot run because there is no connection.
    pub(crate) fn reject(self) {
        match self {
            ClientCommand::Chat { reply, .. }
            | ClientCommand::Mute { reply, .. }
            | ClientCommand::Search { reply, .. } => refuse(reply),
            ClientCommand::Room { reply, .. } => refuse(reply),
            ClientCommand::Browse { reply, .. } => refuse(reply),
            ClientCommand::Download { reply, .. } => refuse(reply),
            ClientCommand::Ping { reply, .. } => refuse(reply),
            ClientCommand::Quit => {}
        }
    }
}

pub struct Client;

impl Client {
    /// Start the client task. Files are served from `store` when
    /// `config.share` is set.
    pub fn spawn(
        config: ClientConfig,
        store: Arc<dyn ShareStore>,
    ) -> (ClientHandle, mpsc::Receiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

        let config = Arc::new(config);
        let events = EventSink::new(event_tx);
        let handlers = Arc::new(Handlers {
            config: config.clone(),
            store,
            events: events.clone(),
        });
        let machine = Machine::new(config, handlers, events, cmd_rx);
        tokio::spawn(machine.run());

        (ClientHandle { tx: cmd_tx }, event_rx)
    }
}

#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientCommand>,
}

impl ClientHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> ClientCommand) -> Result<T, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ClientError::Stopped)?;
        reply_rx.await.map_err(|_| ClientError::Stopped)?
    }

    pub async fn chat(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| ClientCommand::Chat {
            text,
            room: None,
            to: Vec::new(),
            reply,
        })
        .await
    }

    pub async fn chat_room(&self, room: RoomId, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| ClientCommand::Chat {
            text,
            room: Some(room),
            to: Vec::new(),
            reply,
        })
        .await
    }

    pub async fn whisper(&self, to: ClientId, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| ClientCommand::Chat {
            text,
            room: None,
            to: vec![to],
            reply,
        })
        .await
    }

    pub async fn rooms(&self) -> Result<RoomResponse, ClientError> {
        self.request(|reply| ClientCommand::Room {
            request: RoomRequest::Browse,
            reply,
        })
        .await
    }

    /// Join `room`. It is joined again automatically after a reconnect.
    pub async fn join_room(&self, room: RoomId) -> Result<RoomResponse, ClientError> {
        self.request(|reply| ClientCommand::Room {
            request: RoomRequest::Join { room },
            reply,
        })
        .await
    }

    pub async fn leave_room(&self, room: RoomId) -> Result<RoomResponse, ClientError> {
        self.request(|reply| ClientCommand::Room {
            request: RoomRequest::Quit { room },
            reply,
        })
        .await
    }

    pub async fn mute(&self, client: ClientId, mute: bool) -> Result<(), ClientError> {
        self.request(|reply| ClientCommand::Mute {
            client,
            mute,
            reply,
        })
        .await
    }

    pub async fn search(&self, keyword: impl Into<String>) -> Result<(), ClientError> {
        let keyword = keyword.into();
        self.request(|reply| ClientCommand::Search { keyword, reply })
            .await
    }

    pub async fn browse(&self, client: ClientId, path: impl Into<String>) -> Result<Vec<FileInfo>, ClientError> {
        let path = path.into();
        self.request(|reply| ClientCommand::Browse {
            client,
            path,
            reply,
        })
        .await
    }

    /// Ask `from` to upload `file` and stream it into `sink`. Returns once
    /// the transfer is announced; completion arrives as an event.
    pub async fn download(
        &self,
        from: ClientId,
        file: FileInfo,
        sink: Box<dyn ChunkSink>,
    ) -> Result<TransferId, ClientError> {
        self.request(|reply| ClientCommand::Download {
            from,
            file,
            sink,
            reply,
        })
        .await
    }

    pub async fn ping(&self, reverse: bool) -> Result<PingResponse, ClientError> {
        self.request(|reply| ClientCommand::Ping { reverse, reply })
            .await
    }

    /// Leave the router and stop the client task.
    pub async fn quit(&self) {
        if self.tx.send(ClientCommand::Quit).await.is_ok() {
            self.tx.closed().await;
        }
    }
}
