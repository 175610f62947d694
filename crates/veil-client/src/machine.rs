//! Connection state machine.
//!
//! `start → handshake → join → group → tunnel → run`, with any failure
//! taking the `sleep → restart` edge back to `handshake`. A restart presents
//! the previous session id so the router migrates it and our client id
//! survives. `quit` is terminal.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use veil_shared::protocol::{
    BrowseRequest, ChatRequest, MuteRequest, PingRequest, PingResponse, QuitRequest, RoomRequest,
    SearchRequest, TransferRequest, TunnelRequest,
};
use veil_shared::{ClientId, Payload, RoomId, RouterType, SessionId, Status, TransferId};

use crate::client::{ClientCommand, Reply};
use crate::config::ClientConfig;
use crate::connection::RouterConnection;
use crate::error::ClientError;
use crate::events::{ClientEvent, ClientState, EventSink};
use crate::handlers::Handlers;
use crate::transfer;

pub(crate) struct Machine {
    config: Arc<ClientConfig>,
    handlers: Arc<Handlers>,
    events: EventSink,
    commands: mpsc::Receiver<ClientCommand>,
    session: Option<SessionId>,
    client: Option<ClientId>,
    rooms: BTreeSet<RoomId>,
    message: Option<RouterConnection>,
    tunnel: Option<JoinHandle<()>>,
}

/// Hand `result` to the waiting caller. Returns true when the error means
/// the message connection is gone.
fn settle<T>(reply: Reply<T>, result: Result<T, ClientError>) -> bool {
    let lost = match &result {
        Err(e) if e.is_fatal() => {
            warn!(error = %e, "Message connection failed");
            true
        }
        _ => false,
    };
    let _ = reply.send(result);
    lost
}

fn ping_response(p: Payload) -> Option<PingResponse> {
    match p {
        Payload::PingResponse(r) => Some(r),
        _ => None,
    }
}

impl Machine {
    pub fn new(
        config: Arc<ClientConfig>,
        handlers: Arc<Handlers>,
        events: EventSink,
        commands: mpsc::Receiver<ClientCommand>,
    ) -> Self {
        let rooms = config.rooms.iter().cloned().collect();
        Self {
            config,
            handlers,
            events,
            commands,
            session: None,
            client: None,
            rooms,
            message: None,
            tunnel: None,
        }
    }

    pub async fn run(mut self) {
        let mut state = ClientState::Start;
        loop {
            debug!(%state, "Client state");
            self.events.emit(ClientEvent::State(state)).await;
            state = match state {
                ClientState::Start => ClientState::Handshake,
                ClientState::Handshake => self.handshake().await,
                ClientState::Join => self.join().await,
                ClientState::Group => self.group().await,
                ClientState::Tunnel => self.open_tunnel().await,
                ClientState::Run => self.serve().await,
                ClientState::Sleep(delay) => self.sleep(delay).await,
                ClientState::Restart => {
                    self.teardown();
                    ClientState::Handshake
                }
                ClientState::Quit => {
                    self.quit().await;
                    break;
                }
            };
        }
        info!("Client stopped");
    }

    fn retry(&self, step: &str, error: ClientError) -> ClientState {
        warn!(step, error = %error, delay = ?self.config.retry_delay, "Connection step failed, retrying");
        ClientState::Sleep(self.config.retry_delay)
    }

    // -----------------------------------------------------------------------
    // States
    // -----------------------------------------------------------------------

    async fn handshake(&mut self) -> ClientState {
        let params = self.config.handshake(RouterType::Message);
        match RouterConnection::connect(self.config.router_addr, &params, self.session.clone()).await {
            Ok(conn) => {
                self.session = Some(conn.session().clone());
                self.message = Some(conn);
                ClientState::Join
            }
            Err(e) => self.retry("handshake", e),
        }
    }

    async fn join(&mut self) -> ClientState {
        let Some(conn) = self.message.as_mut() else {
            return ClientState::Restart;
        };
        let request = Payload::JoinRequest(self.config.join_request());
        let result = conn
            .call(request, Vec::new(), "join", |p| match p {
                Payload::JoinResponse(r) => Some(r),
                _ => None,
            })
            .await;

        match result {
            Ok(joined) => {
                if self.client.is_some_and(|old| old != joined.client) {
                    info!(client = %joined.client.short(), "Router assigned a new client id");
                }
                self.client = Some(joined.client);
                info!(
                    client = %joined.client.short(),
                    name = %joined.name,
                    members = joined.members.len(),
                    "Joined group"
                );
                self.events
                    .emit(ClientEvent::Joined {
                        client: joined.client,
                        name: joined.name,
                        motd: joined.motd,
                        members: joined.members,
                        rooms: joined.rooms,
                    })
                    .await;
                ClientState::Group
            }
            Err(ClientError::Refused {
                status: Status::BadRequest,
                ..
            }) => {
                self.events
                    .warn("Router rejected the join request; check name, color and group")
                    .await;
                ClientState::Quit
            }
            Err(e) => self.retry("join", e),
        }
    }

    /// Rejoin the rooms we were in before a reconnect.
    async fn group(&mut self) -> ClientState {
        let Some(conn) = self.message.as_mut() else {
            return ClientState::Restart;
        };
        let mut dropped = Vec::new();
        for room in &self.rooms {
            let request = Payload::RoomRequest(RoomRequest::Join { room: room.clone() });
            match conn.request(Vec::new(), &[request], "room join").await {
                Ok(_) => debug!(%room, "Room joined"),
                Err(e) if e.is_fatal() => return self.retry("group", e),
                Err(e) => {
                    warn!(%room, error = %e, "Room join refused");
                    dropped.push(room.clone());
                }
            }
        }
        for room in dropped {
            self.rooms.remove(&room);
        }
        ClientState::Tunnel
    }

    /// Open a second connection and turn it into our relay channel.
    async fn open_tunnel(&mut self) -> ClientState {
        let Some(session) = self.session.clone() else {
            return ClientState::Restart;
        };
        let params = self.config.handshake(RouterType::Message);
        let mut conn = match RouterConnection::connect(self.config.router_addr, &params, None).await {
            Ok(conn) => conn,
            Err(e) => return self.retry("tunnel", e),
        };
        let request = Payload::TunnelRequest(TunnelRequest { session });
        if let Err(e) = conn.request(Vec::new(), &[request], "tunnel").await {
            return self.retry("tunnel", e);
        }

        info!("Tunnel open");
        self.tunnel = Some(tokio::spawn(self.handlers.clone().serve(conn)));
        ClientState::Run
    }

    /// Execute host commands on the message connection while the tunnel
    /// task answers the router. Shortly after entering, check once that the
    /// router can reach us over the tunnel.
    async fn serve(&mut self) -> ClientState {
        let Some(mut tunnel) = self.tunnel.take() else {
            return ClientState::Restart;
        };
        let reverse_ping = tokio::time::sleep(self.config.reverse_ping_delay);
        tokio::pin!(reverse_ping);
        let mut pinged = false;

        let next = loop {
            tokio::select! {
                _ = &mut reverse_ping, if !pinged => {
                    pinged = true;
                    self.reverse_ping().await;
                }
                _ = &mut tunnel => {
                    self.events.warn("Tunnel to the router was lost").await;
                    break ClientState::Sleep(self.config.retry_delay);
                }
                command = self.commands.recv() => match command {
                    None | Some(ClientCommand::Quit) => break ClientState::Quit,
                    Some(command) => {
                        if self.execute(command).await {
                            break ClientState::Sleep(self.config.retry_delay);
                        }
                    }
                },
            }
        };

        self.tunnel = Some(tunnel);
        next
    }

    /// Wait out the retry delay. Only `Quit` is honoured meanwhile.
    async fn sleep(&mut self, delay: Duration) -> ClientState {
        self.teardown();
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return ClientState::Restart,
                command = self.commands.recv() => match command {
                    None | Some(ClientCommand::Quit) => return ClientState::Quit,
                    Some(command) => command.reject(),
                },
            }
        }
    }

    async fn quit(&mut self) {
        if let Some(conn) = self.message.as_mut() {
            let request = Payload::QuitRequest(QuitRequest {});
            if let Err(e) = conn.request(Vec::new(), &[request], "quit").await {
                debug!(error = %e, "Quit not acknowledged");
            }
        }
        self.teardown();
        self.session = None;
        self.client = None;
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject();
        }
    }

    fn teardown(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.abort();
        }
        self.message = None;
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn reverse_ping(&mut self) {
        let Some(conn) = self.message.as_mut() else {
            return;
        };
        let request = Payload::PingRequest(PingRequest { reverse: true });
        let result = conn.call(request, Vec::new(), "reverse ping", ping_response).await;
        match result {
            Ok(PingResponse {
                reverse: Some(Status::Ok),
            }) => debug!("Reverse ping answered"),
            Ok(PingResponse { reverse }) => {
                let status = reverse.unwrap_or(Status::None);
                self.events
                    .warn(format!("Router cannot reach this client ({status}); chat delivery will fail"))
                    .await;
            }
            Err(e) => self.events.warn(format!("Reverse ping failed: {e}")).await,
        }
    }

    /// Run one host command. Returns true when the message connection was
    /// lost and the machine must reconnect.
    async fn execute(&mut self, command: ClientCommand) -> bool {
        let Some(conn) = self.message.as_mut() else {
            command.reject();
            return true;
        };

        match command {
            ClientCommand::Chat {
                text,
                room,
                to,
                reply,
            } => {
                let mut chat = ChatRequest::new(text);
                chat.room = room;
                let result = conn
                    .request(to, &[Payload::ChatRequest(chat)], "chat")
                    .await
                    .map(drop);
                settle(reply, result)
            }
            ClientCommand::Room { request, reply } => {
                let result = conn
                    .call(Payload::RoomRequest(request.clone()), Vec::new(), "room", |p| match p {
                        Payload::RoomResponse(r) => Some(r),
                        _ => None,
                    })
                    .await;
                if result.is_ok() {
                    match request {
                        RoomRequest::Join { room } => {
                            self.rooms.insert(room);
                        }
                        RoomRequest::Quit { room } => {
                            self.rooms.remove(&room);
                        }
                        RoomRequest::Browse => {}
                    }
                }
                settle(reply, result)
            }
            ClientCommand::Mute {
                client,
                mute,
                reply,
            } => {
                let request = Payload::MuteRequest(MuteRequest { client, mute });
                let result = conn.request(Vec::new(), &[request], "mute").await.map(drop);
                settle(reply, result)
            }
            ClientCommand::Search { keyword, reply } => {
                let request = Payload::SearchRequest(SearchRequest { keyword });
                let result = conn.request(Vec::new(), &[request], "search").await.map(drop);
                settle(reply, result)
            }
            ClientCommand::Browse {
                client,
                path,
                reply,
            } => {
                let request = Payload::BrowseRequest(BrowseRequest { path });
                let result = conn
                    .call(request, vec![client], "browse", |p| match p {
                        Payload::BrowseResponse(r) => Some(r.files),
                        _ => None,
                    })
                    .await;
                settle(reply, result)
            }
            ClientCommand::Download {
                from,
                file,
                sink,
                reply,
            } => {
                let request = Payload::TransferRequest(TransferRequest {
                    transfer: TransferId::new(),
                    file: file.clone(),
                });
                let result = conn
                    .call(request, vec![from], "transfer", |p| match p {
                        Payload::TransferResponse(r) => Some(r.transfer),
                        _ => None,
                    })
                    .await;
                if let Ok(transfer) = &result {
                    tokio::spawn(transfer::download(
                        self.config.clone(),
                        self.events.clone(),
                        *transfer,
                        file,
                        sink,
                    ));
                }
                settle(reply, result)
            }
            ClientCommand::Ping { reverse, reply } => {
                let request = Payload::PingRequest(PingRequest { reverse });
                let result = conn.call(request, Vec::new(), "ping", ping_response).await;
                settle(reply, result)
            }
            ClientCommand::Quit => false,
        }
    }
}
