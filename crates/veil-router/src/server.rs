//! Connection lifecycle.
//!
//! Every accepted socket starts with a plaintext handshake frame. After that
//! each request body is sealed under the session cipher and answered with one
//! sealed response. A `TunnelRequest` ends the request loop and hands the
//! socket to a tunnel pump; from then on the router speaks first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use veil_shared::codec::{pack, unpack};
use veil_shared::crypto::SessionCipher;
use veil_shared::envelope::{open, read_request, seal, write_frame, Frame, Request, Response};
use veil_shared::protocol::PingRequest;
use veil_shared::{ClientId, Payload, RouterType, SessionId, Status, VeilError};

use crate::commands::{self, Action, Connection};
use crate::context::RouterContext;
use crate::tunnel::{pump, with_timeout, Relay, Tunnel, TunnelReceiver};

/// Why the request loop stopped.
enum Exit {
    /// Peer closed the socket.
    Closed,
    /// A newer connection migrated this session.
    Superseded,
    Quit,
    Tunnel {
        client: ClientId,
        tunnel: Tunnel,
        rx: TunnelReceiver,
    },
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, ctx: RouterContext) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(
        %addr,
        message = ctx.config.message_router,
        transfer = ctx.config.transfer_router,
        "Router listening"
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(ctx, stream, peer).await {
                debug!(%peer, error = %e, "Connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    ctx: RouterContext,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), VeilError> {
    let _ = stream.set_nodelay(true);
    let Some((mut conn, cipher)) = negotiate(&ctx, &mut stream).await? else {
        return Ok(());
    };
    debug!(%peer, session = %conn.session.short(), "Session opened");

    let exit = serve_requests(&ctx, &mut stream, &mut conn, &cipher).await;
    match exit {
        Ok(Exit::Tunnel { client, tunnel, rx }) => {
            info!(%peer, client = %client.short(), "Tunnel open");
            pump(
                stream,
                rx,
                cipher,
                conn.session.clone(),
                client,
                ctx.config.socket_timeout,
            )
            .await;
            if ctx.directory.clear_tunnel(&client, &tunnel).await {
                info!(client = %client.short(), "Tunnel lost, removing client");
                ctx.drop_client(&client).await;
            }
            ctx.sessions.retire(&conn.session).await;
            Ok(())
        }
        Ok(Exit::Quit) | Ok(Exit::Superseded) => Ok(()),
        Ok(Exit::Closed) => {
            release(&ctx, &conn).await;
            Ok(())
        }
        Err(e) => {
            release(&ctx, &conn).await;
            Err(e)
        }
    }
}

/// A message session with a client stays around for migration; anything
/// else has no state worth keeping.
async fn release(ctx: &RouterContext, conn: &Connection) {
    if conn.router_type == RouterType::Message && conn.client.is_some() {
        ctx.sessions.disconnect(&conn.session).await;
    } else {
        ctx.sessions.retire(&conn.session).await;
    }
}

/// Handshake phase. `Ok(None)` means the peer left or was refused.
async fn negotiate(
    ctx: &RouterContext,
    stream: &mut TcpStream,
) -> Result<Option<(Connection, Arc<SessionCipher>)>, VeilError> {
    let timeout = ctx.config.socket_timeout;
    let Some(request) = with_timeout(timeout, read_request(stream)).await? else {
        return Ok(None);
    };

    let req = match unpack(&request.body)?.into_iter().next() {
        Some(Payload::HandshakeRequest(req)) => req,
        Some(other) => {
            debug!(kind = ?other.kind(), "Expected a handshake");
            refuse(ctx, stream, Status::BadRequest).await?;
            return Ok(None);
        }
        None => {
            refuse(ctx, stream, Status::BadRequest).await?;
            return Ok(None);
        }
    };

    match commands::handshake::handle(ctx, req).await {
        Ok(negotiated) => {
            let body = pack(&[Payload::HandshakeResponse(negotiated.response)])?;
            let frame = Frame::Response(Response::new(Status::Ok, body));
            with_timeout(timeout, write_frame(stream, &frame)).await?;
            Ok(Some((negotiated.conn, negotiated.cipher)))
        }
        Err(e) => {
            warn!(error = %e, "Handshake refused");
            refuse(ctx, stream, e.status()).await?;
            Ok(None)
        }
    }
}

async fn refuse(ctx: &RouterContext, stream: &mut TcpStream, status: Status) -> Result<(), VeilError> {
    let frame = Frame::Response(Response::status(status));
    with_timeout(ctx.config.socket_timeout, write_frame(stream, &frame)).await
}

/// Wait for the next request. Each `sweep_interval` of silence the session
/// is looked up again; once the sweeper has expired it the connection ends.
async fn next_request(
    ctx: &RouterContext,
    stream: &mut TcpStream,
    session: &SessionId,
) -> Result<Option<Request>, VeilError> {
    let period = ctx.config.sweep_interval.max(Duration::from_millis(10));
    loop {
        tokio::select! {
            ready = stream.readable() => {
                ready?;
                return read_request(stream).await;
            }
            _ = tokio::time::sleep(period) => {
                if !ctx.sessions.contains(session).await {
                    debug!(session = %session.short(), "Session expired, closing connection");
                    return Ok(None);
                }
            }
        }
    }
}

async fn serve_requests(
    ctx: &RouterContext,
    stream: &mut TcpStream,
    conn: &mut Connection,
    cipher: &SessionCipher,
) -> Result<Exit, VeilError> {
    let timeout = ctx.config.socket_timeout;

    loop {
        let Some(request) = next_request(ctx, stream, &conn.session).await? else {
            return Ok(Exit::Closed);
        };
        if !ctx.sessions.touch(&conn.session).await {
            debug!(session = %conn.session.short(), "Session superseded");
            return Ok(Exit::Superseded);
        }
        if request.session_id.as_ref() != Some(&conn.session) {
            return Err(VeilError::Corrupted("request for a foreign session".into()));
        }

        let payloads = open(cipher, &request.body)?;
        let dispatched = match commands::dispatch(ctx, conn, &request.targets, payloads).await {
            Ok(dispatched) => dispatched,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!(session = %conn.session.short(), error = %e, "Request failed");
                let frame = Frame::Response(Response::status(e.status()));
                with_timeout(timeout, write_frame(stream, &frame)).await?;
                continue;
            }
        };

        let exit = match dispatched.action {
            Action::Continue => None,
            Action::Quit => Some(Exit::Quit),
            Action::Tunnel(client) => {
                let (tunnel, rx) = Tunnel::new(client, timeout);
                if let Err(e) = ctx.directory.set_tunnel(&client, tunnel.clone()).await {
                    let frame = Frame::Response(Response::status(e.status()));
                    with_timeout(timeout, write_frame(stream, &frame)).await?;
                    continue;
                }
                Some(Exit::Tunnel { client, tunnel, rx })
            }
        };

        let body = seal(cipher, &dispatched.payloads)?;
        let frame = Frame::Response(Response::new(Status::Ok, body));
        with_timeout(timeout, write_frame(stream, &frame)).await?;

        if let Some(exit) = exit {
            return Ok(exit);
        }
    }
}

/// Periodic cleanup of expired sessions, idle transfers, stale guard
/// records and clients that never opened a tunnel.
pub fn spawn_sweeper(ctx: RouterContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = ctx.config.sweep_interval.max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep(&ctx).await;
        }
    })
}

pub async fn sweep(ctx: &RouterContext) {
    let unreachable = ping_tunnels(ctx).await;

    let expired = ctx.sessions.sweep(ctx.config.session_timeout).await;
    for session in &expired {
        debug!(
            session = %session.id.short(),
            connected = session.connected,
            "Session expired"
        );
        if let Some(client) = session.client {
            ctx.drop_client(&client).await;
        }
    }

    let evicted = ctx.transfers.sweep(ctx.config.transfer_timeout).await;
    ctx.guard.purge_stale().await;

    let orphans = ctx.directory.without_tunnel(ctx.config.client_timeout).await;
    for client in &orphans {
        info!(client = %client.short(), "Client never opened a tunnel, removing");
        ctx.drop_client(client).await;
    }

    if !expired.is_empty() || evicted > 0 || !orphans.is_empty() || unreachable > 0 {
        info!(
            tunnels = unreachable,
            sessions = expired.len(),
            transfers = evicted,
            clients = orphans.len(),
            "Sweep complete"
        );
    }
}

/// Ping every tunnel. An answer keeps the client's sessions fresh; a tunnel
/// that does not answer is closed, which drops its client. Returns how many
/// were closed.
async fn ping_tunnels(ctx: &RouterContext) -> usize {
    let tunnels = ctx.directory.tunnels().await;
    let pings = tunnels.into_iter().map(|tunnel| async move {
        let relay = Relay::new(vec![Payload::PingRequest(PingRequest::default())]);
        match tunnel.call(relay).await {
            Ok(_) => {
                ctx.sessions.touch_client(&tunnel.client()).await;
                true
            }
            Err(e) => {
                warn!(client = %tunnel.client().short(), error = %e, "Keepalive ping failed");
                tunnel.close();
                false
            }
        }
    });
    futures::future::join_all(pings)
        .await
        .into_iter()
        .filter(|alive| !alive)
        .count()
}
