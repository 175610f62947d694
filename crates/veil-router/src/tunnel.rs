//! Relay channel to one client.
//!
//! A [`Tunnel`] is a cheap, cloneable handle. The socket itself is owned by a
//! pump task that writes one request at a time and waits for the client's
//! response; callers talk to the pump over an mpsc channel and get the reply
//! back on a oneshot. Closing a tunnel is the cancellation primitive: the pump
//! stops, the socket drops, and whoever spawned the pump cleans up.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use veil_shared::crypto::SessionCipher;
use veil_shared::envelope::{open, read_response, seal, write_frame, Frame, Request};
use veil_shared::{ClientId, Payload, SessionId, Status, VeilError};

const TUNNEL_QUEUE: usize = 64;

/// What gets forwarded to a client.
#[derive(Debug, Clone)]
pub struct Relay {
    pub origin: Option<ClientId>,
    pub targets: Vec<ClientId>,
    pub payloads: Vec<Payload>,
}

impl Relay {
    pub fn new(payloads: Vec<Payload>) -> Self {
        Self {
            origin: None,
            targets: Vec::new(),
            payloads,
        }
    }

    pub fn from_client(origin: ClientId, payloads: Vec<Payload>) -> Self {
        Self {
            origin: Some(origin),
            targets: Vec::new(),
            payloads,
        }
    }
}

/// The client's answer to a relayed request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: Status,
    pub payloads: Vec<Payload>,
}

pub struct TunnelCall {
    pub relay: Relay,
    pub reply: oneshot::Sender<Result<Reply, VeilError>>,
}

#[derive(Clone)]
pub struct Tunnel {
    client: ClientId,
    tx: mpsc::Sender<TunnelCall>,
    closed: Arc<watch::Sender<bool>>,
    timeout: Duration,
}

/// Receiving half handed to the pump (or to a test double).
pub struct TunnelReceiver {
    pub calls: mpsc::Receiver<TunnelCall>,
    pub closed: watch::Receiver<bool>,
}

impl Tunnel {
    pub fn new(client: ClientId, timeout: Duration) -> (Self, TunnelReceiver) {
        let (tx, calls) = mpsc::channel(TUNNEL_QUEUE);
        let (closed_tx, closed) = watch::channel(false);
        let tunnel = Self {
            client,
            tx,
            closed: Arc::new(closed_tx),
            timeout,
        };
        (tunnel, TunnelReceiver { calls, closed })
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Forward `relay` and wait for the client's reply.
    pub async fn call(&self, relay: Relay) -> Result<Reply, VeilError> {
        if self.is_closed() {
            return Err(gone(self.client));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(TunnelCall {
                relay,
                reply: reply_tx,
            })
            .await
            .map_err(|_| gone(self.client))?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(gone(self.client)),
            Err(_) => Err(VeilError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("tunnel to {} timed out", self.client.short()),
            ))),
        }
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }

    /// True when both handles drive the same pump.
    pub fn same(&self, other: &Tunnel) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("client", &self.client.short())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn gone(client: ClientId) -> VeilError {
    VeilError::Transport(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("tunnel to {} is closed", client.short()),
    ))
}

pub async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Drive a tunnel over `stream` until it is closed or the socket fails.
///
/// Between calls the client has nothing to say, so any read activity while
/// idle (EOF or stray bytes) ends the tunnel.
pub async fn pump<S>(
    stream: S,
    mut rx: TunnelReceiver,
    cipher: Arc<SessionCipher>,
    session: SessionId,
    client: ClientId,
    io_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut probe = [0u8; 1];
    loop {
        tokio::select! {
            _ = wait_closed(&mut rx.closed) => {
                debug!(client = %client.short(), "Tunnel closed");
                break;
            }
            read = reader.read(&mut probe) => {
                debug!(client = %client.short(), ?read, "Tunnel peer hung up");
                break;
            }
            call = rx.calls.recv() => {
                let Some(call) = call else { break };
                let result =
                    exchange(&mut reader, &mut writer, &cipher, &session, call.relay, io_timeout)
                        .await;
                let failed = result.is_err();
                if let Err(e) = &result {
                    warn!(client = %client.short(), error = %e, "Tunnel exchange failed");
                }
                let _ = call.reply.send(result);
                if failed {
                    break;
                }
            }
        }
    }

    // Fail whatever is still queued so no caller waits on a dead pump.
    rx.calls.close();
    while let Ok(call) = rx.calls.try_recv() {
        let _ = call.reply.send(Err(gone(client)));
    }
}

async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    cipher: &SessionCipher,
    session: &SessionId,
    relay: Relay,
    io_timeout: Duration,
) -> Result<Reply, VeilError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let body = seal(cipher, &relay.payloads)?;
    let request = Request {
        session_id: Some(session.clone()),
        origin: relay.origin,
        targets: relay.targets,
        body,
    };

    with_timeout(io_timeout, write_frame(writer, &Frame::Request(request))).await?;
    let response = with_timeout(io_timeout, read_response(reader)).await?;
    let payloads = open(cipher, &response.body)?;
    Ok(Reply {
        status: response.status,
        payloads,
    })
}

pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, VeilError>
where
    F: std::future::Future<Output = Result<T, VeilError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(VeilError::Transport(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "socket timeout",
        ))),
    }
}
