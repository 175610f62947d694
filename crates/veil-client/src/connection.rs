//! One negotiated connection to a router.
//!
//! [`RouterConnection::connect`] runs the plaintext handshake; afterwards
//! every body is sealed under the session cipher. The same type serves both
//! directions: [`RouterConnection::request`] for calls we make, and
//! [`RouterConnection::next_request`] / [`RouterConnection::respond`] once the
//! connection has been turned into a tunnel and the router speaks first.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;
use veil_shared::codec::{pack, unpack};
use veil_shared::crypto::SessionCipher;
use veil_shared::envelope::{open, read_request, read_response, seal, write_frame, Frame, Request, Response};
use veil_shared::handshake::Initiator;
use veil_shared::{ClientId, Payload, RouterType, SessionId, Status, VeilError};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy)]
pub struct HandshakeParams {
    pub router_type: RouterType,
    pub prime_size: u32,
    pub key_size: u32,
    pub weak_prime_threshold: u32,
    pub timeout: Duration,
}

pub struct RouterConnection {
    stream: TcpStream,
    cipher: SessionCipher,
    session: SessionId,
    timeout: Duration,
}

impl RouterConnection {
    /// Connect and negotiate a session. `previous` asks the router to
    /// migrate a session we held before a reconnect.
    pub async fn connect(
        addr: SocketAddr,
        params: &HandshakeParams,
        previous: Option<SessionId>,
    ) -> Result<Self, ClientError> {
        let mut stream = with_timeout(params.timeout, async {
            TcpStream::connect(addr).await.map_err(VeilError::from)
        })
        .await?;
        let _ = stream.set_nodelay(true);

        let initiator = Initiator::new(
            params.router_type,
            params.prime_size,
            params.key_size,
            params.weak_prime_threshold,
            previous,
        );
        let body = pack(&[Payload::HandshakeRequest(initiator.request().clone())])?;
        let frame = Frame::Request(Request::new(None, body));
        with_timeout(params.timeout, write_frame(&mut stream, &frame)).await?;

        let response = with_timeout(params.timeout, read_response(&mut stream)).await?;
        if !response.status.is_ok() {
            return Err(ClientError::Refused {
                status: response.status,
                what: "handshake",
            });
        }
        let accepted = unpack(&response.body)?
            .into_iter()
            .find_map(|p| match p {
                Payload::HandshakeResponse(r) => Some(r),
                _ => None,
            })
            .ok_or(ClientError::Unexpected("handshake"))?;
        let established = initiator.complete(&accepted)?;

        debug!(
            %addr,
            router_type = %params.router_type,
            session = %established.session_id.short(),
            "Session negotiated"
        );
        Ok(Self {
            stream,
            cipher: established.cipher,
            session: established.session_id,
            timeout: params.timeout,
        })
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Send `payloads` and wait for the answer. A non-ok status becomes
    /// [`ClientError::Refused`].
    pub async fn request(
        &mut self,
        targets: Vec<ClientId>,
        payloads: &[Payload],
        what: &'static str,
    ) -> Result<Vec<Payload>, ClientError> {
        let body = seal(&self.cipher, payloads)?;
        let frame = Frame::Request(Request::new(Some(self.session.clone()), body).with_targets(targets));
        with_timeout(self.timeout, write_frame(&mut self.stream, &frame)).await?;

        let response = with_timeout(self.timeout, read_response(&mut self.stream)).await?;
        if !response.status.is_ok() {
            return Err(ClientError::Refused {
                status: response.status,
                what,
            });
        }
        Ok(open(&self.cipher, &response.body)?)
    }

    /// Single-payload request whose answer must contain a payload `pick`
    /// accepts.
    pub async fn call<T>(
        &mut self,
        payload: Payload,
        targets: Vec<ClientId>,
        what: &'static str,
        pick: impl Fn(Payload) -> Option<T>,
    ) -> Result<T, ClientError> {
        let answer = self.request(targets, &[payload], what).await?;
        answer
            .into_iter()
            .find_map(pick)
            .ok_or(ClientError::Unexpected(what))
    }

    /// Wait for the router's next relayed request. No timeout: a tunnel may
    /// sit idle indefinitely. `Ok(None)` means the router closed it.
    pub async fn next_request(&mut self) -> Result<Option<(Request, Vec<Payload>)>, ClientError> {
        let Some(request) = read_request(&mut self.stream).await? else {
            return Ok(None);
        };
        if request.session_id.as_ref() != Some(&self.session) {
            return Err(VeilError::Corrupted("request for a foreign session".into()).into());
        }
        let payloads = open(&self.cipher, &request.body)?;
        Ok(Some((request, payloads)))
    }

    pub async fn respond(&mut self, status: Status, payloads: &[Payload]) -> Result<(), ClientError> {
        let body = if status.is_ok() {
            seal(&self.cipher, payloads)?
        } else {
            Vec::new()
        };
        let frame = Frame::Response(Response::new(status, body));
        with_timeout(self.timeout, write_frame(&mut self.stream, &frame)).await
    }
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, VeilError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "router did not answer in time",
        )
        .into()),
    }
}
