//! Request handlers, one sub-module per command family.
//!
//! [`dispatch`] runs every payload of a request in order and stops at the
//! first error; the connection loop turns that error into a response status.

pub mod browse;
pub mod chat;
pub mod handshake;
pub mod join;
pub mod mute;
pub mod ping;
pub mod quit;
pub mod room;
pub mod search;
pub mod transfer;
pub mod tunnel;

use tracing::{debug, info};
use veil_shared::{ClientId, Payload, RouterType, SessionId, VeilError};

use crate::context::RouterContext;
use crate::guard::Verdict;

/// Per-connection state the handlers read and update.
#[derive(Debug, Clone)]
pub struct Connection {
    pub session: SessionId,
    pub router_type: RouterType,
    /// Set once the session has joined (or was migrated with a client).
    pub client: Option<ClientId>,
}

impl Connection {
    pub fn require_role(&self, role: RouterType) -> Result<(), VeilError> {
        if self.router_type == role {
            Ok(())
        } else {
            Err(VeilError::Unsupported(format!(
                "not available on a {} session",
                self.router_type
            )))
        }
    }

    pub fn require_client(&self) -> Result<ClientId, VeilError> {
        self.client
            .ok_or_else(|| VeilError::not_found("session has not joined"))
    }
}

/// What the connection loop does after answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    /// Hand the socket over to a relay channel for this client.
    Tunnel(ClientId),
    Quit,
}

#[derive(Debug)]
pub struct Dispatched {
    pub payloads: Vec<Payload>,
    pub action: Action,
}

pub async fn dispatch(
    ctx: &RouterContext,
    conn: &mut Connection,
    targets: &[ClientId],
    payloads: Vec<Payload>,
) -> Result<Dispatched, VeilError> {
    let mut out = Vec::new();
    let mut action = Action::Continue;

    for payload in payloads {
        match payload {
            Payload::JoinRequest(req) => out.extend(join::handle(ctx, conn, req).await?),
            Payload::PingRequest(req) => out.extend(ping::handle(ctx, conn, req).await?),
            Payload::RoomRequest(req) => out.extend(room::handle(ctx, conn, req).await?),
            Payload::MuteRequest(req) => out.extend(mute::handle(ctx, conn, req).await?),
            Payload::ChatRequest(req) => out.extend(chat::handle(ctx, conn, targets, req).await?),
            Payload::BrowseRequest(req) => {
                out.extend(browse::handle(ctx, conn, targets, req).await?)
            }
            Payload::SearchRequest(req) => out.extend(search::handle(ctx, conn, req).await?),
            Payload::TransferRequest(req) => {
                out.extend(transfer::request(ctx, conn, targets, req).await?)
            }
            Payload::UploadRequest(req) => out.extend(transfer::upload(ctx, conn, req).await?),
            Payload::DownloadRequest(req) => {
                out.extend(transfer::download(ctx, conn, req).await?)
            }
            Payload::TunnelRequest(req) => {
                action = Action::Tunnel(tunnel::handle(ctx, conn, req).await?);
            }
            Payload::QuitRequest(_) => {
                quit::handle(ctx, conn).await?;
                action = Action::Quit;
            }
            Payload::HandshakeRequest(_) => {
                return Err(VeilError::validation("session already negotiated"));
            }
            other => {
                return Err(VeilError::validation(format!(
                    "{:?} is not a request",
                    other.kind()
                )));
            }
        }
        if action != Action::Continue {
            break;
        }
    }

    Ok(Dispatched {
        payloads: out,
        action,
    })
}

/// Run the abuse guard for `client`. A client that just tripped it is
/// flagged as a troll. Returns true when the request may proceed.
pub async fn guarded(ctx: &RouterContext, client: ClientId) -> bool {
    match ctx.guard.check(client).await {
        Verdict::Allow => true,
        Verdict::Suppress { fresh: true } => {
            if ctx.directory.set_troll(&client, true).await.is_some() {
                info!(client = %client.short(), "Client flagged as troll");
            }
            false
        }
        Verdict::Suppress { fresh: false } => {
            debug!(client = %client.short(), "Suppressed request dropped");
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use veil_shared::Status;

    use veil_shared::protocol::{JoinRequest, Preferences};
    use veil_shared::GroupId;

    use crate::config::RouterConfig;
    use crate::tunnel::tests::{fake_tunnel, ok_reply};
    use crate::tunnel::{Relay, Reply};

    pub(crate) fn context() -> RouterContext {
        RouterContext::new(RouterConfig {
            spam_threshold: 3,
            spam_window: Duration::from_secs(60),
            ..RouterConfig::default()
        })
    }

    pub(crate) fn join_request(name: &str) -> JoinRequest {
        JoinRequest {
            name: name.to_string(),
            color: "#336699".to_string(),
            group: GroupId::default(),
            passphrase: None,
            share: true,
            prefs: Preferences::default(),
        }
    }

    pub(crate) fn message_conn() -> Connection {
        Connection {
            session: SessionId::random(),
            router_type: RouterType::Message,
            client: None,
        }
    }

    /// Join `name` and attach a tunnel answered by `respond`.
    pub(crate) async fn joined<F>(ctx: &RouterContext, name: &str, respond: F) -> Connection
    where
        F: Fn(Relay) -> Result<Reply, VeilError> + Send + 'static,
    {
        let mut conn = message_conn();
        join::handle(ctx, &mut conn, join_request(name)).await.unwrap();
        let client = conn.client.unwrap();
        ctx.directory
            .set_tunnel(&client, fake_tunnel(client, respond))
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_dispatch_rejects_response_payloads() {
        let ctx = context();
        let mut conn = joined(&ctx, "alice", |_| ok_reply()).await;
        let err = dispatch(
            &ctx,
            &mut conn,
            &[],
            vec![Payload::PingResponse(Default::default())],
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn test_dispatch_answers_each_payload_in_order() {
        let ctx = context();
        let mut conn = message_conn();
        let out = dispatch(
            &ctx,
            &mut conn,
            &[],
            vec![
                Payload::JoinRequest(join_request("bob")),
                Payload::PingRequest(Default::default()),
            ],
        )
        .await
        .unwrap();
        assert_eq!(out.action, Action::Continue);
        assert_eq!(out.payloads.len(), 2);
        assert!(matches!(out.payloads[0], Payload::JoinResponse(_)));
        assert!(matches!(out.payloads[1], Payload::PingResponse(_)));
    }

    #[tokio::test]
    async fn test_transfer_commands_need_transfer_session() {
        let ctx = context();
        let mut conn = joined(&ctx, "carol", |_| ok_reply()).await;
        let err = dispatch(
            &ctx,
            &mut conn,
            &[],
            vec![Payload::DownloadRequest(veil_shared::protocol::DownloadRequest {
                transfer: veil_shared::TransferId::new(),
                file_size: 10,
                acks: Vec::new(),
            })],
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), Status::NotImplemented);
    }

    #[tokio::test]
    async fn test_guard_flags_troll_once() {
        let ctx = context();
        let conn = joined(&ctx, "dave", |_| ok_reply()).await;
        let client = conn.client.unwrap();
        for _ in 0..3 {
            assert!(guarded(&ctx, client).await);
        }
        assert!(!guarded(&ctx, client).await);
        assert!(ctx.directory.member(&client).await.unwrap().troll);
        assert!(!guarded(&ctx, client).await);
    }
}
