use tracing::debug;
use veil_shared::protocol::TunnelRequest;
use veil_shared::{ClientId, RouterType, VeilError};

use super::Connection;
use crate::context::RouterContext;

/// Resolve the client that owns `req.session`. The connection loop turns
/// this socket into that client's relay channel once it has answered.
pub async fn handle(
    ctx: &RouterContext,
    conn: &Connection,
    req: TunnelRequest,
) -> Result<ClientId, VeilError> {
    conn.require_role(RouterType::Message)?;
    req.validate()?;
    if req.session == conn.session {
        return Err(VeilError::validation(
            "the message session cannot be its own tunnel",
        ));
    }
    let client = ctx
        .sessions
        .client_of(&req.session)
        .await
        .ok_or_else(|| VeilError::not_found(format!("session {} has no client", req.session.short())))?;
    if !ctx.directory.contains(&client).await {
        return Err(VeilError::not_found(format!("client {}", client.short())));
    }
    debug!(client = %client.short(), "Tunnel requested");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::join;
    use crate::commands::tests::{context, join_request, message_conn};
    use veil_shared::crypto::SessionCipher;
    use veil_shared::constants::DEFAULT_CIPHER;
    use veil_shared::{SessionId, Status};

    #[tokio::test]
    async fn test_tunnel_resolves_joined_session() {
        let ctx = context();
        let cipher = || SessionCipher::new(DEFAULT_CIPHER, &[3u8; 32]).unwrap();

        let allocated = ctx.sessions.allocate(cipher(), RouterType::Message, None).await;
        let mut message = message_conn();
        message.session = allocated.id.clone();
        join::handle(&ctx, &mut message, join_request("alice"))
            .await
            .unwrap();

        let tunnel_session = ctx.sessions.allocate(cipher(), RouterType::Message, None).await;
        let mut conn = message_conn();
        conn.session = tunnel_session.id;
        let client = handle(
            &ctx,
            &conn,
            TunnelRequest {
                session: allocated.id,
            },
        )
        .await
        .unwrap();
        assert_eq!(Some(client), message.client);
    }

    #[tokio::test]
    async fn test_tunnel_for_unknown_session() {
        let ctx = context();
        let err = handle(
            &ctx,
            &message_conn(),
            TunnelRequest {
                session: SessionId::random(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }

    #[tokio::test]
    async fn test_tunnel_for_non_hex_session_is_rejected() {
        let ctx = context();
        let err = handle(
            &ctx,
            &message_conn(),
            TunnelRequest {
                session: SessionId("aaaaaaa€".into()),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
    }
}
