use tracing::{debug, warn};
use veil_shared::protocol::{PingRequest, PingResponse};
use veil_shared::{Payload, RouterType, Status, VeilError};

use super::Connection;
use crate::context::RouterContext;
use crate::tunnel::Relay;

/// Liveness probe. With `reverse`, the router pings the caller back over its
/// tunnel and reports how that went.
pub async fn handle(
    ctx: &RouterContext,
    conn: &Connection,
    req: PingRequest,
) -> Result<Vec<Payload>, VeilError> {
    if !req.reverse {
        return Ok(vec![Payload::PingResponse(PingResponse::default())]);
    }

    conn.require_role(RouterType::Message)?;
    let client = conn.require_client()?;
    let tunnel = ctx
        .directory
        .tunnel_of(&client)
        .await
        .ok_or_else(|| VeilError::not_found(format!("client {} has no tunnel", client.short())))?;

    let probe = Relay::new(vec![Payload::PingRequest(PingRequest::default())]);
    let status = match tunnel.call(probe).await {
        Ok(reply) => reply.status,
        Err(e) => {
            warn!(client = %client.short(), error = %e, "Reverse ping failed");
            tunnel.close();
            Status::None
        }
    };
    debug!(client = %client.short(), %status, "Reverse ping");

    Ok(vec![Payload::PingResponse(PingResponse {
        reverse: Some(status),
    })])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{context, joined, message_conn};
    use crate::tunnel::tests::ok_reply;

    #[tokio::test]
    async fn test_plain_ping_needs_no_session_state() {
        let ctx = context();
        let out = handle(&ctx, &message_conn(), PingRequest::default())
            .await
            .unwrap();
        assert_eq!(out, vec![Payload::PingResponse(PingResponse::default())]);
    }

    #[tokio::test]
    async fn test_reverse_ping_over_tunnel() {
        let ctx = context();
        let conn = joined(&ctx, "alice", |relay| {
            assert!(matches!(relay.payloads[0], Payload::PingRequest(_)));
            ok_reply()
        })
        .await;
        let out = handle(&ctx, &conn, PingRequest { reverse: true })
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![Payload::PingResponse(PingResponse {
                reverse: Some(Status::Ok)
            })]
        );
    }

    #[tokio::test]
    async fn test_reverse_ping_reports_dead_tunnel() {
        let ctx = context();
        let conn = joined(&ctx, "bob", |_| Err(VeilError::Internal("reset".into()))).await;
        let out = handle(&ctx, &conn, PingRequest { reverse: true })
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![Payload::PingResponse(PingResponse {
                reverse: Some(Status::None)
            })]
        );
    }

    #[tokio::test]
    async fn test_reverse_ping_without_join() {
        let ctx = context();
        let err = handle(&ctx, &message_conn(), PingRequest { reverse: true })
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }
}
