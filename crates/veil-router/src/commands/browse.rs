use tracing::warn;
use veil_shared::protocol::BrowseRequest;
use veil_shared::{ClientId, Payload, RouterType, VeilError};

use super::Connection;
use crate::context::RouterContext;
use crate::tunnel::Relay;

/// Ask exactly one member for a listing of its shared files and hand the
/// answer straight back.
pub async fn handle(
    ctx: &RouterContext,
    conn: &Connection,
    targets: &[ClientId],
    req: BrowseRequest,
) -> Result<Vec<Payload>, VeilError> {
    conn.require_role(RouterType::Message)?;
    let client = conn.require_client()?;
    req.validate()?;

    let [target] = targets else {
        return Err(VeilError::validation("browse needs exactly one target"));
    };
    if *target == client {
        return Err(VeilError::validation("cannot browse yourself"));
    }

    let recipients = ctx.directory.recipients(&client, &[*target]).await?;
    let tunnel = recipients
        .into_iter()
        .next()
        .filter(|r| r.share)
        .and_then(|r| r.tunnel)
        .ok_or_else(|| VeilError::not_found(format!("client {} shares nothing", target.short())))?;

    match tunnel
        .call(Relay::from_client(client, vec![Payload::BrowseRequest(req)]))
        .await
    {
        Ok(reply) if reply.status.is_ok() => Ok(reply.payloads),
        Ok(reply) => Err(VeilError::from_status(reply.status, "browse")),
        Err(e) => {
            warn!(target = %target.short(), error = %e, "Browse relay failed");
            tunnel.close();
            Err(VeilError::not_found(format!("client {} unreachable", target.short())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{context, joined};
    use crate::tunnel::tests::ok_reply;
    use crate::tunnel::Reply;
    use veil_shared::protocol::{BrowseResponse, FileInfo};
    use veil_shared::Status;

    fn listing(_: Relay) -> Result<Reply, VeilError> {
        Ok(Reply {
            status: Status::Ok,
            payloads: vec![Payload::BrowseResponse(BrowseResponse {
                files: vec![FileInfo {
                    path: "music/song.ogg".into(),
                    size: 4096,
                }],
            })],
        })
    }

    #[tokio::test]
    async fn test_browse_returns_target_listing() {
        let ctx = context();
        let alice = joined(&ctx, "alice", |_| ok_reply()).await;
        let bob = joined(&ctx, "bob", listing).await;

        let out = handle(&ctx, &alice, &[bob.client.unwrap()], BrowseRequest::default())
            .await
            .unwrap();
        match &out[..] {
            [Payload::BrowseResponse(r)] => assert_eq!(r.files[0].name(), "song.ogg"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_browse_needs_single_target() {
        let ctx = context();
        let alice = joined(&ctx, "alice", |_| ok_reply()).await;
        let err = handle(&ctx, &alice, &[], BrowseRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn test_browse_peer_error_maps_status() {
        let ctx = context();
        let alice = joined(&ctx, "alice", |_| ok_reply()).await;
        let bob = joined(&ctx, "bob", |_| {
            Ok(Reply {
                status: Status::NotFound,
                payloads: Vec::new(),
            })
        })
        .await;
        let err = handle(&ctx, &alice, &[bob.client.unwrap()], BrowseRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }
}
