use tokio::sync::mpsc;
use tracing::{debug, warn};
use veil_shared::protocol::SearchRequest;
use veil_shared::{Payload, RouterType, VeilError};

use super::Connection;
use crate::broadcast::{Audience, Broadcast};
use crate::context::RouterContext;
use crate::tunnel::Relay;

/// Fan a keyword out to every sharing member. Hits come back later over the
/// requester's own tunnel, one relay per responding member; the request
/// itself is answered at once.
pub async fn handle(
    ctx: &RouterContext,
    conn: &Connection,
    req: SearchRequest,
) -> Result<Vec<Payload>, VeilError> {
    conn.require_role(RouterType::Message)?;
    let client = conn.require_client()?;
    req.validate()?;

    let requester = ctx
        .directory
        .tunnel_of(&client)
        .await
        .ok_or_else(|| VeilError::not_found(format!("client {} has no tunnel", client.short())))?;
    let recipients = ctx.directory.group_recipients(&client).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let keyword = req.keyword.clone();
    let relay = Relay::from_client(client, vec![Payload::SearchRequest(req)]);
    ctx.broadcaster.spawn(
        recipients,
        Broadcast::new(client, Audience::Search, relay).with_replies(tx),
    );

    tokio::spawn(async move {
        let mut forwarded = 0usize;
        while let Some((responder, reply)) = rx.recv().await {
            let hits: Vec<Payload> = reply
                .payloads
                .into_iter()
                .filter(|p| matches!(p, Payload::SearchResponse(r) if !r.files.is_empty()))
                .collect();
            if hits.is_empty() {
                continue;
            }
            if let Err(e) = requester.call(Relay::from_client(responder, hits)).await {
                warn!(client = %client.short(), error = %e, "Search results undeliverable");
                requester.close();
                break;
            }
            forwarded += 1;
        }
        debug!(client = %client.short(), %keyword, forwarded, "Search finished");
    });

    Ok(Vec::new())
}
