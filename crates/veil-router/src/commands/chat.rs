use veil_shared::protocol::ChatRequest;
use veil_shared::{ClientId, Payload, RouterType, VeilError};

use super::{guarded, Connection};
use crate::broadcast::{Audience, Broadcast};
use crate::context::RouterContext;
use crate::tunnel::Relay;

/// Relay a chat line. With envelope targets it is a private message to those
/// members; otherwise it goes to the named room or the whole group. Group
/// and room chat pass through the abuse guard, and a suppressed sender still
/// gets an ok.
pub async fn handle(
    ctx: &RouterContext,
    conn: &Connection,
    targets: &[ClientId],
    req: ChatRequest,
) -> Result<Vec<Payload>, VeilError> {
    conn.require_role(RouterType::Message)?;
    let client = conn.require_client()?;
    req.validate(ctx.config.max_text)?;

    if !targets.is_empty() {
        if req.room.is_some() {
            return Err(VeilError::validation("a private message cannot name a room"));
        }
        if targets.contains(&client) {
            return Err(VeilError::validation("cannot message yourself"));
        }
        let recipients = ctx.directory.recipients(&client, targets).await?;
        let relay = Relay {
            origin: Some(client),
            targets: targets.to_vec(),
            payloads: vec![Payload::ChatRequest(req)],
        };
        ctx.broadcaster
            .spawn(recipients, Broadcast::new(client, Audience::Chat, relay));
        return Ok(Vec::new());
    }

    let recipients = match &req.room {
        Some(room) => ctx.directory.room_recipients(&client, room).await?,
        None => ctx.directory.group_recipients(&client).await?,
    };
    if !guarded(ctx, client).await {
        return Ok(Vec::new());
    }

    let relay = Relay::from_client(client, vec![Payload::ChatRequest(req)]);
    ctx.broadcaster
        .spawn(recipients, Broadcast::new(client, Audience::Chat, relay));
    Ok(Vec::new())
}
