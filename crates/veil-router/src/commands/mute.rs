use tracing::debug;
use veil_shared::protocol::MuteRequest;
use veil_shared::{Payload, RouterType, VeilError};

use super::Connection;
use crate::context::RouterContext;

pub async fn handle(
    ctx: &RouterContext,
    conn: &Connection,
    req: MuteRequest,
) -> Result<Vec<Payload>, VeilError> {
    conn.require_role(RouterType::Message)?;
    let client = conn.require_client()?;
    if req.client == client {
        return Err(VeilError::validation("cannot mute yourself"));
    }
    ctx.directory.mute(&client, &req.client, req.mute).await?;
    debug!(client = %client.short(), target = %req.client.short(), mute = req.mute, "Mute updated");
    Ok(Vec::new())
}
