use tracing::info;
use veil_shared::protocol::{InfoKind, JoinRequest, JoinResponse};
use veil_shared::{Payload, RouterType, VeilError};

use super::Connection;
use crate::context::RouterContext;

/// Join (or re-join) a group. A session that already carries a client keeps
/// its id; members are told about the arrival, rename or profile update.
pub async fn handle(
    ctx: &RouterContext,
    conn: &mut Connection,
    req: JoinRequest,
) -> Result<Vec<Payload>, VeilError> {
    conn.require_role(RouterType::Message)?;
    req.validate()?;

    let verified = ctx
        .config
        .is_verified(req.name.trim(), req.passphrase.as_deref());
    let outcome = ctx
        .directory
        .join(conn.client, &conn.session, &req, verified)
        .await;
    conn.client = Some(outcome.client);
    ctx.sessions.bind_client(&conn.session, outcome.client).await;

    if let Some(old_group) = &outcome.left {
        let remaining = ctx.directory.members_of(old_group, &outcome.client).await;
        ctx.notify(
            outcome.client,
            InfoKind::Leave,
            outcome.member.clone(),
            None,
            remaining,
        );
    }

    let recipients = ctx.directory.group_recipients(&outcome.client).await?;
    ctx.notify(
        outcome.client,
        outcome.kind,
        outcome.member.clone(),
        None,
        recipients,
    );

    info!(
        client = %outcome.client.short(),
        name = %outcome.member.name,
        group = %req.group,
        verified,
        kind = ?outcome.kind,
        "Client joined"
    );

    Ok(vec![Payload::JoinResponse(JoinResponse {
        client: outcome.client,
        name: outcome.member.name,
        motd: ctx.config.motd.clone(),
        members: outcome.members,
        rooms: outcome.rooms,
    })])
}
