use tracing::info;
use veil_shared::VeilError;

use super::Connection;
use crate::context::RouterContext;

/// Leave for good: the client is removed, its members are told, and the
/// session is retired so it cannot be migrated.
pub async fn handle(ctx: &RouterContext, conn: &mut Connection) -> Result<(), VeilError> {
    if let Some(client) = conn.client.take() {
        ctx.drop_client(&client).await;
        info!(client = %client.short(), "Client quit");
    }
    ctx.sessions.retire(&conn.session).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{context, joined};
    use crate::tunnel::tests::ok_reply;

    #[tokio::test]
    async fn test_quit_removes_client_and_closes_tunnel() {
        let ctx = context();
        let mut conn = joined(&ctx, "alice", |_| ok_reply()).await;
        let client = conn.client.unwrap();
        let tunnel = ctx.directory.tunnel_of(&client).await.unwrap();

        handle(&ctx, &mut conn).await.unwrap();
        assert!(conn.client.is_none());
        assert!(!ctx.directory.contains(&client).await);
        assert!(tunnel.is_closed());

        // A second quit has nothing left to do.
        handle(&ctx, &mut conn).await.unwrap();
    }
}
