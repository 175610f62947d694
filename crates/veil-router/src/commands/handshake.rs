use std::sync::Arc;

use tracing::info;
use veil_shared::crypto::SessionCipher;
use veil_shared::handshake;
use veil_shared::protocol::{HandshakeRequest, HandshakeResponse};
use veil_shared::VeilError;

use super::Connection;
use crate::context::RouterContext;

/// A negotiated session, ready to serve requests.
pub struct Negotiated {
    pub conn: Connection,
    pub cipher: Arc<SessionCipher>,
    pub response: HandshakeResponse,
}

/// Agree on a session key and register the session, migrating the one the
/// peer presents if it is still known.
pub async fn handle(ctx: &RouterContext, req: HandshakeRequest) -> Result<Negotiated, VeilError> {
    if !ctx.config.serves(req.router_type) {
        return Err(VeilError::Unsupported(format!(
            "this router does not serve {} sessions",
            req.router_type
        )));
    }

    let accepted = handshake::respond(ctx.config.policy(req.router_type), &req)?;
    let allocated = ctx
        .sessions
        .allocate(accepted.cipher, req.router_type, req.session_id.as_ref())
        .await;

    info!(
        session = %allocated.id.short(),
        router_type = %req.router_type,
        prime_size = req.prime_size,
        migrated = allocated.migrated,
        "Handshake complete"
    );

    Ok(Negotiated {
        conn: Connection {
            session: allocated.id.clone(),
            router_type: req.router_type,
            client: allocated.client,
        },
        cipher: allocated.cipher,
        response: HandshakeResponse {
            public_key: accepted.public_key,
            session_id: allocated.id,
        },
    })
}
