use std::sync::Arc;

use tracing::debug;
use veil_shared::protocol::{InfoEvent, InfoKind, MemberInfo};
use veil_shared::{ClientId, Payload, RoomId};

use crate::broadcast::{Audience, Broadcast, Broadcaster};
use crate::config::RouterConfig;
use crate::directory::{Directory, Recipient};
use crate::guard::AbuseGuard;
use crate::session::SessionManager;
use crate::transfer::TransferDirectory;
use crate::tunnel::Relay;

/// Everything a connection handler may touch, built once at startup.
#[derive(Clone)]
pub struct RouterContext {
    pub config: Arc<RouterConfig>,
    pub sessions: SessionManager,
    pub directory: Directory,
    pub transfers: TransferDirectory,
    pub guard: AbuseGuard,
    pub broadcaster: Broadcaster,
}

impl RouterContext {
    pub fn new(config: RouterConfig) -> Self {
        let transfers = TransferDirectory::new(
            config.max_transfers,
            config.chunk_size,
            config.chunk_buffer,
            config.chunk_drift,
        );
        let guard = AbuseGuard::new(config.spam_threshold, config.spam_window, config.spam_timeout);
        let broadcaster = Broadcaster::new(config.max_threads);
        Self {
            config: Arc::new(config),
            sessions: SessionManager::new(),
            directory: Directory::new(),
            transfers,
            guard,
            broadcaster,
        }
    }

    /// Push a presence notice to `recipients` in the background.
    pub fn notify(
        &self,
        subject: ClientId,
        kind: InfoKind,
        member: MemberInfo,
        room: Option<RoomId>,
        recipients: Vec<Recipient>,
    ) {
        if recipients.iter().all(|r| r.id == subject) {
            return;
        }
        debug!(client = %subject.short(), ?kind, "Notifying members");
        let event = InfoEvent { kind, member, room };
        let relay = Relay::from_client(subject, vec![Payload::Info(event)]);
        self.broadcaster
            .spawn(recipients, Broadcast::new(subject, Audience::Info, relay));
    }

    /// Remove a client everywhere and tell the rest of its group.
    pub async fn drop_client(&self, client: &ClientId) {
        if let Some(departure) = self.directory.leave(client).await {
            let member = departure.client.info();
            self.notify(*client, InfoKind::Leave, member, None, departure.remaining);
        }
    }
}
