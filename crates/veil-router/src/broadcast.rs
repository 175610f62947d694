//! Broadcast fan-out.
//!
//! One event goes to many members through a bounded set of workers that
//! drain a shared queue of recipients. A recipient whose tunnel fails is
//! closed and the broadcast carries on with everyone else.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use veil_shared::{ClientId, Status};

use crate::directory::Recipient;
use crate::tunnel::{Relay, Reply};

/// Which member preference gates an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Chat opt-in, and the recipient has not muted the sender
    Chat,
    /// Sharing members that accept transfers
    Transfer,
    /// Sharing members
    Search,
    /// Everyone
    Info,
}

impl Audience {
    pub fn accepts(&self, recipient: &Recipient) -> bool {
        match self {
            Audience::Chat => recipient.prefs.chat && !recipient.muted,
            Audience::Transfer => recipient.share && recipient.prefs.transfer,
            Audience::Search => recipient.share,
            Audience::Info => true,
        }
    }
}

pub struct Broadcast {
    pub sender: ClientId,
    pub audience: Audience,
    pub relay: Relay,
    /// Replies from recipients, for fan-outs whose answers go somewhere
    pub replies: Option<mpsc::UnboundedSender<(ClientId, Reply)>>,
}

impl Broadcast {
    pub fn new(sender: ClientId, audience: Audience, relay: Relay) -> Self {
        Self {
            sender,
            audience,
            relay,
            replies: None,
        }
    }

    pub fn with_replies(mut self, replies: mpsc::UnboundedSender<(ClientId, Reply)>) -> Self {
        self.replies = Some(replies);
        self
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub workers: usize,
}

#[derive(Debug, Default)]
struct Tally {
    delivered: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Clone)]
pub struct Broadcaster {
    max_threads: usize,
}

impl Broadcaster {
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads: max_threads.max(1),
        }
    }

    /// Start the fan-out and return at once; the handle resolves to the report.
    pub fn spawn(&self, recipients: Vec<Recipient>, job: Broadcast) -> JoinHandle<BroadcastReport> {
        let this = self.clone();
        tokio::spawn(async move { this.run(recipients, job).await })
    }

    pub async fn run(&self, recipients: Vec<Recipient>, job: Broadcast) -> BroadcastReport {
        let queue: VecDeque<Recipient> = recipients
            .into_iter()
            .filter(|r| r.id != job.sender)
            .collect();
        let workers = queue.len().min(self.max_threads);
        if workers == 0 {
            return BroadcastReport::default();
        }

        let queue = Arc::new(Mutex::new(queue));
        let tally = Arc::new(Tally::default());
        let job = Arc::new(job);

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|_| {
                let queue = queue.clone();
                let tally = tally.clone();
                let job = job.clone();
                tokio::spawn(async move { worker(queue, tally, job).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Broadcast worker panicked");
            }
        }

        let report = BroadcastReport {
            delivered: tally.delivered.load(Ordering::Relaxed),
            skipped: tally.skipped.load(Ordering::Relaxed),
            failed: tally.failed.load(Ordering::Relaxed),
            workers,
        };
        debug!(
            sender = %job.sender.short(),
            audience = ?job.audience,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            workers,
            "Broadcast finished"
        );
        report
    }
}

async fn worker(queue: Arc<Mutex<VecDeque<Recipient>>>, tally: Arc<Tally>, job: Arc<Broadcast>) {
    loop {
        let next = queue.lock().await.pop_front();
        let Some(recipient) = next else { break };

        if recipient.id == job.sender || !job.audience.accepts(&recipient) {
            tally.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let Some(tunnel) = recipient.tunnel else {
            tally.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        match tunnel.call(job.relay.clone()).await {
            Ok(reply) if reply.status == Status::None => {
                debug!(client = %recipient.id.short(), "Recipient reported gone");
                tunnel.close();
                tally.failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(reply) => {
                tally.delivered.fetch_add(1, Ordering::Relaxed);
                if let Some(replies) = &job.replies {
                    let _ = replies.send((recipient.id, reply));
                }
            }
            Err(e) => {
                warn!(client = %recipient.id.short(), error = %e, "Broadcast delivery failed");
                tunnel.close();
                tally.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use veil_shared::protocol::{ChatRequest, Preferences};
    use veil_shared::{Payload, VeilError};

    use crate::tunnel::tests::{fake_tunnel, ok_reply};
    use crate::tunnel::Tunnel;

    fn recipient(id: ClientId, tunnel: Option<Tunnel>) -> Recipient {
        Recipient {
            id,
            prefs: Preferences::default(),
            share: true,
            muted: false,
            tunnel,
        }
    }

    fn chat_relay(sender: ClientId) -> Relay {
        Relay::from_client(sender, vec![Payload::ChatRequest(ChatRequest::new("hello"))])
    }

    /// Tunnel that tracks how many calls are in progress across all tunnels.
    fn slow_tunnel(id: ClientId, active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Tunnel {
        let (tunnel, mut rx) = Tunnel::new(id, Duration::from_secs(5));
        tokio::spawn(async move {
            while let Some(call) = rx.calls.recv().await {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = call.reply.send(ok_reply());
            }
        });
        tunnel
    }

    #[tokio::test]
    async fn test_room_of_five_with_two_workers() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let sender = ClientId::random();

        let mut members = vec![recipient(sender, None)];
        for _ in 0..4 {
            let id = ClientId::random();
            members.push(recipient(id, Some(slow_tunnel(id, active.clone(), peak.clone()))));
        }

        let report = Broadcaster::new(2)
            .spawn(members, Broadcast::new(sender, Audience::Chat, chat_relay(sender)))
            .await
            .unwrap();

        assert_eq!(report.delivered, 4);
        assert_eq!(report.workers, 2);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_workers_never_exceed_targets() {
        let sender = ClientId::random();
        let other = ClientId::random();
        let members = vec![
            recipient(sender, None),
            recipient(other, Some(fake_tunnel(other, |_| ok_reply()))),
        ];
        let report = Broadcaster::new(128)
            .run(members, Broadcast::new(sender, Audience::Info, Relay::new(Vec::new())))
            .await;
        assert_eq!(report.workers, 1);
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_opted_out_and_muted_are_skipped() {
        let sender = ClientId::random();
        let quiet = ClientId::random();
        let muter = ClientId::random();
        let listener = ClientId::random();

        let mut no_chat = recipient(quiet, Some(fake_tunnel(quiet, |_| ok_reply())));
        no_chat.prefs.chat = false;
        let mut muted = recipient(muter, Some(fake_tunnel(muter, |_| ok_reply())));
        muted.muted = true;
        let members = vec![
            no_chat,
            muted,
            recipient(listener, Some(fake_tunnel(listener, |_| ok_reply()))),
            recipient(ClientId::random(), None),
        ];

        let report = Broadcaster::new(4)
            .run(members, Broadcast::new(sender, Audience::Chat, chat_relay(sender)))
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 3);
    }

    #[tokio::test]
    async fn test_failed_delivery_closes_tunnel_only() {
        let sender = ClientId::random();
        let broken_id = ClientId::random();
        let gone_id = ClientId::random();
        let fine_id = ClientId::random();

        let broken = fake_tunnel(broken_id, |_| Err(VeilError::Internal("socket reset".into())));
        let gone = fake_tunnel(gone_id, |_| {
            Ok(Reply {
                status: Status::None,
                payloads: Vec::new(),
            })
        });
        let fine = fake_tunnel(fine_id, |_| ok_reply());

        let members = vec![
            recipient(broken_id, Some(broken.clone())),
            recipient(gone_id, Some(gone.clone())),
            recipient(fine_id, Some(fine.clone())),
        ];
        let report = Broadcaster::new(1)
            .run(members, Broadcast::new(sender, Audience::Info, Relay::new(Vec::new())))
            .await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert!(broken.is_closed());
        assert!(gone.is_closed());
        assert!(!fine.is_closed());
    }

    #[tokio::test]
    async fn test_replies_are_forwarded() {
        let sender = ClientId::random();
        let a = ClientId::random();
        let b = ClientId::random();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let members = vec![
            recipient(a, Some(fake_tunnel(a, |_| ok_reply()))),
            recipient(b, Some(fake_tunnel(b, |_| ok_reply()))),
        ];

        let job = Broadcast::new(sender, Audience::Search, Relay::new(Vec::new())).with_replies(tx);
        Broadcaster::new(8).run(members, job).await;

        let mut from = Vec::new();
        while let Ok((id, reply)) = rx.try_recv() {
            assert_eq!(reply.status, Status::Ok);
            from.push(id);
        }
        from.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(from, expected);
    }
}
