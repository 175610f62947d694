use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;
use veil_shared::ClientId;

#[derive(Debug, Clone)]
struct AbuseRecord {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
    suppressed_until: Option<Instant>,
}

impl AbuseRecord {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_seen: now,
            suppressed_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Drop silently. `fresh` is set on the request that tripped the guard.
    Suppress { fresh: bool },
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Per-client request counter that silences chatty members.
#[derive(Clone)]
pub struct AbuseGuard {
    records: Arc<Mutex<HashMap<ClientId, AbuseRecord>>>,
    threshold: u32,
    window: Duration,
    timeout: Duration,
}

impl AbuseGuard {
    /// `threshold` requests are allowed per `window`; 0 disables the guard.
    pub fn new(threshold: u32, window: Duration, timeout: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            threshold,
            window,
            timeout,
        }
    }

    pub async fn check(&self, client: ClientId) -> Verdict {
        if self.threshold == 0 {
            return Verdict::Allow;
        }

        let now = Instant::now();
        let mut records = self.records.lock().await;
        let record = records
            .entry(client)
            .or_insert_with(|| AbuseRecord::new(now));
        record.last_seen = now;

        if let Some(until) = record.suppressed_until {
            if now < until {
                return Verdict::Suppress { fresh: false };
            }
            record.suppressed_until = None;
            record.count = 0;
            record.window_start = now;
        }

        if now.duration_since(record.window_start) > self.window {
            record.count = 0;
            record.window_start = now;
        }

        record.count += 1;
        if record.count > self.threshold {
            record.suppressed_until = Some(now + self.timeout);
            warn!(
                client = %client.short(),
                count = record.count,
                timeout_secs = self.timeout.as_secs(),
                "Spam threshold exceeded, suppressing"
            );
            return Verdict::Suppress { fresh: true };
        }
        Verdict::Allow
    }

    pub async fn is_suppressed(&self, client: &ClientId) -> bool {
        let records = self.records.lock().await;
        records
            .get(client)
            .and_then(|r| r.suppressed_until)
            .map_or(false, |until| Instant::now() < until)
    }

    /// Drop records that are neither suppressed nor seen within the window.
    pub async fn purge_stale(&self) {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        records.retain(|_, r| match r.suppressed_until {
            Some(until) => now < until,
            None => now.duration_since(r.last_seen) <= self.window,
        });
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}
