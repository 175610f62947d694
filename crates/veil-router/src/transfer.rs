//! Transfer directory: one [`Transfer`] per in-flight file, each holding the
//! upload and download queues behind its own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};
use veil_shared::chunk::{Chunk, ChunkRange, DownloadQueue, UploadQueue};
use veil_shared::protocol::{DownloadResponse, UploadResponse};
use veil_shared::{TransferId, VeilError};

#[derive(Debug)]
pub struct Transfer {
    pub id: TransferId,
    pub file_size: u64,
    upload: UploadQueue,
    download: DownloadQueue,
    last_activity: Instant,
}

impl Transfer {
    pub fn new(id: TransferId, file_size: u64, chunk_size: u64, buffer: usize, drift: u64) -> Self {
        Self {
            id,
            file_size,
            upload: UploadQueue::new(file_size, chunk_size, drift),
            download: DownloadQueue::new(buffer),
            last_activity: Instant::now(),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.upload.chunk_size()
    }

    pub fn done(&self) -> bool {
        let upload_done = self.upload.done();
        self.download.done(upload_done)
    }

    /// Uploader hands in a filled chunk (if any) and asks for the next range.
    pub fn upload(&mut self, chunk: Option<Chunk>) -> Result<UploadResponse, VeilError> {
        self.last_activity = Instant::now();
        let mut accepted = true;

        if let Some(chunk) = chunk {
            if !chunk.is_valid_for(self.file_size) {
                return Err(VeilError::validation(format!(
                    "chunk {}+{} does not fit transfer {}",
                    chunk.offset, chunk.size, self.id
                )));
            }
            if !self.upload.is_outstanding(chunk.offset, chunk.size) {
                return Err(VeilError::validation(format!(
                    "chunk {}+{} was never handed out",
                    chunk.offset, chunk.size
                )));
            }
            if self.download.push(chunk).is_err() {
                accepted = false;
            }
        }

        let range = if accepted && !self.download.full() {
            self.upload.push()
        } else {
            None
        };

        Ok(UploadResponse {
            accepted,
            range,
            done: self.done(),
        })
    }

    /// Downloader acknowledges what it received and pulls the next chunk.
    /// Delivered chunks left unacknowledged are sent again first.
    pub fn download(&mut self, acks: &[ChunkRange]) -> DownloadResponse {
        self.last_activity = Instant::now();
        for ack in acks {
            if self.download.ack(ack.offset, ack.size) {
                self.upload.ack(ack.offset, ack.size);
            }
        }
        self.download.requeue_unacked();

        let chunk = self.download.pop();
        DownloadResponse {
            chunk,
            done: self.done(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

pub enum Entry {
    Active(Arc<Mutex<Transfer>>),
    /// Completed and evicted; both sides should stop.
    Finished,
}

#[derive(Default)]
struct TransferState {
    active: HashMap<TransferId, Arc<Mutex<Transfer>>>,
    finished: HashMap<TransferId, Instant>,
}

#[derive(Clone)]
pub struct TransferDirectory {
    state: Arc<Mutex<TransferState>>,
    max_transfers: usize,
    chunk_size: u64,
    chunk_buffer: usize,
    chunk_drift: u64,
}

impl TransferDirectory {
    pub fn new(max_transfers: usize, chunk_size: u64, chunk_buffer: usize, chunk_drift: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransferState::default())),
            max_transfers,
            chunk_size,
            chunk_buffer,
            chunk_drift,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Look up a transfer, creating it if unseen. Fails with `Capacity` when
    /// the router already holds `max_transfers`.
    pub async fn open(&self, id: TransferId, file_size: u64) -> Result<Entry, VeilError> {
        let mut state = self.state.lock().await;
        if state.finished.contains_key(&id) {
            return Ok(Entry::Finished);
        }
        if let Some(transfer) = state.active.get(&id) {
            return Ok(Entry::Active(transfer.clone()));
        }
        if file_size == 0 {
            return Err(VeilError::validation("file size is zero"));
        }
        if state.active.len() >= self.max_transfers {
            return Err(VeilError::Capacity(format!(
                "{} transfers in flight",
                state.active.len()
            )));
        }

        let transfer = Arc::new(Mutex::new(Transfer::new(
            id,
            file_size,
            self.chunk_size,
            self.chunk_buffer,
            self.chunk_drift,
        )));
        state.active.insert(id, transfer.clone());
        debug!(transfer = %id, file_size, "Transfer created");
        Ok(Entry::Active(transfer))
    }

    /// Evict a completed transfer, remembering it so late requests see `done`.
    pub async fn finish(&self, id: &TransferId) {
        let mut state = self.state.lock().await;
        if state.active.remove(id).is_some() {
            state.finished.insert(*id, Instant::now());
            info!(transfer = %id, "Transfer complete");
        }
    }

    /// Evict transfers idle longer than `max_idle`, whatever their state.
    pub async fn sweep(&self, max_idle: Duration) -> usize {
        let snapshot: Vec<(TransferId, Arc<Mutex<Transfer>>)> = {
            let state = self.state.lock().await;
            state
                .active
                .iter()
                .map(|(id, t)| (*id, t.clone()))
                .collect()
        };

        let mut idle = Vec::new();
        for (id, transfer) in snapshot {
            if transfer.lock().await.idle_for() >= max_idle {
                idle.push(id);
            }
        }

        let mut state = self.state.lock().await;
        for id in &idle {
            state.active.remove(id);
            info!(transfer = %id, "Evicted idle transfer");
        }
        state
            .finished
            .retain(|_, at| at.elapsed() < max_idle);
        idle.len()
    }

    pub async fn active(&self) -> usize {
        self.state.lock().await.active.len()
    }
}
