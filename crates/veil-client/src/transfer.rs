//! Upload and download workers.
//!
//! Both sides poll a transfer router over their own transfer session. The
//! uploader is handed byte ranges and sends them back filled; the downloader
//! pulls filled chunks and acknowledges each one on its next request. Either
//! side stops once the router reports the transfer done.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use veil_shared::chunk::{Chunk, ChunkRange};
use veil_shared::protocol::{DownloadRequest, DownloadResponse, FileInfo, UploadRequest, UploadResponse};
use veil_shared::{Payload, RouterType, TransferId, VeilError};

use crate::config::ClientConfig;
use crate::connection::RouterConnection;
use crate::error::ClientError;
use crate::events::{ClientEvent, Direction, EventSink};
use crate::share::{ChunkSink, ShareStore};

async fn transfer_connection(config: &ClientConfig) -> Result<RouterConnection, ClientError> {
    RouterConnection::connect(
        config.transfer_addr(),
        &config.handshake(RouterType::Transfer),
        None,
    )
    .await
}

fn stalled(transfer: TransferId) -> ClientError {
    VeilError::Capacity(format!("transfer {transfer} stalled")).into()
}

/// Serve `file` for `transfer` from `store` until the router is done with it.
pub async fn upload(
    config: Arc<ClientConfig>,
    store: Arc<dyn ShareStore>,
    events: EventSink,
    transfer: TransferId,
    file: FileInfo,
) {
    let result = run_upload(&config, store.as_ref(), &events, transfer, &file).await;
    finish(&events, transfer, Direction::Upload, result).await;
}

async fn run_upload(
    config: &ClientConfig,
    store: &dyn ShareStore,
    events: &EventSink,
    transfer: TransferId,
    file: &FileInfo,
) -> Result<(), ClientError> {
    let mut conn = transfer_connection(config).await?;
    info!(%transfer, path = %file.path, size = file.size, "Upload started");

    let mut ranges: VecDeque<ChunkRange> = VecDeque::new();
    let mut pending: Option<Chunk> = None;
    let mut sent = 0u64;
    let mut last_progress = Instant::now();

    loop {
        let request = UploadRequest {
            transfer,
            file_size: file.size,
            chunk: pending.clone(),
        };
        let response: UploadResponse = conn
            .call(Payload::UploadRequest(request), Vec::new(), "upload", |p| match p {
                Payload::UploadResponse(r) => Some(r),
                _ => None,
            })
            .await?;
        if response.done {
            return Ok(());
        }

        if response.accepted {
            if let Some(chunk) = pending.take() {
                sent += chunk.size;
                last_progress = Instant::now();
                events
                    .emit(ClientEvent::TransferProgress {
                        transfer,
                        direction: Direction::Upload,
                        bytes: sent.min(file.size),
                        total: file.size,
                    })
                    .await;
            }
        }
        if let Some(range) = response.range {
            ranges.push_back(range);
        }

        if pending.is_none() {
            if let Some(range) = ranges.pop_front() {
                let data = store.read(&file.path, range.offset, range.size).await?;
                pending = Some(Chunk::new(range, data));
                continue;
            }
        }

        if last_progress.elapsed() >= config.stall_timeout {
            return Err(stalled(transfer));
        }
        tokio::time::sleep(config.upload_poll).await;
    }
}

/// Pull `transfer` into `sink`, reporting progress on `events`.
pub async fn download(
    config: Arc<ClientConfig>,
    events: EventSink,
    transfer: TransferId,
    file: FileInfo,
    mut sink: Box<dyn ChunkSink>,
) {
    let result = run_download(&config, &events, transfer, &file, sink.as_mut()).await;
    finish(&events, transfer, Direction::Download, result).await;
}

async fn run_download(
    config: &ClientConfig,
    events: &EventSink,
    transfer: TransferId,
    file: &FileInfo,
    sink: &mut dyn ChunkSink,
) -> Result<(), ClientError> {
    let mut conn = transfer_connection(config).await?;
    info!(%transfer, path = %file.path, size = file.size, "Download started");

    let mut acks: Vec<ChunkRange> = Vec::new();
    let mut received: BTreeSet<u64> = BTreeSet::new();
    let mut bytes = 0u64;
    let mut last_progress = Instant::now();

    loop {
        let request = DownloadRequest {
            transfer,
            file_size: file.size,
            acks: std::mem::take(&mut acks),
        };
        let response: DownloadResponse = conn
            .call(Payload::DownloadRequest(request), Vec::new(), "download", |p| match p {
                Payload::DownloadResponse(r) => Some(r),
                _ => None,
            })
            .await?;

        if let Some(chunk) = response.chunk {
            if !chunk.is_valid_for(file.size) {
                return Err(VeilError::validation(format!(
                    "chunk {}+{} does not fit {}",
                    chunk.offset, chunk.size, file.path
                ))
                .into());
            }
            sink.write_at(chunk.offset, &chunk.data).await?;
            acks.push(chunk.range());
            if received.insert(chunk.offset) {
                bytes += chunk.size;
            } else {
                debug!(%transfer, offset = chunk.offset, "Chunk redelivered");
            }
            last_progress = Instant::now();
            events
                .emit(ClientEvent::TransferProgress {
                    transfer,
                    direction: Direction::Download,
                    bytes,
                    total: file.size,
                })
                .await;
            continue;
        }

        if response.done {
            if bytes < file.size {
                return Err(VeilError::Internal(format!(
                    "transfer ended after {bytes} of {} bytes",
                    file.size
                ))
                .into());
            }
            sink.finish().await?;
            return Ok(());
        }

        if last_progress.elapsed() >= config.stall_timeout {
            return Err(stalled(transfer));
        }
        tokio::time::sleep(config.download_poll).await;
    }
}

async fn finish(
    events: &EventSink,
    transfer: TransferId,
    direction: Direction,
    result: Result<(), ClientError>,
) {
    match result {
        Ok(()) => {
            info!(%transfer, ?direction, "Transfer finished");
            events
                .emit(ClientEvent::TransferFinished { transfer, direction })
                .await;
        }
        Err(e) => {
            warn!(%transfer, ?direction, error = %e, "Transfer failed");
            events
                .emit(ClientEvent::TransferFailed {
                    transfer,
                    direction,
                    reason: e.to_string(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use veil_router::RouterConfig;

    use crate::connection::tests::spawn_router;
    use crate::share::{MemorySink, MemoryStore};

    fn client_config(router: std::net::SocketAddr) -> Arc<ClientConfig> {
        Arc::new(ClientConfig {
            router_addr: router,
            download_poll: Duration::from_millis(10),
            upload_poll: Duration::from_millis(10),
            stall_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        })
    }

    #[tokio::test]
    async fn test_upload_and_download_move_file() {
        let router = spawn_router(RouterConfig {
            chunk_size: 4,
            chunk_buffer: 2,
            ..RouterConfig::default()
        })
        .await;
        let config = client_config(router);
        let content: Vec<u8> = (0u8..23).collect();
        let store: Arc<dyn ShareStore> =
            Arc::new(MemoryStore::new().with_file("data.bin", content.clone()));
        let file = FileInfo {
            path: "data.bin".into(),
            size: content.len() as u64,
        };

        let (tx, mut rx) = mpsc::channel(256);
        let events = EventSink::new(tx);
        let transfer = TransferId::new();
        let sink = MemorySink::new();

        let uploader = tokio::spawn(upload(
            config.clone(),
            store,
            events.clone(),
            transfer,
            file.clone(),
        ));
        let downloader = tokio::spawn(download(
            config,
            events,
            transfer,
            file,
            Box::new(sink.clone()),
        ));

        let mut finished = 0;
        while finished < 2 {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                ClientEvent::TransferFinished { transfer: id, .. } => {
                    assert_eq!(id, transfer);
                    finished += 1;
                }
                ClientEvent::TransferFailed { reason, .. } => panic!("transfer failed: {reason}"),
                _ => {}
            }
        }
        uploader.await.unwrap();
        downloader.await.unwrap();
        assert_eq!(sink.contents().await, content);
    }

    #[tokio::test]
    async fn test_download_without_uploader_stalls() {
        let router = spawn_router(RouterConfig::default()).await;
        let config = Arc::new(ClientConfig {
            stall_timeout: Duration::from_millis(200),
            ..(*client_config(router)).clone()
        });
        let (tx, mut rx) = mpsc::channel(16);
        let transfer = TransferId::new();
        let file = FileInfo {
            path: "ghost.bin".into(),
            size: 10,
        };
        download(config, EventSink::new(tx), transfer, file, Box::new(MemorySink::new())).await;
        assert!(matches!(
            rx.recv().await,
            Some(ClientEvent::TransferFailed {
                direction: Direction::Download,
                ..
            })
        ));
    }
}
