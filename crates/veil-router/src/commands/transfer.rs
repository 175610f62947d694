//! File transfer commands.
//!
//! `TransferRequest` travels over the message session and announces a file
//! to the members who should fetch or serve it. Uploads and downloads then
//! run over transfer sessions, each call moving at most one chunk.

use veil_shared::protocol::{
    DownloadRequest, DownloadResponse, TransferRequest, TransferResponse, UploadRequest,
    UploadResponse,
};
use veil_shared::{ClientId, Payload, RouterType, VeilError};

use super::{guarded, Connection};
use crate::broadcast::{Audience, Broadcast};
use crate::context::RouterContext;
use crate::transfer::Entry;
use crate::tunnel::Relay;

pub async fn request(
    ctx: &RouterContext,
    conn: &Connection,
    targets: &[ClientId],
    req: TransferRequest,
) -> Result<Vec<Payload>, VeilError> {
    conn.require_role(RouterType::Message)?;
    let client = conn.require_client()?;
    req.validate()?;

    let response = TransferResponse {
        transfer: req.transfer,
        chunk_size: ctx.transfers.chunk_size(),
    };
    if !guarded(ctx, client).await {
        return Ok(vec![Payload::TransferResponse(response)]);
    }

    let recipients = if targets.is_empty() {
        ctx.directory.group_recipients(&client).await?
    } else {
        ctx.directory.recipients(&client, targets).await?
    };
    if ctx.config.transfer_router {
        ctx.transfers.open(req.transfer, req.file.size).await?;
    }

    let relay = Relay::from_client(client, vec![Payload::TransferRequest(req)]);
    ctx.broadcaster
        .spawn(recipients, Broadcast::new(client, Audience::Transfer, relay));
    Ok(vec![Payload::TransferResponse(response)])
}

pub async fn upload(
    ctx: &RouterContext,
    conn: &Connection,
    req: UploadRequest,
) -> Result<Vec<Payload>, VeilError> {
    conn.require_role(RouterType::Transfer)?;

    let response = match ctx.transfers.open(req.transfer, req.file_size).await? {
        Entry::Finished => UploadResponse {
            accepted: true,
            range: None,
            done: true,
        },
        Entry::Active(transfer) => {
            let response = {
                let mut transfer = transfer.lock().await;
                check_size(transfer.file_size, req.file_size)?;
                transfer.upload(req.chunk)?
            };
            if response.done {
                ctx.transfers.finish(&req.transfer).await;
            }
            response
        }
    };
    Ok(vec![Payload::UploadResponse(response)])
}

pub async fn download(
    ctx: &RouterContext,
    conn: &Connection,
    req: DownloadRequest,
) -> Result<Vec<Payload>, VeilError> {
    conn.require_role(RouterType::Transfer)?;

    let response = match ctx.transfers.open(req.transfer, req.file_size).await? {
        Entry::Finished => DownloadResponse {
            chunk: None,
            done: true,
        },
        Entry::Active(transfer) => {
            let response = {
                let mut transfer = transfer.lock().await;
                check_size(transfer.file_size, req.file_size)?;
                transfer.download(&req.acks)
            };
            if response.done {
                ctx.transfers.finish(&req.transfer).await;
            }
            response
        }
    };
    Ok(vec![Payload::DownloadResponse(response)])
}

fn check_size(known: u64, claimed: u64) -> Result<(), VeilError> {
    if known == claimed {
        Ok(())
    } else {
        Err(VeilError::validation(format!(
            "file size {claimed} does not match transfer ({known})"
        )))
    }
}
