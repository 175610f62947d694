//! Wire codec: `[crc32:4][version][tag header][payloads...]`, zlib-compressed.
//!
//! The checksum slot is written first and filled last, covering every byte
//! after it. The tag header lets a receiver see what a frame carries before
//! decoding any payload body.

use std::io::{Read, Write};

use bincode::Options;
use crc32fast::Hasher;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::constants::{MAX_FRAME_LEN, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::error::VeilError;
use crate::protocol::{Payload, PayloadType};

const CHECKSUM_LEN: usize = 4;

/// Pack an ordered list of payloads into one compressed frame body.
pub fn pack(payloads: &[Payload]) -> Result<Vec<u8>, VeilError> {
    pack_with_version(payloads, PROTOCOL_VERSION)
}

/// Unpack a frame body produced by [`pack`], in header order.
pub fn unpack(bytes: &[u8]) -> Result<Vec<Payload>, VeilError> {
    let raw = decompress(bytes)?;
    if raw.len() < CHECKSUM_LEN {
        return Err(VeilError::Checksum(format!(
            "frame of {} bytes has no checksum",
            raw.len()
        )));
    }

    let (slot, body) = raw.split_at(CHECKSUM_LEN);
    let expected = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
    let actual = checksum(body);
    if expected != actual {
        return Err(VeilError::Checksum(format!(
            "expected {expected:#010x}, computed {actual:#010x}"
        )));
    }

    let opts = bincode::DefaultOptions::new();
    let mut reader = body;

    let version: u32 = opts
        .deserialize_from(&mut reader)
        .map_err(|e| VeilError::Corrupted(format!("version: {e}")))?;
    if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&version) {
        return Err(VeilError::Version(version));
    }

    let header: Vec<u8> = opts
        .deserialize_from(&mut reader)
        .map_err(|e| VeilError::Corrupted(format!("header: {e}")))?;

    let mut payloads = Vec::with_capacity(header.len());
    for tag in header {
        let kind = PayloadType::from_byte(tag)
            .ok_or_else(|| VeilError::Corrupted(format!("unknown payload tag {tag:#04x}")))?;
        payloads.push(Payload::decode_body(kind, &mut reader)?);
    }
    Ok(payloads)
}

pub(crate) fn pack_with_version(payloads: &[Payload], version: u32) -> Result<Vec<u8>, VeilError> {
    let opts = bincode::DefaultOptions::new();
    let mut raw = vec![0u8; CHECKSUM_LEN];

    opts.serialize_into(&mut raw, &version)
        .map_err(|e| VeilError::Internal(format!("version: {e}")))?;

    let header: Vec<u8> = payloads.iter().map(|p| p.kind() as u8).collect();
    opts.serialize_into(&mut raw, &header)
        .map_err(|e| VeilError::Internal(format!("header: {e}")))?;

    for payload in payloads {
        payload.encode_body(&mut raw)?;
    }

    let sum = checksum(&raw[CHECKSUM_LEN..]);
    raw[..CHECKSUM_LEN].copy_from_slice(&sum.to_le_bytes());

    compress(&raw)
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn compress(data: &[u8]) -> Result<Vec<u8>, VeilError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

// A stream that fails to inflate was altered in transit, same as a bad crc.
fn decompress(data: &[u8]) -> Result<Vec<u8>, VeilError> {
    let limit = u64::from(MAX_FRAME_LEN);
    let mut decoder = ZlibDecoder::new(data).take(limit + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| VeilError::Checksum(format!("inflate: {e}")))?;
    if out.len() as u64 > limit {
        return Err(VeilError::Corrupted("inflated frame exceeds limit".into()));
    }
    Ok(out)
}
