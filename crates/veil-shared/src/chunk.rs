//! Chunk types and the two per-transfer queues.
//!
//! The upload queue hands out byte ranges to the sharing peer and keeps at
//! most `drift` of them outstanding. The download queue buffers filled chunks
//! until the requesting peer pulls and acknowledges them. Neither queue locks;
//! the owner serializes access.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// A byte range of a file, without its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub offset: u64,
    pub size: u64,
    pub sequence: u64,
}

impl ChunkRange {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn matches(&self, offset: u64, size: u64) -> bool {
        self.offset == offset && self.size == size
    }
}

/// A contiguous slice of a file in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub offset: u64,
    pub size: u64,
    pub data: Vec<u8>,
    pub sequence: u64,
    pub acked: bool,
}

impl Chunk {
    pub fn new(range: ChunkRange, data: Vec<u8>) -> Self {
        Self {
            offset: range.offset,
            size: range.size,
            data,
            sequence: range.sequence,
            acked: false,
        }
    }

    pub fn range(&self) -> ChunkRange {
        ChunkRange {
            offset: self.offset,
            size: self.size,
            sequence: self.sequence,
        }
    }

    /// Size matches the payload and the range fits in the file.
    pub fn is_valid_for(&self, file_size: u64) -> bool {
        self.size > 0
            && self.data.len() as u64 == self.size
            && self
                .offset
                .checked_add(self.size)
                .map_or(false, |end| end <= file_size)
    }
}

// ---------------------------------------------------------------------------
// Upload queue
// ---------------------------------------------------------------------------

/// Producer side of a transfer.
#[derive(Debug)]
pub struct UploadQueue {
    file_size: u64,
    chunk_size: u64,
    /// Maximum outstanding ranges; 0 means unbounded
    drift: u64,
    next_offset: u64,
    next_sequence: u64,
    outstanding: Vec<ChunkRange>,
}

impl UploadQueue {
    pub fn new(file_size: u64, chunk_size: u64, drift: u64) -> Self {
        Self {
            file_size,
            chunk_size: chunk_size.max(1),
            drift,
            next_offset: 0,
            next_sequence: 0,
            outstanding: Vec::new(),
        }
    }

    /// Next range to read, or `None` if the file is exhausted or the
    /// outstanding window is full.
    pub fn push(&mut self) -> Option<ChunkRange> {
        if self.next_offset >= self.file_size {
            return None;
        }
        if self.drift > 0 && self.outstanding.len() as u64 >= self.drift {
            return None;
        }

        let size = self.chunk_size.min(self.file_size - self.next_offset);
        let range = ChunkRange {
            offset: self.next_offset,
            size,
            sequence: self.next_sequence,
        };
        self.next_offset += size;
        self.next_sequence += 1;
        self.outstanding.push(range);
        Some(range)
    }

    /// Remove the outstanding range matching `offset` and `size`.
    /// Returns false when no such range is outstanding.
    pub fn ack(&mut self, offset: u64, size: u64) -> bool {
        match self.outstanding.iter().position(|r| r.matches(offset, size)) {
            Some(idx) => {
                self.outstanding.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_outstanding(&self, offset: u64, size: u64) -> bool {
        self.outstanding.iter().any(|r| r.matches(offset, size))
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn done(&self) -> bool {
        self.next_offset >= self.file_size && self.outstanding.is_empty()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

// ---------------------------------------------------------------------------
// Download queue
// ---------------------------------------------------------------------------

/// Consumer side of a transfer.
///
/// `buffer` holds filled chunks not yet delivered; `in_flight` holds chunks
/// delivered but not yet acknowledged by the downloader.
#[derive(Debug)]
pub struct DownloadQueue {
    capacity: usize,
    buffer: VecDeque<Chunk>,
    in_flight: Vec<Chunk>,
}

impl DownloadQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: VecDeque::new(),
            in_flight: Vec::new(),
        }
    }

    pub fn full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Enqueue at the back. Hands the chunk back when the buffer is full.
    pub fn push(&mut self, chunk: Chunk) -> Result<(), Chunk> {
        if self.full() {
            return Err(chunk);
        }
        self.buffer.push_back(chunk);
        Ok(())
    }

    /// Re-queue at the front; used for redelivery, so capacity is not checked.
    pub fn push_front(&mut self, chunk: Chunk) {
        self.buffer.push_front(chunk);
    }

    /// Take the next chunk for delivery and track it until acknowledged.
    pub fn pop(&mut self) -> Option<Chunk> {
        let chunk = self.buffer.pop_front()?;
        self.in_flight.push(chunk.clone());
        Some(chunk)
    }

    /// Remove the first buffered chunk matching `pred` without delivering it.
    pub fn pop_if<F>(&mut self, pred: F) -> Option<Chunk>
    where
        F: Fn(&Chunk) -> bool,
    {
        let idx = self.buffer.iter().position(|c| pred(c))?;
        self.buffer.remove(idx)
    }

    /// Acknowledge a delivered chunk. A chunk the peer already holds that is
    /// still buffered for redelivery is dropped as well.
    pub fn ack(&mut self, offset: u64, size: u64) -> bool {
        if let Some(idx) = self
            .in_flight
            .iter()
            .position(|c| c.offset == offset && c.size == size)
        {
            self.in_flight.remove(idx);
            return true;
        }
        self.pop_if(|c| c.offset == offset && c.size == size).is_some()
    }

    /// Move delivered-but-unacknowledged chunks back to the front, oldest first.
    pub fn requeue_unacked(&mut self) -> usize {
        let pending = std::mem::take(&mut self.in_flight);
        let count = pending.len();
        for chunk in pending.into_iter().rev() {
            self.push_front(chunk);
        }
        count
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn done(&self, upload_done: bool) -> bool {
        upload_done && self.buffer.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(range: ChunkRange) -> Chunk {
        Chunk::new(range, vec![0xab; range.size as usize])
    }

    #[test]
    fn test_drift_window_blocks_until_ack() {
        let mut q = UploadQueue::new(1000, 100, 3);
        let offsets: Vec<u64> = (0..3).filter_map(|_| q.push()).map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 100, 200]);
        assert!(q.push().is_none());

        assert!(q.ack(0, 100));
        let next = q.push().unwrap();
        assert_eq!(next.offset, 300);
        assert_eq!(next.sequence, 3);
    }

    #[test]
    fn test_ack_requires_matching_size() {
        let mut q = UploadQueue::new(1000, 100, 1);
        q.push().unwrap();
        assert!(!q.ack(0, 50));
        assert!(q.push().is_none());
        assert!(q.ack(0, 100));
        assert!(q.push().is_some());
    }

    #[test]
    fn test_ranges_fit_file_and_never_decrease() {
        let mut q = UploadQueue::new(1050, 100, 0);
        let mut last = 0;
        let mut total = 0;
        while let Some(range) = q.push() {
            assert!(range.offset >= last);
            assert!(range.end() <= 1050);
            last = range.offset;
            total += range.size;
        }
        assert_eq!(total, 1050);
        assert_eq!(q.outstanding(), 11);
        assert_eq!(last, 1000);
    }

    #[test]
    fn test_upload_done_needs_all_acks() {
        let mut q = UploadQueue::new(150, 100, 0);
        let a = q.push().unwrap();
        let b = q.push().unwrap();
        assert_eq!(b.size, 50);
        assert!(!q.done());
        q.ack(a.offset, a.size);
        assert!(!q.done());
        q.ack(b.offset, b.size);
        assert!(q.done());
    }

    #[test]
    fn test_empty_file_is_done() {
        let mut q = UploadQueue::new(0, 100, 2);
        assert!(q.push().is_none());
        assert!(q.done());
    }

    #[test]
    fn test_download_capacity() {
        let mut up = UploadQueue::new(300, 100, 0);
        let mut q = DownloadQueue::new(2);
        assert!(q.push(fill(up.push().unwrap())).is_ok());
        assert!(q.push(fill(up.push().unwrap())).is_ok());
        assert!(q.full());
        let rejected = q.push(fill(up.push().unwrap())).unwrap_err();
        assert_eq!(rejected.offset, 200);
    }

    #[test]
    fn test_unacked_chunk_is_redelivered_first() {
        let mut up = UploadQueue::new(300, 100, 0);
        let mut q = DownloadQueue::new(4);
        for _ in 0..3 {
            q.push(fill(up.push().unwrap())).unwrap();
        }

        let first = q.pop().unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(q.requeue_unacked(), 1);

        let again = q.pop().unwrap();
        assert_eq!(again.offset, 0);
        assert!(q.ack(0, 100));
        assert_eq!(q.in_flight(), 0);
        assert_eq!(q.pop().unwrap().offset, 100);
    }

    #[test]
    fn test_pop_if_removes_matching_chunk() {
        let mut up = UploadQueue::new(300, 100, 0);
        let mut q = DownloadQueue::new(4);
        for _ in 0..3 {
            q.push(fill(up.push().unwrap())).unwrap();
        }
        let removed = q.pop_if(|c| c.offset == 100 && c.size == 100).unwrap();
        assert_eq!(removed.sequence, 1);
        assert_eq!(q.len(), 2);
        assert!(q.pop_if(|c| c.offset == 100).is_none());
    }

    #[test]
    fn test_transfer_completes_end_to_end() {
        let mut up = UploadQueue::new(250, 100, 2);
        let mut down = DownloadQueue::new(4);

        let mut received = 0;
        loop {
            while let Some(range) = up.push() {
                down.push(fill(range)).unwrap();
            }
            match down.pop() {
                Some(chunk) => {
                    received += chunk.size;
                    down.ack(chunk.offset, chunk.size);
                    up.ack(chunk.offset, chunk.size);
                }
                None => break,
            }
        }

        assert_eq!(received, 250);
        assert!(up.done());
        assert!(down.done(up.done()));
    }

    #[test]
    fn test_chunk_validity() {
        let chunk = Chunk::new(
            ChunkRange {
                offset: 900,
                size: 100,
                sequence: 9,
            },
            vec![1; 100],
        );
        assert!(chunk.is_valid_for(1000));
        assert!(!chunk.is_valid_for(999));

        let mut short = chunk.clone();
        short.data.pop();
        assert!(!short.is_valid_for(1000));
    }
}
