//! On-disk overflow queue (the "secondary" tier of C2).
//!
//! Persists whole batches using a length-prefixed binary record format, one
//! file per batch, named by a monotonic sequence number so directory order
//! is FIFO order. Grounded on the magic-bytes + u32-length-prefix framing
//! used for dead-letter-queue records elsewhere in the corpus, adapted from
//! a single append-only blob to one-file-per-record so oldest-batch
//! eviction doesn't require rewriting the whole queue.

use crate::error::QueueError;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MAGIC: &[u8; 8] = b"SINKQ001";

/// Caller-supplied encoder/decoder for one record type, keeping the queue
/// itself payload-agnostic.
pub trait BatchCodec<T>: Send + Sync {
    fn encode(&self, bytes: &T) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<T, QueueError>;
}

fn file_name(seq: u64) -> String {
    format!("{seq:020}.batch")
}

async fn write_record(path: &Path, payload: &[u8]) -> Result<(), QueueError> {
    if payload.len() > u32::MAX as usize {
        return Err(QueueError::Corrupt("payload exceeds u32::MAX".into()));
    }
    let mut buf = Vec::with_capacity(payload.len() + 12);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(QueueError::Durable)?;
    file.write_all(&buf).await.map_err(QueueError::Durable)?;
    file.flush().await.map_err(QueueError::Durable)?;
    Ok(())
}

async fn read_record(path: &Path) -> Result<Vec<u8>, QueueError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(QueueError::Durable)?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header)
        .await
        .map_err(QueueError::Durable)?;
    if &header[0..8] != MAGIC {
        return Err(QueueError::Corrupt(format!(
            "bad magic in {}",
            path.display()
        )));
    }
    let len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)
        .await
        .map_err(QueueError::Durable)?;
    Ok(payload)
}

/// File-backed overflow queue. Enforces `QueueMaxBatches`; on overflow the
/// oldest batch is discarded and the caller increments its non-recoverable
/// counter.
pub struct DurableQueue<T> {
    dir: PathBuf,
    max_batches: usize,
    seqs: std::collections::VecDeque<u64>,
    next_seq: u64,
    codec: Box<dyn BatchCodec<T>>,
}

impl<T> DurableQueue<T> {
    /// Opens (creating if needed) the directory and indexes any existing
    /// batch files by sequence number, oldest first, for replay.
    pub async fn open(
        dir: impl Into<PathBuf>,
        max_batches: usize,
        codec: Box<dyn BatchCodec<T>>,
    ) -> Result<Self, QueueError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(QueueError::Durable)?;

        let mut seqs = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(QueueError::Durable)?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(QueueError::Durable)?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".batch") else {
                continue;
            };
            if let Ok(seq) = stem.parse::<u64>() {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        let next_seq = seqs.last().map(|s| s + 1).unwrap_or(0);

        Ok(Self {
            dir,
            max_batches,
            seqs: seqs.into(),
            next_seq,
            codec,
        })
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.seqs.len() >= self.max_batches
    }

    /// Push one batch. If full, evicts the oldest and returns `true` to
    /// signal the caller should increment its non-recoverable counter.
    pub async fn push(&mut self, batch: &T) -> Result<bool, QueueError> {
        let mut evicted = false;
        if self.is_full() {
            self.evict_oldest().await?;
            evicted = true;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let payload = self.codec.encode(batch);
        let path = self.dir.join(file_name(seq));
        write_record(&path, &payload).await?;
        self.seqs.push_back(seq);
        Ok(evicted)
    }

    async fn evict_oldest(&mut self) -> Result<(), QueueError> {
        if let Some(seq) = self.seqs.pop_front() {
            let path = self.dir.join(file_name(seq));
            tokio::fs::remove_file(&path).await.ok();
        }
        Ok(())
    }

    /// Pop the oldest batch, decoding it and deleting its file. Corrupt
    /// records are skipped (and their file removed) with a warning, rather
    /// than blocking replay forever.
    pub async fn pop_front(&mut self) -> Result<Option<T>, QueueError> {
        while let Some(seq) = self.seqs.pop_front() {
            let path = self.dir.join(file_name(seq));
            match read_record(&path).await {
                Ok(payload) => {
                    tokio::fs::remove_file(&path).await.ok();
                    match self.codec.decode(&payload) {
                        Ok(batch) => return Ok(Some(batch)),
                        Err(err) => {
                            tracing::warn!(seq, error = %err, "dropping corrupt durable queue record");
                            continue;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(seq, error = %err, "dropping unreadable durable queue record");
                    tokio::fs::remove_file(&path).await.ok();
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Drain every batch currently on disk, in FIFO order. Used on startup
    /// replay, which proceeds to completion before the queue accepts newly
    /// produced batches on that sink.
    pub async fn replay_all(&mut self) -> Result<Vec<T>, QueueError> {
        let mut out = Vec::with_capacity(self.seqs.len());
        while let Some(batch) = self.pop_front().await? {
            out.push(batch);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BytesCodec;
    impl BatchCodec<Vec<u8>> for BytesCodec {
        fn encode(&self, bytes: &Vec<u8>) -> Vec<u8> {
            bytes.clone()
        }
        fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, QueueError> {
            Ok(bytes.to_vec())
        }
    }

    fn tmp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("durable-queue-test-{name}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn push_pop_round_trips_in_fifo_order() {
        let dir = tmp_dir("roundtrip");
        let mut queue = DurableQueue::open(&dir, 10, Box::new(BytesCodec)).await.unwrap();
        queue.push(&vec![1, 2, 3]).await.unwrap();
        queue.push(&vec![4, 5]).await.unwrap();

        assert_eq!(queue.pop_front().await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(queue.pop_front().await.unwrap(), Some(vec![4, 5]));
        assert_eq!(queue.pop_front().await.unwrap(), None);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn overflow_evicts_oldest() {
        let dir = tmp_dir("overflow");
        let mut queue = DurableQueue::open(&dir, 2, Box::new(BytesCodec)).await.unwrap();
        queue.push(&vec![1]).await.unwrap();
        queue.push(&vec![2]).await.unwrap();
        let evicted = queue.push(&vec![3]).await.unwrap();
        assert!(evicted);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().await.unwrap(), Some(vec![2]));
        assert_eq!(queue.pop_front().await.unwrap(), Some(vec![3]));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn replay_after_reopen_restores_all_batches() {
        let dir = tmp_dir("replay");
        {
            let mut queue = DurableQueue::open(&dir, 10, Box::new(BytesCodec)).await.unwrap();
            queue.push(&vec![9]).await.unwrap();
            queue.push(&vec![8]).await.unwrap();
        }

        let mut reopened = DurableQueue::open(&dir, 10, Box::new(BytesCodec)).await.unwrap();
        let replayed = reopened.replay_all().await.unwrap();
        assert_eq!(replayed, vec![vec![9], vec![8]]);
        assert!(reopened.is_empty());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
