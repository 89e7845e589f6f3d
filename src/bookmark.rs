//! Bookmark coordinator (C5): per-source last-acknowledged position.

use crate::envelope::Envelope;
use crate::error::BookmarkError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// `{sourceKey, highestCommittedPosition}`, mutated only by the coordinator.
#[derive(Debug, Clone)]
struct BookmarkRecord {
    highest_committed_position: u64,
    dirty: bool,
}

struct Registration {
    /// Once a dispatcher's first batch shows no envelope carries a bookmark
    /// key, grouping is skipped on every subsequent batch for that
    /// dispatcher (the "first-batch optimization").
    bookmarkable: Option<bool>,
}

/// Process-wide, shared across sinks; serializes per-key updates
/// internally. One file per source key is written under `dir` on a
/// periodic sync and on orderly shutdown.
pub struct BookmarkCoordinator {
    records: Mutex<HashMap<String, BookmarkRecord>>,
    registrations: Mutex<HashMap<u64, Registration>>,
    next_dispatcher_id: std::sync::atomic::AtomicU64,
    dir: Option<PathBuf>,
}

impl BookmarkCoordinator {
    /// In-memory only coordinator (no durable persistence).
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            next_dispatcher_id: std::sync::atomic::AtomicU64::new(0),
            dir: None,
        })
    }

    /// Coordinator that persists one file per source key under `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>, BookmarkError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| BookmarkError::Io {
                source_key: dir.display().to_string(),
                source,
            })?;

        let mut records = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|source| BookmarkError::Io {
                source_key: dir.display().to_string(),
                source,
            })?;
        while let Some(entry) = entries.next_entry().await.map_err(|source| BookmarkError::Io {
            source_key: dir.display().to_string(),
            source,
        })? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(f) => f,
                Err(_) => continue,
            };
            let mut buf = [0u8; 8];
            if file.read_exact(&mut buf).await.is_ok() {
                let position = u64::from_le_bytes(buf);
                records.insert(
                    file_name.to_string(),
                    BookmarkRecord {
                        highest_committed_position: position,
                        dirty: false,
                    },
                );
            }
        }

        Ok(Arc::new(Self {
            records: Mutex::new(records),
            registrations: Mutex::new(HashMap::new()),
            next_dispatcher_id: std::sync::atomic::AtomicU64::new(0),
            dir: Some(dir),
        }))
    }

    /// Register a dispatcher, returning a handle used to look up whether a
    /// source is bookmarkable. A source whose file is missing starts at
    /// position 0.
    pub fn register_dispatcher(&self) -> u64 {
        let id = self
            .next_dispatcher_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.registrations
            .lock()
            .insert(id, Registration { bookmarkable: None });
        id
    }

    pub fn initial_position(&self, source_key: &str) -> u64 {
        self.records
            .lock()
            .get(source_key)
            .map(|r| r.highest_committed_position)
            .unwrap_or(0)
    }

    /// Groups envelopes by `bookmark_key`, takes `max(position)` per key, and
    /// commits. No-op (and remembered as such) once a dispatcher's first
    /// batch shows no envelope carries a key.
    pub fn on_batch_acked<T>(&self, dispatcher_id: u64, envelopes: &[Envelope<T>]) {
        let mut regs = self.registrations.lock();
        let reg = regs
            .entry(dispatcher_id)
            .or_insert(Registration { bookmarkable: None });

        if reg.bookmarkable == Some(false) {
            return;
        }

        let mut by_key: HashMap<&str, u64> = HashMap::new();
        for env in envelopes {
            if let Some(key) = env.bookmark_key.as_deref() {
                let entry = by_key.entry(key).or_insert(0);
                if env.position > *entry {
                    *entry = env.position;
                }
            }
        }

        if reg.bookmarkable.is_none() {
            reg.bookmarkable = Some(!by_key.is_empty());
        }
        drop(regs);

        for (key, position) in by_key {
            // best-effort: per spec, committing rejects non-monotonic values
            // but does not propagate that as a dispatcher-loop error.
            let _ = self.commit(key, position);
        }
    }

    /// Commit `position` for `source_key`, rejecting any value less than the
    /// current committed value.
    pub fn commit(&self, source_key: &str, position: u64) -> Result<(), BookmarkError> {
        let mut records = self.records.lock();
        let record = records
            .entry(source_key.to_string())
            .or_insert(BookmarkRecord {
                highest_committed_position: 0,
                dirty: false,
            });

        if position < record.highest_committed_position {
            return Err(BookmarkError::NonMonotonic {
                source_key: source_key.to_string(),
                committed: record.highest_committed_position,
                attempted: position,
            });
        }

        if position > record.highest_committed_position {
            record.highest_committed_position = position;
            record.dirty = true;
        }
        Ok(())
    }

    pub fn committed(&self, source_key: &str) -> Option<u64> {
        self.records
            .lock()
            .get(source_key)
            .map(|r| r.highest_committed_position)
    }

    /// Flush every dirty bookmark to disk. No-op for in-memory coordinators.
    pub async fn sync(&self) -> Result<(), BookmarkError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let dirty: Vec<(String, u64)> = {
            let mut records = self.records.lock();
            records
                .iter_mut()
                .filter(|(_, r)| r.dirty)
                .map(|(k, r)| {
                    r.dirty = false;
                    (k.clone(), r.highest_committed_position)
                })
                .collect()
        };

        for (key, position) in dirty {
            let path = dir.join(&key);
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(|source| BookmarkError::Io {
                    source_key: key.clone(),
                    source,
                })?;
            file.write_all(&position.to_le_bytes())
                .await
                .map_err(|source| BookmarkError::Io {
                    source_key: key.clone(),
                    source,
                })?;
            file.flush().await.map_err(|source| BookmarkError::Io {
                source_key: key,
                source,
            })?;
        }
        Ok(())
    }

    /// Spawn the periodic sync task (default: once per second). The
    /// returned handle should be aborted on orderly shutdown, after one
    /// final `sync()` call.
    pub fn spawn_periodic_sync(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = this.sync().await {
                    tracing::warn!(error = %err, "bookmark sync failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_rejects_non_monotonic() {
        let coord = BookmarkCoordinator::in_memory();
        coord.commit("k1", 100).unwrap();
        assert!(coord.commit("k1", 50).is_err());
        assert_eq!(coord.committed("k1"), Some(100));
    }

    #[test]
    fn on_batch_acked_groups_by_key_and_takes_max() {
        let coord = BookmarkCoordinator::in_memory();
        let id = coord.register_dispatcher();
        let envs = vec![
            Envelope::new(1u8, 3).with_bookmark_key("k1"),
            Envelope::new(1u8, 1).with_bookmark_key("k1"),
            Envelope::new(1u8, 9).with_bookmark_key("k2"),
        ];
        coord.on_batch_acked(id, &envs);
        assert_eq!(coord.committed("k1"), Some(3));
        assert_eq!(coord.committed("k2"), Some(9));
    }

    #[test]
    fn not_bookmarkable_sources_are_remembered_after_first_batch() {
        let coord = BookmarkCoordinator::in_memory();
        let id = coord.register_dispatcher();
        let envs = vec![Envelope::new(1u8, 1)]; // no bookmark_key
        coord.on_batch_acked(id, &envs);

        let envs2 = vec![Envelope::new(1u8, 2).with_bookmark_key("late")];
        coord.on_batch_acked(id, &envs2);
        // Remembered as not-bookmarkable on the first batch; later keys ignored.
        assert_eq!(coord.committed("late"), None);
    }

    #[tokio::test]
    async fn sync_persists_and_restart_loads_leq_committed() {
        let tmp = std::env::temp_dir().join(format!("bookmark-test-{}", std::process::id()));
        let coord = BookmarkCoordinator::open(&tmp).await.unwrap();
        coord.commit("k1", 100).unwrap();
        coord.sync().await.unwrap();

        let reopened = BookmarkCoordinator::open(&tmp).await.unwrap();
        let loaded = reopened.initial_position("k1");
        assert!(loaded <= 100);
        assert!(reopened.commit("k1", loaded.saturating_sub(1)).is_err() || loaded == 0);

        tokio::fs::remove_dir_all(&tmp).await.ok();
    }
}
