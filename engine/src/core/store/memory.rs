//! In-Memory Index Store
//!
//! Non-durable [`IndexStore`] for tests and ephemeral engines.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{check_commit, count_mismatch, IndexStore, ProcessedMarker, StoredChunk};
use crate::core::{CoreError, CoreResult, VideoId};

#[derive(Default)]
struct MemoryState {
    /// Insertion order
    chunks: Vec<StoredChunk>,
    markers: BTreeMap<VideoId, ProcessedMarker>,
}

impl MemoryState {
    fn contains(&self, chunk_id: &str) -> bool {
        self.chunks.iter().any(|c| c.chunk_id() == chunk_id)
    }

    fn check_new(&self, chunks: &[StoredChunk]) -> CoreResult<()> {
        let mut seen = HashSet::with_capacity(chunks.len());
        for stored in chunks {
            if self.contains(stored.chunk_id()) || !seen.insert(stored.chunk_id()) {
                return Err(CoreError::DuplicateChunk(stored.chunk_id().to_string()));
            }
        }
        Ok(())
    }
}

/// Volatile [`IndexStore`]
#[derive(Default)]
pub struct MemoryIndexStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
    fail_commits: AtomicBool,
    commit_attempts: AtomicUsize,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with `IndexUnavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes only `commit_video` fail; purges and deletes still succeed
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of `commit_video` calls, failed ones included
    pub fn commit_attempts(&self) -> usize {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::IndexUnavailable("memory store lock poisoned".to_string()))
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::IndexUnavailable(
                "memory store is failing writes".to_string(),
            ));
        }
        Ok(())
    }
}

impl IndexStore for MemoryIndexStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_chunk(&self, chunk_id: &str) -> CoreResult<Option<StoredChunk>> {
        Ok(self
            .lock()?
            .chunks
            .iter()
            .find(|c| c.chunk_id() == chunk_id)
            .cloned())
    }

    fn has_chunk(&self, chunk_id: &str) -> CoreResult<bool> {
        Ok(self.lock()?.contains(chunk_id))
    }

    fn put_chunks(&self, chunks: &[StoredChunk]) -> CoreResult<()> {
        self.check_writable()?;
        let mut state = self.lock()?;
        state.check_new(chunks)?;
        state.chunks.extend_from_slice(chunks);
        Ok(())
    }

    fn chunks_for_video(&self, video_id: &str) -> CoreResult<Vec<StoredChunk>> {
        Ok(self
            .lock()?
            .chunks
            .iter()
            .filter(|c| c.video_id() == video_id)
            .cloned()
            .collect())
    }

    fn all_chunks(&self) -> CoreResult<Vec<StoredChunk>> {
        Ok(self.lock()?.chunks.clone())
    }

    fn chunk_count(&self) -> CoreResult<usize> {
        Ok(self.lock()?.chunks.len())
    }

    fn chunk_count_for_video(&self, video_id: &str) -> CoreResult<usize> {
        Ok(self
            .lock()?
            .chunks
            .iter()
            .filter(|c| c.video_id() == video_id)
            .count())
    }

    fn videos_with_chunks(&self) -> CoreResult<Vec<VideoId>> {
        let state = self.lock()?;
        let mut videos: Vec<VideoId> = state
            .chunks
            .iter()
            .map(|c| c.video_id().to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        videos.sort();
        Ok(videos)
    }

    fn get_marker(&self, video_id: &str) -> CoreResult<Option<ProcessedMarker>> {
        Ok(self.lock()?.markers.get(video_id).cloned())
    }

    fn put_marker(&self, marker: &ProcessedMarker) -> CoreResult<()> {
        self.check_writable()?;
        self.lock()?
            .markers
            .insert(marker.video_id.clone(), marker.clone());
        Ok(())
    }

    fn remove_marker(&self, video_id: &str) -> CoreResult<bool> {
        self.check_writable()?;
        Ok(self.lock()?.markers.remove(video_id).is_some())
    }

    fn markers(&self) -> CoreResult<Vec<ProcessedMarker>> {
        Ok(self.lock()?.markers.values().cloned().collect())
    }

    fn delete_video(&self, video_id: &str) -> CoreResult<usize> {
        self.check_writable()?;
        let mut state = self.lock()?;
        let before = state.chunks.len();
        state.chunks.retain(|c| c.video_id() != video_id);
        state.markers.remove(video_id);
        Ok(before - state.chunks.len())
    }

    fn commit_video(&self, marker: &ProcessedMarker, chunks: &[StoredChunk]) -> CoreResult<()> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        check_commit(marker, chunks)?;
        self.check_writable()?;
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(CoreError::IndexUnavailable(
                "memory store is failing commits".to_string(),
            ));
        }

        let mut state = self.lock()?;
        let existing = state
            .chunks
            .iter()
            .filter(|c| c.video_id() == marker.video_id)
            .count();
        if existing + chunks.len() != marker.chunk_count {
            return Err(count_mismatch(marker, existing + chunks.len()));
        }
        state.check_new(chunks)?;

        state.chunks.extend_from_slice(chunks);
        state
            .markers
            .insert(marker.video_id.clone(), marker.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::tests::{exercise_store, stored};

    #[test]
    fn test_store_contract() {
        exercise_store(&MemoryIndexStore::new());
    }

    #[test]
    fn test_failing_writes_change_nothing() {
        let store = MemoryIndexStore::new();
        store.set_fail_writes(true);

        let err = store
            .commit_video(&ProcessedMarker::new("vid", 1, "mock"), &[stored("vid", 0, "x")])
            .unwrap_err();

        assert!(matches!(err, CoreError::IndexUnavailable(_)));
        assert!(store.all_chunks().unwrap().is_empty());
        assert!(!store.has_marker("vid").unwrap());

        store.set_fail_writes(false);
        store
            .commit_video(&ProcessedMarker::new("vid", 1, "mock"), &[stored("vid", 0, "x")])
            .unwrap();
        assert!(store.has_marker("vid").unwrap());
    }

    #[test]
    fn test_failing_commits_still_allow_deletes() {
        let store = MemoryIndexStore::new();
        store.put_chunks(&[stored("vid", 0, "x")]).unwrap();
        store.set_fail_commits(true);

        assert_eq!(store.delete_video("vid").unwrap(), 1);
        assert!(store
            .commit_video(&ProcessedMarker::new("vid", 1, "mock"), &[stored("vid", 0, "x")])
            .is_err());
        assert_eq!(store.commit_attempts(), 1);
        assert!(store.all_chunks().unwrap().is_empty());
    }
}
