//! Vector Index Module
//!
//! In-memory store of chunk vectors plus metadata with exact
//! nearest-neighbor search.
//!
//! Writes are serialized behind an `RwLock` and validated before any
//! mutation, so readers never observe a partially added batch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::core::chunking::Chunk;
use crate::core::{ChunkId, CoreError, CoreResult, TimeRange, TimeSec, VideoId};

// =============================================================================
// Types
// =============================================================================

/// Distance metric, fixed at construction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Euclidean distance
    L2,
    /// `1 - cos(a, b)` over L2-normalized vectors (inner product)
    #[default]
    Cosine,
}

impl DistanceMetric {
    /// Maps a distance to a similarity in `[0, 1]`, decreasing in distance
    pub fn similarity(&self, distance: f32) -> f32 {
        if !distance.is_finite() {
            return 0.0;
        }
        match self {
            DistanceMetric::Cosine => (1.0 - distance / 2.0).clamp(0.0, 1.0),
            DistanceMetric::L2 => 1.0 / (1.0 + distance.max(0.0)),
        }
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - dot(a, b),
            DistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceMetric::L2 => write!(f, "l2"),
            DistanceMetric::Cosine => write!(f, "cosine"),
        }
    }
}

/// A chunk vector with the metadata needed to render a result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub chunk_id: ChunkId,
    pub video_id: VideoId,
    pub vector: Vec<f32>,
    pub start_sec: TimeSec,
    pub end_sec: TimeSec,
    pub text: String,
}

impl IndexEntry {
    /// Creates an entry for `chunk`
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            video_id: chunk.video_id.clone(),
            vector,
            start_sec: chunk.start_sec,
            end_sec: chunk.end_sec,
            text: chunk.text.clone(),
        }
    }
}

/// Restricts a search to a subset of videos
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ScopeFilter {
    /// Every entry
    #[default]
    All,
    /// One video
    Video(VideoId),
    /// Any of several videos
    Videos(HashSet<VideoId>),
}

impl ScopeFilter {
    /// Scope from an optional list of video ids (empty means everything)
    pub fn from_videos(videos: &[VideoId]) -> Self {
        match videos {
            [] => ScopeFilter::All,
            [single] => ScopeFilter::Video(single.clone()),
            many => ScopeFilter::Videos(many.iter().cloned().collect()),
        }
    }

    pub fn matches(&self, video_id: &str) -> bool {
        match self {
            ScopeFilter::All => true,
            ScopeFilter::Video(id) => id == video_id,
            ScopeFilter::Videos(ids) => ids.contains(video_id),
        }
    }
}

/// One search result
#[derive(Clone, Debug)]
pub struct IndexHit {
    pub entry: Arc<IndexEntry>,
    pub distance: f32,
}

/// Index statistics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub entry_count: usize,
    pub video_count: usize,
    pub dimension: usize,
    pub metric: DistanceMetric,
}

// =============================================================================
// Vector Index
// =============================================================================

struct Slot {
    seq: u64,
    entry: Arc<IndexEntry>,
    /// Unit-length copy of the vector (cosine only)
    unit: Option<Vec<f32>>,
}

impl Slot {
    fn search_vector(&self) -> &[f32] {
        self.unit.as_deref().unwrap_or(&self.entry.vector)
    }
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    by_id: HashMap<ChunkId, usize>,
    next_seq: u64,
}

impl Inner {
    fn reindex(&mut self) {
        self.by_id = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.entry.chunk_id.clone(), i))
            .collect();
    }
}

/// Exact nearest-neighbor index over chunk vectors
pub struct VectorIndex {
    dimension: usize,
    metric: DistanceMetric,
    inner: RwLock<Inner>,
}

impl VectorIndex {
    /// Creates an empty index
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn read(&self) -> CoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| CoreError::IndexUnavailable("index lock poisoned".to_string()))
    }

    fn write(&self) -> CoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| CoreError::IndexUnavailable("index lock poisoned".to_string()))
    }

    fn check_vector(&self, vector: &[f32]) -> CoreResult<()> {
        if vector.len() != self.dimension {
            return Err(CoreError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(CoreError::ValidationError(
                "vector contains non-finite components".to_string(),
            ));
        }
        Ok(())
    }

    fn make_slot(&self, seq: u64, entry: IndexEntry) -> Slot {
        let unit = match self.metric {
            DistanceMetric::Cosine => Some(normalized(&entry.vector)),
            DistanceMetric::L2 => None,
        };
        Slot {
            seq,
            entry: Arc::new(entry),
            unit,
        }
    }

    /// Adds one entry
    pub fn add(&self, entry: IndexEntry) -> CoreResult<()> {
        self.add_batch(vec![entry])
    }

    /// Adds entries in order, all or nothing.
    ///
    /// Every entry is checked for dimension and id uniqueness (against the
    /// index and within the batch) before the index changes.
    pub fn add_batch(&self, entries: Vec<IndexEntry>) -> CoreResult<()> {
        for entry in &entries {
            self.check_vector(&entry.vector)?;
        }

        let mut inner = self.write()?;

        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if inner.by_id.contains_key(&entry.chunk_id) || !seen.insert(entry.chunk_id.as_str()) {
                return Err(CoreError::DuplicateChunk(entry.chunk_id.clone()));
            }
        }

        for entry in entries {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let position = inner.slots.len();
            inner.by_id.insert(entry.chunk_id.clone(), position);
            let slot = self.make_slot(seq, entry);
            inner.slots.push(slot);
        }

        Ok(())
    }

    /// Returns at most `k` entries by ascending distance, ties by insertion order.
    pub fn search(&self, query: &[f32], k: usize, scope: &ScopeFilter) -> CoreResult<Vec<IndexHit>> {
        self.search_within(query, k, scope, None)
    }

    /// Like [`search`](Self::search), keeping only entries whose span
    /// overlaps `range` when one is given.
    pub fn search_within(
        &self,
        query: &[f32],
        k: usize,
        scope: &ScopeFilter,
        range: Option<&TimeRange>,
    ) -> CoreResult<Vec<IndexHit>> {
        self.check_vector(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let unit_query;
        let query = match self.metric {
            DistanceMetric::Cosine => {
                unit_query = normalized(query);
                unit_query.as_slice()
            }
            DistanceMetric::L2 => query,
        };

        let inner = self.read()?;
        let mut scored: Vec<(f32, u64, &Slot)> = inner
            .slots
            .iter()
            .filter(|slot| scope.matches(&slot.entry.video_id))
            .filter(|slot| range.map_or(true, |r| r.overlaps(slot.entry.start_sec, slot.entry.end_sec)))
            .map(|slot| (self.metric.distance(query, slot.search_vector()), slot.seq, slot))
            .collect();

        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(distance, _, slot)| IndexHit {
                entry: Arc::clone(&slot.entry),
                distance,
            })
            .collect())
    }

    /// Removes every entry of `video_id`, returning how many were removed
    pub fn remove_video(&self, video_id: &str) -> CoreResult<usize> {
        let mut inner = self.write()?;
        let before = inner.slots.len();
        inner.slots.retain(|slot| slot.entry.video_id != video_id);
        let removed = before - inner.slots.len();
        if removed > 0 {
            inner.reindex();
        }
        Ok(removed)
    }

    /// Removes everything
    pub fn clear(&self) -> CoreResult<()> {
        let mut inner = self.write()?;
        inner.slots.clear();
        inner.by_id.clear();
        Ok(())
    }

    pub fn get(&self, chunk_id: &str) -> CoreResult<Option<Arc<IndexEntry>>> {
        let inner = self.read()?;
        Ok(inner
            .by_id
            .get(chunk_id)
            .map(|&i| Arc::clone(&inner.slots[i].entry)))
    }

    pub fn contains(&self, chunk_id: &str) -> CoreResult<bool> {
        Ok(self.read()?.by_id.contains_key(chunk_id))
    }

    pub fn len(&self) -> CoreResult<usize> {
        Ok(self.read()?.slots.len())
    }

    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Entry count for one video
    pub fn chunk_count_for_video(&self, video_id: &str) -> CoreResult<usize> {
        Ok(self
            .read()?
            .slots
            .iter()
            .filter(|slot| slot.entry.video_id == video_id)
            .count())
    }

    /// Latest chunk end per video
    pub fn video_durations(&self) -> CoreResult<HashMap<VideoId, TimeSec>> {
        let inner = self.read()?;
        let mut durations: HashMap<VideoId, TimeSec> = HashMap::new();
        for slot in &inner.slots {
            let end = durations.entry(slot.entry.video_id.clone()).or_insert(0.0);
            *end = end.max(slot.entry.end_sec);
        }
        Ok(durations)
    }

    pub fn stats(&self) -> CoreResult<IndexStats> {
        let inner = self.read()?;
        let videos: HashSet<&str> = inner
            .slots
            .iter()
            .map(|slot| slot.entry.video_id.as_str())
            .collect();
        Ok(IndexStats {
            entry_count: inner.slots.len(),
            video_count: videos.len(),
            dimension: self.dimension,
            metric: self.metric,
        })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalized(vector: &[f32]) -> Vec<f32> {
    let norm = dot(vector, vector).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::embedding::MockEmbeddingProvider;

    fn entry(chunk_id: &str, video_id: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk_id: chunk_id.to_string(),
            video_id: video_id.to_string(),
            vector,
            start_sec: 0.0,
            end_sec: 10.0,
            text: chunk_id.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Add
    // -------------------------------------------------------------------------

    #[test]
    fn test_add_rejects_wrong_dimension_without_mutation() {
        let index = VectorIndex::new(3, DistanceMetric::L2);
        index.add(entry("a", "v", vec![1.0, 0.0, 0.0])).unwrap();

        let err = index
            .add_batch(vec![
                entry("b", "v", vec![0.0, 1.0, 0.0]),
                entry("c", "v", vec![0.0, 1.0]),
            ])
            .unwrap_err();

        assert!(matches!(err, CoreError::DimensionMismatch { expected: 3, actual: 2 }));
        assert_eq!(index.len().unwrap(), 1);
        assert!(!index.contains("b").unwrap());
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let index = VectorIndex::new(2, DistanceMetric::L2);
        index.add(entry("a", "v", vec![1.0, 0.0])).unwrap();

        assert!(matches!(
            index.add(entry("a", "v", vec![0.0, 1.0])),
            Err(CoreError::DuplicateChunk(_))
        ));
        assert!(matches!(
            index.add_batch(vec![entry("b", "v", vec![0.0, 1.0]), entry("b", "v", vec![1.0, 1.0])]),
            Err(CoreError::DuplicateChunk(_))
        ));
        assert_eq!(index.len().unwrap(), 1);
    }

    #[test]
    fn test_add_rejects_non_finite() {
        let index = VectorIndex::new(2, DistanceMetric::Cosine);
        assert!(index.add(entry("a", "v", vec![f32::NAN, 0.0])).is_err());
        assert!(index.is_empty().unwrap());
    }

    // -------------------------------------------------------------------------
    // Search
    // -------------------------------------------------------------------------

    #[test]
    fn test_search_orders_by_distance_then_insertion() {
        let index = VectorIndex::new(2, DistanceMetric::L2);
        index
            .add_batch(vec![
                entry("far", "v", vec![5.0, 0.0]),
                entry("tie-first", "v", vec![1.0, 0.0]),
                entry("tie-second", "v", vec![0.0, 1.0]),
                entry("exact", "v", vec![0.0, 0.0]),
            ])
            .unwrap();

        let hits = index.search(&[0.0, 0.0], 3, &ScopeFilter::All).unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.entry.chunk_id.as_str()).collect();

        assert_eq!(ids, vec!["exact", "tie-first", "tie-second"]);
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_search_scope_filter() {
        let index = VectorIndex::new(2, DistanceMetric::Cosine);
        index
            .add_batch(vec![
                entry("a1", "a", vec![1.0, 0.0]),
                entry("b1", "b", vec![1.0, 0.1]),
                entry("b2", "b", vec![0.0, 1.0]),
            ])
            .unwrap();

        let hits = index
            .search(&[1.0, 0.0], 10, &ScopeFilter::Video("b".to_string()))
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.chunk_id, "b1");
        assert!(hits.iter().all(|h| h.entry.video_id == "b"));
    }

    #[test]
    fn test_search_within_time_range() {
        let index = VectorIndex::new(2, DistanceMetric::Cosine);
        let timed = |id: &str, start: f64, end: f64, vector: Vec<f32>| IndexEntry {
            start_sec: start,
            end_sec: end,
            ..entry(id, "v", vector)
        };
        index
            .add_batch(vec![
                timed("intro", 0.0, 30.0, vec![1.0, 0.0]),
                timed("middle", 30.0, 90.0, vec![0.9, 0.1]),
                timed("outro", 90.0, 120.0, vec![0.0, 1.0]),
            ])
            .unwrap();

        let range = TimeRange::new(60.0, 100.0).unwrap();
        let hits = index
            .search_within(&[1.0, 0.0], 1, &ScopeFilter::All, Some(&range))
            .unwrap();

        // k applies after the range, so the best in-range chunk still comes back
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk_id, "middle");

        let all = index
            .search_within(&[1.0, 0.0], 10, &ScopeFilter::All, Some(&range))
            .unwrap();
        let ids: Vec<_> = all.iter().map(|h| h.entry.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["middle", "outro"]);
    }

    #[test]
    fn test_search_rejects_wrong_query_dimension() {
        let index = VectorIndex::new(4, DistanceMetric::Cosine);
        assert!(matches!(
            index.search(&[1.0], 5, &ScopeFilter::All),
            Err(CoreError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_search_k_zero_and_empty_index() {
        let index = VectorIndex::new(2, DistanceMetric::L2);
        assert!(index.search(&[0.0, 0.0], 5, &ScopeFilter::All).unwrap().is_empty());
        index.add(entry("a", "v", vec![1.0, 0.0])).unwrap();
        assert!(index.search(&[0.0, 0.0], 0, &ScopeFilter::All).unwrap().is_empty());
    }

    #[test]
    fn test_cosine_is_scale_invariant() {
        let index = VectorIndex::new(2, DistanceMetric::Cosine);
        index.add(entry("a", "v", vec![10.0, 0.0])).unwrap();

        let hits = index.search(&[0.5, 0.0], 1, &ScopeFilter::All).unwrap();
        assert!(hits[0].distance.abs() < 1e-6);
        assert!((DistanceMetric::Cosine.similarity(hits[0].distance) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_self_retrieval() {
        let provider = MockEmbeddingProvider::new(64);
        let texts = [
            "intro to the course",
            "gradient descent explanation with learning rate",
            "thanks for watching outro",
            "backpropagation computes gradients layer by layer",
        ];
        let index = VectorIndex::new(64, DistanceMetric::Cosine);
        for (i, text) in texts.iter().enumerate() {
            let mut e = entry(&format!("c{i}"), "v", provider.embed_text(text));
            e.text = text.to_string();
            index.add(e).unwrap();
        }

        for (i, text) in texts.iter().enumerate() {
            let hits = index
                .search(&provider.embed_text(text), 1, &ScopeFilter::All)
                .unwrap();
            assert_eq!(hits[0].entry.chunk_id, format!("c{i}"));
        }
    }

    #[test]
    fn test_similarity_is_monotonic() {
        for metric in [DistanceMetric::L2, DistanceMetric::Cosine] {
            let near = metric.similarity(0.1);
            let far = metric.similarity(0.9);
            assert!(near > far);
            assert!((0.0..=1.0).contains(&near));
            assert_eq!(metric.similarity(f32::NAN), 0.0);
        }
    }

    // -------------------------------------------------------------------------
    // Removal and stats
    // -------------------------------------------------------------------------

    #[test]
    fn test_remove_video_and_stats() {
        let index = VectorIndex::new(2, DistanceMetric::L2);
        index
            .add_batch(vec![
                entry("a1", "a", vec![1.0, 0.0]),
                entry("b1", "b", vec![0.0, 1.0]),
                entry("a2", "a", vec![1.0, 1.0]),
            ])
            .unwrap();

        assert_eq!(index.stats().unwrap().video_count, 2);
        assert_eq!(index.remove_video("a").unwrap(), 2);
        assert_eq!(index.remove_video("a").unwrap(), 0);

        let stats = index.stats().unwrap();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.video_count, 1);
        assert_eq!(index.get("b1").unwrap().unwrap().video_id, "b");
        assert!(index.get("a1").unwrap().is_none());

        // Ids freed by removal can be reused.
        index.add(entry("a1", "a", vec![1.0, 0.0])).unwrap();
        assert_eq!(index.chunk_count_for_video("a").unwrap(), 1);
    }

    #[test]
    fn test_scope_from_videos() {
        assert_eq!(ScopeFilter::from_videos(&[]), ScopeFilter::All);
        assert_eq!(
            ScopeFilter::from_videos(&["v".to_string()]),
            ScopeFilter::Video("v".to_string())
        );
        let many = ScopeFilter::from_videos(&["a".to_string(), "b".to_string()]);
        assert!(many.matches("b"));
        assert!(!many.matches("c"));
    }

    // -------------------------------------------------------------------------
    // Concurrency
    // -------------------------------------------------------------------------

    #[test]
    fn test_readers_never_see_partial_batches() {
        let index = Arc::new(VectorIndex::new(2, DistanceMetric::L2));
        const BATCH: usize = 5;

        let writer = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for b in 0..50 {
                    let batch = (0..BATCH)
                        .map(|i| entry(&format!("c{b}-{i}"), "v", vec![b as f32, i as f32]))
                        .collect();
                    index.add_batch(batch).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let hits = index
                            .search(&[0.0, 0.0], usize::MAX, &ScopeFilter::All)
                            .unwrap();
                        assert_eq!(hits.len() % BATCH, 0);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(index.len().unwrap(), 250);
    }
}
