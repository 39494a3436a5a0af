//! Write cache: current document state from snapshots, keyframes and replay.
//!
//! Holds derived state only. Anything here can be thrown away and rebuilt
//! from the operation store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use reactor_store::{
    replay_header, visible_operations, HeaderReplay, KeyframeStore, Operation, OperationStore,
    StoreError, StreamKey, HEADER_SCOPE,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::WriteCacheConfig;
use crate::error::{ReactorError, Result};
use crate::locks::KeyedLocks;
use crate::registry::{DocumentModelRegistry, Reducer};
use crate::types::Document;

/// Run the visible subset of `ops` through `reducer`, skipping rows that
/// carry an error marker.
pub fn reduce_operations(
    reducer: &dyn Reducer,
    state: &mut serde_json::Value,
    ops: &[Operation],
    document_id: &str,
) -> Result<()> {
    for op in visible_operations(ops) {
        if op.error.is_some() {
            continue;
        }
        reducer
            .reduce(state, &op.action)
            .map_err(|e| ReactorError::ReducerFailure {
                action_type: op.action.action_type.clone(),
                document_id: document_id.to_string(),
                message: e.to_string(),
            })?;
    }
    Ok(())
}

/// Replaying from `revision` is only sound if no later row's skip reaches
/// behind it.
fn replayable_from(revision: u64, ops: &[Operation]) -> bool {
    ops.iter()
        .all(|op| op.index as i64 - op.skip as i64 >= revision as i64)
}

fn crosses_interval(previous: u64, revision: u64, interval: u64) -> bool {
    interval > 0 && revision > previous && revision / interval > previous / interval
}

// ---------------------------------------------------------------------------
// In-memory ring buffers + LRU
// ---------------------------------------------------------------------------

struct Snapshot {
    revision: u64,
    document: Document,
}

#[derive(Default)]
struct CacheEntries {
    streams: HashMap<StreamKey, VecDeque<Snapshot>>,
    /// Least recently used at the front.
    lru: VecDeque<StreamKey>,
}

impl CacheEntries {
    fn touch(&mut self, key: &StreamKey) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.clone());
    }

    fn exact(&self, key: &StreamKey, target: Option<u64>) -> Option<Document> {
        let ring = self.streams.get(key)?;
        let hit = match target {
            Some(t) => ring.iter().rev().find(|s| s.revision == t),
            None => ring.back(),
        };
        hit.map(|s| s.document.clone())
    }

    fn best_base(&self, key: &StreamKey, target: Option<u64>) -> Option<(u64, Document)> {
        let ring = self.streams.get(key)?;
        ring.iter()
            .rev()
            .find(|s| target.map_or(true, |t| s.revision <= t))
            .map(|s| (s.revision, s.document.clone()))
    }

    /// Returns false when a newer snapshot is already cached.
    fn insert(
        &mut self,
        key: &StreamKey,
        revision: u64,
        document: Document,
        config: &WriteCacheConfig,
    ) -> bool {
        let ring = self.streams.entry(key.clone()).or_default();
        if let Some(newest) = ring.back() {
            if revision < newest.revision {
                return false;
            }
            if revision == newest.revision {
                ring.pop_back();
            }
        }
        ring.push_back(Snapshot { revision, document });
        while ring.len() > config.ring_buffer_size.max(1) {
            ring.pop_front();
        }
        self.touch(key);

        while self.streams.len() > config.max_documents.max(1) {
            let Some(oldest) = self.lru.pop_front() else {
                break;
            };
            self.streams.remove(&oldest);
        }
        true
    }

    fn evict(&mut self, document_id: &str, scope: Option<&str>, branch: Option<&str>) -> usize {
        let matches = |k: &StreamKey| {
            k.document_id == document_id
                && scope.map_or(true, |s| k.scope == s)
                && branch.map_or(true, |b| k.branch == b)
        };
        let before = self.streams.len();
        self.streams.retain(|k, _| !matches(k));
        self.lru.retain(|k| !matches(k));
        before - self.streams.len()
    }
}

// ---------------------------------------------------------------------------
// WriteCache
// ---------------------------------------------------------------------------

pub struct WriteCache {
    store: Arc<dyn OperationStore>,
    keyframes: Arc<dyn KeyframeStore>,
    registry: Arc<DocumentModelRegistry>,
    config: WriteCacheConfig,
    entries: Mutex<CacheEntries>,
    locks: KeyedLocks<String>,
}

impl WriteCache {
    pub fn new(
        store: Arc<dyn OperationStore>,
        keyframes: Arc<dyn KeyframeStore>,
        registry: Arc<DocumentModelRegistry>,
        config: WriteCacheConfig,
    ) -> Self {
        Self {
            store,
            keyframes,
            registry,
            config,
            entries: Mutex::new(CacheEntries::default()),
            locks: KeyedLocks::new(),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, CacheEntries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// State of one stream at `target` revision, or at the newest cached
    /// revision when `target` is `None`.
    pub async fn get_state(&self, stream: &StreamKey, target: Option<u64>) -> Result<Document> {
        let _guard = self.locks.lock(&stream.document_id).await;

        if stream.scope == HEADER_SCOPE {
            let replay = self.load_header(stream).await?;
            return Ok(Document {
                header: replay.header,
                state: BTreeMap::new(),
            });
        }

        let base = {
            let mut entries = self.entries();
            if let Some(document) = entries.exact(stream, target) {
                entries.touch(stream);
                return Ok(document);
            }
            entries.best_base(stream, target)
        };

        let (revision, document) = self.rebuild(stream, target, base).await?;
        self.entries()
            .insert(stream, revision, document.clone(), &self.config);
        Ok(document)
    }

    /// Cache a freshly computed state. Persists a keyframe whenever the commit
    /// from `previous` to `revision` crosses an interval boundary, so multi-op
    /// batches cannot step over one. A lower revision never replaces a higher one.
    pub async fn put_state(
        &self,
        stream: &StreamKey,
        previous: u64,
        revision: u64,
        document: Document,
    ) {
        let _guard = self.locks.lock(&stream.document_id).await;

        let keyframe = crosses_interval(previous, revision, self.config.keyframe_interval)
            .then(|| serde_json::to_value(&document));

        let inserted = self
            .entries()
            .insert(stream, revision, document, &self.config);
        if !inserted {
            debug!(stream = %stream, revision, "Ignoring stale cache write");
            return;
        }

        match keyframe {
            Some(Ok(value)) => {
                if let Err(e) = self.keyframes.put_keyframe(stream, revision, &value).await {
                    warn!(stream = %stream, revision, error = %e, "Failed to persist keyframe");
                }
            }
            Some(Err(e)) => {
                warn!(stream = %stream, revision, error = %e, "Failed to serialize keyframe");
            }
            None => {}
        }
    }

    /// Drop cached state and keyframes for a stream whose history was rewritten.
    pub async fn invalidate(&self, stream: &StreamKey) -> usize {
        let _guard = self.locks.lock(&stream.document_id).await;
        let evicted = self.entries().evict(
            &stream.document_id,
            Some(&stream.scope),
            Some(&stream.branch),
        );
        if let Err(e) = self
            .keyframes
            .delete_keyframes(&stream.document_id, Some(&stream.scope), Some(&stream.branch))
            .await
        {
            warn!(stream = %stream, error = %e, "Failed to delete keyframes");
        }
        evicted
    }

    /// Drop every cached snapshot and keyframe of a document branch. Needed
    /// after header changes, since each snapshot embeds the header.
    pub async fn invalidate_document(&self, document_id: &str, branch: &str) -> usize {
        let _guard = self.locks.lock(&document_id.to_string()).await;
        let evicted = self.entries().evict(document_id, None, Some(branch));
        if let Err(e) = self
            .keyframes
            .delete_keyframes(document_id, None, Some(branch))
            .await
        {
            warn!(document_id, branch, error = %e, "Failed to delete keyframes");
        }
        evicted
    }

    /// Drop in-memory entries only, at document, scope or stream granularity.
    pub fn evict(&self, document_id: &str, scope: Option<&str>, branch: Option<&str>) -> usize {
        self.entries().evict(document_id, scope, branch)
    }

    /// Revisions currently held for a stream, oldest first.
    pub fn cached_revisions(&self, stream: &StreamKey) -> Vec<u64> {
        self.entries()
            .streams
            .get(stream)
            .map(|ring| ring.iter().map(|s| s.revision).collect())
            .unwrap_or_default()
    }

    pub fn cached_streams(&self) -> usize {
        self.entries().streams.len()
    }

    // -----------------------------------------------------------------------
    // Rebuild
    // -----------------------------------------------------------------------

    async fn rebuild(
        &self,
        stream: &StreamKey,
        target: Option<u64>,
        base: Option<(u64, Document)>,
    ) -> Result<(u64, Document)> {
        // Warm: extend a cached snapshot.
        if let Some((revision, document)) = base {
            let ops = self.ops_between(stream, revision, target).await?;
            if replayable_from(revision, &ops) {
                return self.replay(stream, document, revision, &ops);
            }
        }

        // Cold: nearest usable keyframe, walking down past unusable ones.
        let mut ceiling = target.unwrap_or(i64::MAX as u64);
        loop {
            let keyframe = match self.keyframes.find_nearest_keyframe(stream, ceiling).await {
                Ok(k) => k,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "Keyframe lookup failed, replaying from scratch");
                    None
                }
            };
            let Some(keyframe) = keyframe else {
                break;
            };

            let ops = self.ops_between(stream, keyframe.revision, target).await?;
            if replayable_from(keyframe.revision, &ops) {
                match serde_json::from_value::<Document>(keyframe.document) {
                    Ok(document) => return self.replay(stream, document, keyframe.revision, &ops),
                    Err(e) => warn!(stream = %stream, error = %e, "Unreadable keyframe"),
                }
            }
            if keyframe.revision == 0 {
                break;
            }
            ceiling = keyframe.revision - 1;
        }

        let replay = self.load_header(stream).await?;
        let model = self.registry.get(&replay.header.document_type)?;
        let initial = replay
            .initial_state
            .get(&stream.scope)
            .or_else(|| model.initial_state.get(&stream.scope))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let document = Document {
            header: replay.header,
            state: BTreeMap::from([(stream.scope.clone(), initial)]),
        };
        let ops = self.ops_between(stream, 0, target).await?;
        self.replay(stream, document, 0, &ops)
    }

    /// Operations with `from <= index < target`.
    async fn ops_between(
        &self,
        stream: &StreamKey,
        from: u64,
        target: Option<u64>,
    ) -> Result<Vec<Operation>> {
        let mut ops = self.store.get_since(stream, from, None).await?.results;
        if let Some(target) = target {
            ops.retain(|op| op.index < target);
            let available = ops.last().map(|op| op.index + 1).unwrap_or(from);
            if available < target {
                return Err(StoreError::OperationNotFound(format!("{stream}@{}", target - 1)).into());
            }
        }
        Ok(ops)
    }

    fn replay(
        &self,
        stream: &StreamKey,
        mut document: Document,
        base_revision: u64,
        ops: &[Operation],
    ) -> Result<(u64, Document)> {
        let model = self.registry.get(&document.header.document_type)?;
        let mut state = document
            .state
            .remove(&stream.scope)
            .unwrap_or_else(|| json!({}));
        reduce_operations(model.reducer.as_ref(), &mut state, ops, &stream.document_id)?;

        let revision = ops.last().map(|op| op.index + 1).unwrap_or(base_revision);
        document.state.insert(stream.scope.clone(), state);
        document.header.revision.insert(stream.scope.clone(), revision);
        if let Some(last) = ops.last() {
            document.header.last_modified_at_utc =
                document.header.last_modified_at_utc.max(last.timestamp_utc);
        }
        Ok((revision, document))
    }

    async fn load_header(&self, stream: &StreamKey) -> Result<HeaderReplay> {
        let header_stream = StreamKey::new(&stream.document_id, HEADER_SCOPE, &stream.branch);
        let header_ops = self.store.get_stream(&header_stream).await?;
        if header_ops.is_empty() {
            return Err(StoreError::DocumentNotFound(stream.document_id.clone()).into());
        }
        let mut replay = replay_header(&header_ops)?;
        let revisions = self
            .store
            .get_revisions(&stream.document_id, &stream.branch)
            .await?;
        replay.header.revision.extend(revisions.revision);
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_boundaries_are_crossed_not_hit() {
        assert!(crosses_interval(9, 12, 10));
        assert!(crosses_interval(9, 10, 10));
        assert!(!crosses_interval(10, 19, 10));
        assert!(crosses_interval(0, 25, 10));
        assert!(!crosses_interval(12, 12, 10));
        assert!(!crosses_interval(0, 100, 0));
    }
}
