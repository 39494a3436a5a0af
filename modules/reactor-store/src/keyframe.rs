//! Durable state snapshots that bound replay cost, and the indexing
//! progress of durable read models.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::StreamKey;

/// A full document snapshot taken after `revision` operations of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub revision: u64,
    pub document: serde_json::Value,
}

#[async_trait]
pub trait KeyframeStore: Send + Sync {
    async fn put_keyframe(
        &self,
        stream: &StreamKey,
        revision: u64,
        document: &serde_json::Value,
    ) -> Result<()>;

    /// Highest keyframe with `revision <= target_revision`.
    async fn find_nearest_keyframe(
        &self,
        stream: &StreamKey,
        target_revision: u64,
    ) -> Result<Option<Keyframe>>;

    /// Drop keyframes for a document, optionally narrowed to a scope and branch.
    /// Returns how many were removed.
    async fn delete_keyframes(
        &self,
        document_id: &str,
        scope: Option<&str>,
        branch: Option<&str>,
    ) -> Result<u64>;

    /// Highest ordinal a durable read model has indexed, if it ever recorded one.
    async fn get_view_state(&self, read_model: &str) -> Result<Option<i64>>;

    /// Record read-model progress. Never moves an existing ordinal backwards.
    async fn put_view_state(&self, read_model: &str, ordinal: i64) -> Result<()>;
}

#[async_trait]
impl<K: KeyframeStore + ?Sized> KeyframeStore for std::sync::Arc<K> {
    async fn put_keyframe(
        &self,
        stream: &StreamKey,
        revision: u64,
        document: &serde_json::Value,
    ) -> Result<()> {
        (**self).put_keyframe(stream, revision, document).await
    }

    async fn find_nearest_keyframe(
        &self,
        stream: &StreamKey,
        target_revision: u64,
    ) -> Result<Option<Keyframe>> {
        (**self).find_nearest_keyframe(stream, target_revision).await
    }

    async fn delete_keyframes(
        &self,
        document_id: &str,
        scope: Option<&str>,
        branch: Option<&str>,
    ) -> Result<u64> {
        (**self).delete_keyframes(document_id, scope, branch).await
    }

    async fn get_view_state(&self, read_model: &str) -> Result<Option<i64>> {
        (**self).get_view_state(read_model).await
    }

    async fn put_view_state(&self, read_model: &str, ordinal: i64) -> Result<()> {
        (**self).put_view_state(read_model, ordinal).await
    }
}
