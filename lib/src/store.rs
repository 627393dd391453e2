// Copyright 2024 The Icevault Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;

use clru::CLruCache;
use pollster::FutureExt as _;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Bucket;
use crate::backend::StorageBackend;
use crate::backoff::Backoff;
use crate::backoff::RetryConfig;
use crate::commit::Commit;
use crate::commit::CommitId;
use crate::content::ContentValue;
use crate::content::PayloadId;
use crate::content_hash::hash_with_tag;
use crate::key_index::IndexNode;
use crate::key_index::SegmentId;
use crate::object_id::ObjectId as _;

// There are more index nodes than commits, and nodes are often shared
// across commits.
pub(crate) const COMMIT_CACHE_CAPACITY: usize = 100;
const NODE_CACHE_CAPACITY: usize = 1000;

const COMMIT_TAG: &str = "Commit";
const SEGMENT_TAG: &str = "IndexSegment";
const CONTENT_TAG: &str = "Content";

/// Wraps the low-level backend and makes it return typed objects. Also adds
/// caching and local retry of retryable backend failures.
///
/// All content-addressed writes go through here so that an object's id is
/// always the hash of its canonical bytes.
pub struct Store {
    backend: Box<dyn StorageBackend>,
    retry_config: RetryConfig,
    commit_cache: Mutex<CLruCache<CommitId, Arc<Commit>>>,
    node_cache: Mutex<CLruCache<SegmentId, Arc<IndexNode>>>,
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Store")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(backend: Box<dyn StorageBackend>) -> Arc<Self> {
        Self::with_retry_config(backend, RetryConfig::default())
    }

    pub fn with_retry_config(backend: Box<dyn StorageBackend>, retry_config: RetryConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            retry_config,
            commit_cache: Mutex::new(CLruCache::new(COMMIT_CACHE_CAPACITY.try_into().unwrap())),
            node_cache: Mutex::new(CLruCache::new(NODE_CACHE_CAPACITY.try_into().unwrap())),
        })
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Returns backend as the implementation type.
    pub fn backend_impl<T: StorageBackend>(&self) -> Option<&T> {
        self.backend.downcast_ref()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    /// Runs `f` until it returns a non-retryable result, sleeping between
    /// attempts per the retry config.
    pub(crate) async fn retrying<T, F, Fut>(&self, mut f: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut backoff = Backoff::new(self.retry_config.clone());
        loop {
            match f().await {
                Err(err) if err.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(?delay, %err, "retrying unavailable backend");
                        std::thread::sleep(delay);
                    }
                    None => return Err(err),
                },
                result => return result,
            }
        }
    }

    fn encode<T: Serialize>(value: &T) -> BackendResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|err| BackendError::Fatal {
            source: Box::new(err),
        })
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> BackendResult<T> {
        serde_json::from_slice(bytes).map_err(|err| BackendError::Fatal {
            source: Box::new(err),
        })
    }

    pub fn get_commit(&self, id: &CommitId) -> BackendResult<Arc<Commit>> {
        self.get_commit_async(id).block_on()
    }

    pub async fn get_commit_async(&self, id: &CommitId) -> BackendResult<Arc<Commit>> {
        {
            let mut locked_cache = self.commit_cache.lock().unwrap();
            if let Some(data) = locked_cache.get(id).cloned() {
                return Ok(data);
            }
        }
        let bytes = self
            .retrying(|| self.backend.get(Bucket::Commits, id.as_bytes()))
            .await?;
        let data = Arc::new(Self::decode::<Commit>(&bytes)?);
        let mut locked_cache = self.commit_cache.lock().unwrap();
        locked_cache.put(id.clone(), data.clone());
        Ok(data)
    }

    /// Batched commit lookup; the result has one slot per requested id.
    pub async fn get_commits_async(
        &self,
        ids: &[CommitId],
    ) -> BackendResult<Vec<Option<Arc<Commit>>>> {
        let keys: Vec<Vec<u8>> = ids.iter().map(|id| id.to_bytes()).collect();
        let pages = self
            .retrying(|| self.backend.get_many(Bucket::Commits, &keys))
            .await?;
        let mut result = Vec::with_capacity(ids.len());
        for (id, bytes) in std::iter::zip(ids, pages) {
            match bytes {
                None => result.push(None),
                Some(bytes) => {
                    let data = Arc::new(Self::decode::<Commit>(&bytes)?);
                    let mut locked_cache = self.commit_cache.lock().unwrap();
                    locked_cache.put(id.clone(), data.clone());
                    result.push(Some(data));
                }
            }
        }
        Ok(result)
    }

    /// Writes a commit and returns its id. Writing the same commit twice is
    /// idempotent because the id is derived from the canonical bytes.
    pub async fn write_commit(&self, commit: Commit) -> BackendResult<(CommitId, Arc<Commit>)> {
        let id = CommitId::new(hash_with_tag(COMMIT_TAG, &commit));
        let bytes = Self::encode(&commit)?;
        self.retrying(|| self.backend.put(Bucket::Commits, id.as_bytes(), &bytes))
            .await?;
        let data = Arc::new(commit);
        {
            let mut locked_cache = self.commit_cache.lock().unwrap();
            locked_cache.put(id.clone(), data.clone());
        }
        Ok((id, data))
    }

    pub async fn get_node(&self, id: &SegmentId) -> BackendResult<Arc<IndexNode>> {
        {
            let mut locked_cache = self.node_cache.lock().unwrap();
            if let Some(data) = locked_cache.get(id).cloned() {
                return Ok(data);
            }
        }
        let bytes = self
            .retrying(|| self.backend.get(Bucket::IndexSegments, id.as_bytes()))
            .await?;
        let data = Arc::new(Self::decode::<IndexNode>(&bytes)?);
        let mut locked_cache = self.node_cache.lock().unwrap();
        locked_cache.put(id.clone(), data.clone());
        Ok(data)
    }

    pub async fn write_node(&self, node: IndexNode) -> BackendResult<SegmentId> {
        let id = SegmentId::new(hash_with_tag(SEGMENT_TAG, &node));
        let bytes = Self::encode(&node)?;
        self.retrying(|| self.backend.put(Bucket::IndexSegments, id.as_bytes(), &bytes))
            .await?;
        let mut locked_cache = self.node_cache.lock().unwrap();
        locked_cache.put(id.clone(), Arc::new(node));
        Ok(id)
    }

    pub async fn get_content(&self, id: &PayloadId) -> BackendResult<ContentValue> {
        let bytes = self
            .retrying(|| self.backend.get(Bucket::Attachments, id.as_bytes()))
            .await?;
        Self::decode(&bytes)
    }

    pub async fn write_content(&self, value: &ContentValue) -> BackendResult<PayloadId> {
        let id = PayloadId::new(hash_with_tag(CONTENT_TAG, value));
        let bytes = Self::encode(value)?;
        self.retrying(|| self.backend.put(Bucket::Attachments, id.as_bytes(), &bytes))
            .await?;
        Ok(id)
    }

    /// The id a commit would get, without writing it.
    pub fn commit_id_for(commit: &Commit) -> CommitId {
        CommitId::new(hash_with_tag(COMMIT_TAG, commit))
    }

    /// The id an index node would get, without writing it.
    pub fn node_id_for(node: &IndexNode) -> SegmentId {
        SegmentId::new(hash_with_tag(SEGMENT_TAG, node))
    }

    /// Clear cached objects. Mainly intended for testing.
    pub fn clear_caches(&self) {
        self.commit_cache.lock().unwrap().clear();
        self.node_cache.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pollster::FutureExt as _;

    use super::*;
    use crate::commit::make_root_commit;
    use crate::memory_backend::MemoryBackend;

    fn new_store() -> Arc<Store> {
        Store::new(Box::new(MemoryBackend::new()))
    }

    #[test]
    fn test_commit_id_matches_canonical_hash() {
        let store = new_store();
        let commit = make_root_commit();
        let (id, _) = store.write_commit(commit.clone()).block_on().unwrap();
        assert_eq!(id, Store::commit_id_for(&commit));
        assert_eq!(id.as_bytes().len(), 32);

        store.clear_caches();
        let read_back = store.get_commit(&id).unwrap();
        assert_eq!(*read_back, commit);
    }

    #[test]
    fn test_write_commit_is_idempotent() {
        let store = new_store();
        let (id1, _) = store.write_commit(make_root_commit()).block_on().unwrap();
        let (id2, _) = store.write_commit(make_root_commit()).block_on().unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_retries_unavailable_backend() {
        let store = Store::with_retry_config(
            Box::new(MemoryBackend::new()),
            RetryConfig {
                max_attempts: 3,
                ..RetryConfig::default()
            },
        );
        let (id, _) = store.write_commit(make_root_commit()).block_on().unwrap();
        store.clear_caches();

        store.backend_impl::<MemoryBackend>().unwrap().inject_unavailable(2);
        assert_eq!(*store.get_commit(&id).unwrap(), make_root_commit());

        store.clear_caches();
        store.backend_impl::<MemoryBackend>().unwrap().inject_unavailable(10);
        assert_matches!(
            store.get_commit(&id),
            Err(BackendError::Unavailable { .. })
        );
        store.backend_impl::<MemoryBackend>().unwrap().inject_unavailable(0);
    }

    #[test]
    fn test_get_many_commits() {
        let store = new_store();
        let mut commit = make_root_commit();
        let (id1, _) = store.write_commit(commit.clone()).block_on().unwrap();
        commit.message = "second".to_string();
        let (id2, _) = store.write_commit(commit).block_on().unwrap();
        let missing = CommitId::new(vec![0; 32]);

        let result = store
            .get_commits_async(&[id2.clone(), missing, id1.clone()])
            .block_on()
            .unwrap();
        assert_eq!(result[0].as_ref().unwrap().message, "second");
        assert!(result[1].is_none());
        assert_eq!(result[2].as_ref().unwrap().message, "");
    }
}
