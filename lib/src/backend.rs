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

use std::any::Any;
use std::fmt;
use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use crate::hex_util;

/// Typed buckets a storage backend must provide. Every stored object is
/// addressed by `(bucket, key)`; the backend chooses the physical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    /// Commit objects, keyed by commit id.
    Commits,
    /// Key-index nodes, keyed by segment id.
    IndexSegments,
    /// Reference pointers, keyed by reference name. CAS-capable.
    Refs,
    /// Pages of the reference-name registry. CAS-capable.
    RefNames,
    /// The repository descriptor singleton. CAS-capable.
    RepoDesc,
    /// Content payloads and cached derived snapshots.
    Attachments,
}

impl Bucket {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Commits => "commits",
            Self::IndexSegments => "index-segments",
            Self::Refs => "refs",
            Self::RefNames => "ref-names",
            Self::RepoDesc => "repo-desc",
            Self::Attachments => "attachments",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Error that may occur after the backend is loaded.
///
/// `Unavailable` is the only retryable kind; callers above retry it with
/// capped exponential backoff. Everything else surfaces unchanged.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Object {key} not found in bucket {bucket}")]
    NotFound { bucket: &'static str, key: String },
    #[error("Object {key} in bucket {bucket} already exists with different bytes")]
    AlreadyExists { bucket: &'static str, key: String },
    #[error("Compare-and-swap of {key} in bucket {bucket} lost the race")]
    CasMismatch { bucket: &'static str, key: String },
    #[error("Backend temporarily unavailable")]
    Unavailable {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Backend failed fatally")]
    Fatal {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BackendError {
    pub fn not_found(bucket: Bucket, key: &[u8]) -> Self {
        Self::NotFound {
            bucket: bucket.name(),
            key: display_key(bucket, key),
        }
    }

    pub fn already_exists(bucket: Bucket, key: &[u8]) -> Self {
        Self::AlreadyExists {
            bucket: bucket.name(),
            key: display_key(bucket, key),
        }
    }

    pub fn cas_mismatch(bucket: Bucket, key: &[u8]) -> Self {
        Self::CasMismatch {
            bucket: bucket.name(),
            key: display_key(bucket, key),
        }
    }

    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

// Name-keyed buckets render keys as text, id-keyed buckets as hex.
fn display_key(bucket: Bucket, key: &[u8]) -> String {
    match bucket {
        Bucket::Refs | Bucket::RefNames | Bucket::RepoDesc => {
            String::from_utf8_lossy(key).into_owned()
        }
        Bucket::Commits | Bucket::IndexSegments | Bucket::Attachments => hex_util::encode_hex(key),
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// One page of a [`StorageBackend::scan`].
#[derive(Debug, PartialEq, Eq)]
pub struct ScanPage {
    /// Key/value pairs in ascending key order.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// Cursor to pass to the next scan call, if more entries exist.
    pub next: Option<Vec<u8>>,
}

/// Defines the interface for storage backends.
///
/// The engine assumes nothing about the physical store beyond this contract:
/// a key-value store with typed buckets, idempotent content-addressed puts,
/// and compare-and-swap on the `Refs`, `RefNames`, and `RepoDesc` buckets.
/// CAS is the sole serializer of reference updates; implementations must
/// make it atomic across processes.
#[async_trait]
pub trait StorageBackend: Any + Send + Sync + Debug {
    /// A unique name identifying the backend implementation.
    fn name(&self) -> &str;

    async fn get(&self, bucket: Bucket, key: &[u8]) -> BackendResult<Vec<u8>>;

    /// Batched lookup. The result has one slot per requested key, in request
    /// order, with `None` for misses.
    async fn get_many(
        &self,
        bucket: Bucket,
        keys: &[Vec<u8>],
    ) -> BackendResult<Vec<Option<Vec<u8>>>>;

    /// Writes an object. Writing identical bytes to an existing key is a
    /// no-op success so that content-addressed writes are idempotent;
    /// differing bytes fail with `AlreadyExists`.
    async fn put(&self, bucket: Bucket, key: &[u8], bytes: &[u8]) -> BackendResult<()>;

    /// Removes an object. Removing a missing object fails `NotFound`.
    async fn delete(&self, bucket: Bucket, key: &[u8]) -> BackendResult<()>;

    /// Atomically replaces the value at `key` if the current value equals
    /// `expected` (`None` = the key must not exist). Returns false on
    /// mismatch. Only supported on CAS-capable buckets.
    async fn compare_and_swap(
        &self,
        bucket: Bucket,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> BackendResult<bool>;

    /// Atomically deletes the value at `key` if it equals `expected`.
    /// Returns false on mismatch. Only supported on CAS-capable buckets.
    async fn compare_and_delete(
        &self,
        bucket: Bucket,
        key: &[u8],
        expected: &[u8],
    ) -> BackendResult<bool>;

    /// Streams keys in ascending order, filtered to `prefix`, resuming after
    /// `cursor`. Required on the `Commits` bucket; backends may support it
    /// elsewhere.
    async fn scan(
        &self,
        bucket: Bucket,
        prefix: &[u8],
        cursor: Option<&[u8]>,
        limit: usize,
    ) -> BackendResult<ScanPage>;
}

impl dyn StorageBackend {
    /// Returns reference of the implementation type.
    pub fn downcast_ref<T: StorageBackend>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}
