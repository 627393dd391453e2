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

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::ops::Bound;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Bucket;
use crate::backend::ScanPage;
use crate::backend::StorageBackend;

/// In-process reference implementation of [`StorageBackend`].
///
/// Every bucket is a `BTreeMap` behind one mutex, so CAS atomicity is
/// trivial. `inject_unavailable` makes the next N operations fail with a
/// retryable error, which the retry tests use.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: Mutex<HashMap<Bucket, BTreeMap<Vec<u8>, Vec<u8>>>>,
    unavailable_budget: AtomicUsize,
}

impl MemoryBackend {
    pub fn name() -> &'static str {
        "Memory"
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail with `Unavailable`.
    pub fn inject_unavailable(&self, count: usize) {
        self.unavailable_budget.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> BackendResult<()> {
        let decremented =
            self.unavailable_budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| {
                    budget.checked_sub(1)
                });
        if decremented.is_ok() {
            Err(BackendError::Unavailable {
                source: Box::new(io::Error::other("injected outage")),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        Self::name()
    }

    async fn get(&self, bucket: Bucket, key: &[u8]) -> BackendResult<Vec<u8>> {
        self.check_available()?;
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(&bucket)
            .and_then(|table| table.get(key))
            .cloned()
            .ok_or_else(|| BackendError::not_found(bucket, key))
    }

    async fn get_many(
        &self,
        bucket: Bucket,
        keys: &[Vec<u8>],
    ) -> BackendResult<Vec<Option<Vec<u8>>>> {
        self.check_available()?;
        let buckets = self.buckets.lock().unwrap();
        let table = buckets.get(&bucket);
        Ok(keys
            .iter()
            .map(|key| table.and_then(|table| table.get(key)).cloned())
            .collect())
    }

    async fn put(&self, bucket: Bucket, key: &[u8], bytes: &[u8]) -> BackendResult<()> {
        self.check_available()?;
        let mut buckets = self.buckets.lock().unwrap();
        let table = buckets.entry(bucket).or_default();
        match table.get(key) {
            Some(existing) if existing == bytes => Ok(()),
            Some(_) => Err(BackendError::already_exists(bucket, key)),
            None => {
                table.insert(key.to_vec(), bytes.to_vec());
                Ok(())
            }
        }
    }

    async fn delete(&self, bucket: Bucket, key: &[u8]) -> BackendResult<()> {
        self.check_available()?;
        let mut buckets = self.buckets.lock().unwrap();
        let table = buckets.entry(bucket).or_default();
        table
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found(bucket, key))
    }

    async fn compare_and_swap(
        &self,
        bucket: Bucket,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> BackendResult<bool> {
        self.check_available()?;
        let mut buckets = self.buckets.lock().unwrap();
        let table = buckets.entry(bucket).or_default();
        let matches = match (table.get(key), expected) {
            (Some(current), Some(expected)) => current == expected,
            (None, None) => true,
            _ => false,
        };
        if matches {
            table.insert(key.to_vec(), new.to_vec());
        }
        Ok(matches)
    }

    async fn compare_and_delete(
        &self,
        bucket: Bucket,
        key: &[u8],
        expected: &[u8],
    ) -> BackendResult<bool> {
        self.check_available()?;
        let mut buckets = self.buckets.lock().unwrap();
        let table = buckets.entry(bucket).or_default();
        if table.get(key).is_some_and(|current| current == expected) {
            table.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn scan(
        &self,
        bucket: Bucket,
        prefix: &[u8],
        cursor: Option<&[u8]>,
        limit: usize,
    ) -> BackendResult<ScanPage> {
        self.check_available()?;
        let buckets = self.buckets.lock().unwrap();
        let Some(table) = buckets.get(&bucket) else {
            return Ok(ScanPage {
                entries: vec![],
                next: None,
            });
        };
        let start = match cursor {
            Some(cursor) => Bound::Excluded(cursor.to_vec()),
            None => Bound::Included(prefix.to_vec()),
        };
        let mut entries = vec![];
        let mut next = None;
        for (key, value) in table.range((start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            if entries.len() == limit {
                next = Some(entries.last().map(|(k, _): &(Vec<u8>, _)| k.clone()).unwrap());
                break;
            }
            entries.push((key.clone(), value.clone()));
        }
        Ok(ScanPage { entries, next })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pollster::FutureExt as _;

    use super::*;

    #[test]
    fn test_put_is_idempotent() {
        let backend = MemoryBackend::new();
        backend
            .put(Bucket::Commits, b"k", b"bytes")
            .block_on()
            .unwrap();
        backend
            .put(Bucket::Commits, b"k", b"bytes")
            .block_on()
            .unwrap();
        assert_matches!(
            backend.put(Bucket::Commits, b"k", b"other").block_on(),
            Err(BackendError::AlreadyExists { .. })
        );
        assert_eq!(
            backend.get(Bucket::Commits, b"k").block_on().unwrap(),
            b"bytes"
        );
    }

    #[test]
    fn test_get_many_preserves_order() {
        let backend = MemoryBackend::new();
        backend.put(Bucket::Commits, b"a", b"1").block_on().unwrap();
        backend.put(Bucket::Commits, b"c", b"3").block_on().unwrap();
        let result = backend
            .get_many(
                Bucket::Commits,
                &[b"c".to_vec(), b"b".to_vec(), b"a".to_vec()],
            )
            .block_on()
            .unwrap();
        assert_eq!(result, vec![Some(b"3".to_vec()), None, Some(b"1".to_vec())]);
    }

    #[test]
    fn test_compare_and_swap() {
        let backend = MemoryBackend::new();
        // Create-only CAS
        assert!(
            backend
                .compare_and_swap(Bucket::Refs, b"main", None, b"v1")
                .block_on()
                .unwrap()
        );
        assert!(
            !backend
                .compare_and_swap(Bucket::Refs, b"main", None, b"v1")
                .block_on()
                .unwrap()
        );
        // Replace
        assert!(
            backend
                .compare_and_swap(Bucket::Refs, b"main", Some(b"v1"), b"v2")
                .block_on()
                .unwrap()
        );
        assert!(
            !backend
                .compare_and_swap(Bucket::Refs, b"main", Some(b"v1"), b"v3")
                .block_on()
                .unwrap()
        );
        // Delete
        assert!(
            !backend
                .compare_and_delete(Bucket::Refs, b"main", b"v1")
                .block_on()
                .unwrap()
        );
        assert!(
            backend
                .compare_and_delete(Bucket::Refs, b"main", b"v2")
                .block_on()
                .unwrap()
        );
        assert_matches!(
            backend.get(Bucket::Refs, b"main").block_on(),
            Err(BackendError::NotFound { .. })
        );
    }

    #[test]
    fn test_scan_with_prefix_and_cursor() {
        let backend = MemoryBackend::new();
        for key in [&b"aa"[..], b"ab", b"ac", b"b"] {
            backend.put(Bucket::Commits, key, b"v").block_on().unwrap();
        }
        let page = backend
            .scan(Bucket::Commits, b"a", None, 2)
            .block_on()
            .unwrap();
        assert_eq!(
            page.entries.iter().map(|(k, _)| &k[..]).collect::<Vec<_>>(),
            [b"aa", b"ab"]
        );
        let cursor = page.next.unwrap();
        let page = backend
            .scan(Bucket::Commits, b"a", Some(&cursor), 2)
            .block_on()
            .unwrap();
        assert_eq!(
            page.entries.iter().map(|(k, _)| &k[..]).collect::<Vec<_>>(),
            [&b"ac"[..]]
        );
        assert_eq!(page.next, None);
    }

    #[test]
    fn test_injected_outage_is_retryable() {
        let backend = MemoryBackend::new();
        backend.put(Bucket::Commits, b"k", b"v").block_on().unwrap();
        backend.inject_unavailable(1);
        let err = backend.get(Bucket::Commits, b"k").block_on().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            backend.get(Bucket::Commits, b"k").block_on().unwrap(),
            b"v"
        );
    }
}
