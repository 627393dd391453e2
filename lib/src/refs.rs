// Copyright 2024-2025 The Icevault Authors
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

//! Named references and their compare-and-swap machinery.
//!
//! A reference is a named pointer to a commit. The `Refs` bucket is
//! authoritative; the `RefNames` bucket additionally keeps an eventually
//! consistent registry of names used for listing. Readers tolerate stale
//! registry entries by re-verifying every name against the `Refs` bucket.
//!
//! There is deliberately no in-process lock per reference: multi-process
//! deployments would bypass it. The backend CAS is the sole serializer.

use std::borrow::Borrow;
use std::fmt;
use std::fmt::Display;
use std::ops::Deref;
use std::sync::Arc;

use ref_cast::RefCastCustom;
use ref_cast::ref_cast_custom;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Bucket;
use crate::commit::CommitId;
use crate::commit::Timestamp;
use crate::content_hash::ContentHash;
use crate::content_hash::DigestUpdate;
use crate::store::Store;

/// Owned reference name.
///
/// Use `.as_str()` for displaying. Other than that, this can be considered
/// an immutable `String`.
// Eq, Hash, and Ord must be compatible with RefName.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RefNameBuf(String);

/// Borrowed reference name.
#[derive(Eq, Hash, Ord, PartialEq, PartialOrd, RefCastCustom)]
#[repr(transparent)]
pub struct RefName(str);

impl RefNameBuf {
    /// Consumes this and returns the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl RefName {
    /// Wraps string name.
    #[ref_cast_custom]
    pub const fn new(name: &str) -> &Self;

    /// Returns the underlying string.
    pub const fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RefNameBuf {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RefNameBuf {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<&RefName> for RefNameBuf {
    fn from(value: &RefName) -> Self {
        value.to_owned()
    }
}

impl AsRef<RefName> for str {
    fn as_ref(&self) -> &RefName {
        RefName::new(self)
    }
}

impl AsRef<RefName> for RefNameBuf {
    fn as_ref(&self) -> &RefName {
        self
    }
}

impl Borrow<RefName> for RefNameBuf {
    fn borrow(&self) -> &RefName {
        self
    }
}

impl Deref for RefNameBuf {
    type Target = RefName;

    fn deref(&self) -> &Self::Target {
        RefName::new(&self.0)
    }
}

impl ToOwned for RefName {
    type Owned = RefNameBuf;

    fn to_owned(&self) -> Self::Owned {
        RefNameBuf(self.0.to_owned())
    }
}

impl Display for RefNameBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl fmt::Debug for RefNameBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefNameBuf").field(&self.0).finish()
    }
}

impl fmt::Debug for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefName").field(&&self.0).finish()
    }
}

impl ContentHash for RefNameBuf {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.0.hash(state);
    }
}

/// Whether a reference name is acceptable to [`RefStore::create_ref`].
pub fn is_valid_ref_name(name: &RefName) -> bool {
    let name = name.as_str();
    !name.is_empty()
        && name.len() <= 500
        && !name.starts_with('-')
        && name
            .chars()
            .all(|ch| !ch.is_whitespace() && !ch.is_control())
}

/// Kind of a named reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefKind {
    /// Mutable pointer, advanced by commits and merges.
    Branch,
    /// Fixed pointer. Movable only if the repo descriptor allows it.
    Tag,
}

/// A named pointer into the commit DAG.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Reference {
    pub name: RefNameBuf,
    pub kind: RefKind,
    pub head: CommitId,
    pub created_at: Timestamp,
}

/// One page of [`RefStore::list_refs`].
#[derive(Debug, PartialEq, Eq)]
pub struct RefPage {
    pub refs: Vec<Reference>,
    /// Token resuming after the last returned name.
    pub next: Option<String>,
}

// Names are spread over a fixed set of registry pages by hash.
const NAME_PAGE_COUNT: u8 = 16;
// Attempts at CAS-updating a registry page before giving up. The registry
// is eventually consistent, so losing is tolerable.
const NAME_PAGE_CAS_ATTEMPTS: usize = 8;

fn name_page_key(name: &RefName) -> Vec<u8> {
    let digest = crate::content_hash::hash_with_tag("RefNamePage", name.as_str());
    vec![b'p', digest[0] % NAME_PAGE_COUNT]
}

fn all_page_keys() -> Vec<Vec<u8>> {
    (0..NAME_PAGE_COUNT).map(|page| vec![b'p', page]).collect()
}

/// Reference CRUD over the storage backend.
#[derive(Debug, Clone)]
pub struct RefStore {
    store: Arc<Store>,
}

impl RefStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Inserts a new reference. Fails `AlreadyExists` if the name is taken.
    pub async fn create_ref(&self, reference: &Reference) -> BackendResult<()> {
        let key = reference.name.as_str().as_bytes();
        let bytes = serde_json::to_vec(reference).map_err(fatal)?;
        let inserted = self
            .store
            .retrying(|| {
                self.store
                    .backend()
                    .compare_and_swap(Bucket::Refs, key, None, &bytes)
            })
            .await?;
        if !inserted {
            return Err(BackendError::already_exists(Bucket::Refs, key));
        }
        self.update_name_page(&reference.name, true).await;
        Ok(())
    }

    /// Looks a reference up by name.
    pub async fn get_ref(&self, name: &RefName) -> BackendResult<Reference> {
        Ok(self.get_ref_raw(name).await?.0)
    }

    async fn get_ref_raw(&self, name: &RefName) -> BackendResult<(Reference, Vec<u8>)> {
        let key = name.as_str().as_bytes();
        let bytes = self
            .store
            .retrying(|| self.store.backend().get(Bucket::Refs, key))
            .await?;
        let reference = serde_json::from_slice(&bytes).map_err(fatal)?;
        Ok((reference, bytes))
    }

    /// Advances `name` from `expected_head` to `new_head`. Fails
    /// `CasMismatch` if the head moved concurrently.
    pub async fn update_ref(
        &self,
        name: &RefName,
        expected_head: &CommitId,
        new_head: &CommitId,
    ) -> BackendResult<Reference> {
        let key = name.as_str().as_bytes();
        let (mut reference, observed_bytes) = self.get_ref_raw(name).await?;
        if reference.head != *expected_head {
            return Err(BackendError::cas_mismatch(Bucket::Refs, key));
        }
        reference.head = new_head.clone();
        let bytes = serde_json::to_vec(&reference).map_err(fatal)?;
        let swapped = self
            .store
            .retrying(|| {
                self.store.backend().compare_and_swap(
                    Bucket::Refs,
                    key,
                    Some(&observed_bytes),
                    &bytes,
                )
            })
            .await?;
        if !swapped {
            return Err(BackendError::cas_mismatch(Bucket::Refs, key));
        }
        Ok(reference)
    }

    /// Deletes `name` if it still points at `expected_head`.
    pub async fn delete_ref(
        &self,
        name: &RefName,
        expected_head: &CommitId,
    ) -> BackendResult<()> {
        let key = name.as_str().as_bytes();
        let (_, observed_bytes) = {
            let (reference, bytes) = self.get_ref_raw(name).await?;
            if reference.head != *expected_head {
                return Err(BackendError::cas_mismatch(Bucket::Refs, key));
            }
            (reference, bytes)
        };
        let deleted = self
            .store
            .retrying(|| {
                self.store
                    .backend()
                    .compare_and_delete(Bucket::Refs, key, &observed_bytes)
            })
            .await?;
        if !deleted {
            return Err(BackendError::cas_mismatch(Bucket::Refs, key));
        }
        self.update_name_page(name, false).await;
        Ok(())
    }

    /// Lists references in name order. `filter` keeps names starting with
    /// the given prefix; `page_token` resumes after a previous page.
    pub async fn list_refs(
        &self,
        filter: Option<&str>,
        page_token: Option<&str>,
        limit: usize,
    ) -> BackendResult<RefPage> {
        let page_keys = all_page_keys();
        let pages = self
            .store
            .retrying(|| self.store.backend().get_many(Bucket::RefNames, &page_keys))
            .await?;
        let mut names: Vec<String> = vec![];
        for page in pages.into_iter().flatten() {
            let page_names: Vec<String> = serde_json::from_slice(&page).map_err(fatal)?;
            names.extend(page_names);
        }
        names.sort_unstable();
        names.dedup();

        let mut refs = vec![];
        let mut next = None;
        for name in names {
            if let Some(filter) = filter {
                if !name.starts_with(filter) {
                    continue;
                }
            }
            if page_token.is_some_and(|token| name.as_str() <= token) {
                continue;
            }
            if refs.len() == limit {
                next = refs.last().map(|r: &Reference| r.name.to_string());
                break;
            }
            // The registry may lag behind deletes; the refs bucket decides.
            match self.get_ref(RefName::new(&name)).await {
                Ok(reference) => refs.push(reference),
                Err(BackendError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(RefPage { refs, next })
    }

    // Best-effort registry maintenance. Loses only listing freshness, never
    // correctness, so exhausting the CAS attempts just logs.
    async fn update_name_page(&self, name: &RefName, add: bool) {
        let key = name_page_key(name);
        for _ in 0..NAME_PAGE_CAS_ATTEMPTS {
            let current = match self
                .store
                .retrying(|| self.store.backend().get(Bucket::RefNames, &key))
                .await
            {
                Ok(bytes) => Some(bytes),
                Err(BackendError::NotFound { .. }) => None,
                Err(err) => {
                    tracing::warn!(%name, %err, "failed to read ref name registry page");
                    return;
                }
            };
            let mut names: Vec<String> = match &current {
                Some(bytes) => serde_json::from_slice(bytes).unwrap_or_default(),
                None => vec![],
            };
            let changed = if add {
                match names.binary_search(&name.as_str().to_owned()) {
                    Ok(_) => false,
                    Err(index) => {
                        names.insert(index, name.as_str().to_owned());
                        true
                    }
                }
            } else {
                match names.binary_search(&name.as_str().to_owned()) {
                    Ok(index) => {
                        names.remove(index);
                        true
                    }
                    Err(_) => false,
                }
            };
            if !changed {
                return;
            }
            let Ok(bytes) = serde_json::to_vec(&names) else {
                return;
            };
            let swapped = self
                .store
                .retrying(|| {
                    self.store.backend().compare_and_swap(
                        Bucket::RefNames,
                        &key,
                        current.as_deref(),
                        &bytes,
                    )
                })
                .await;
            match swapped {
                Ok(true) => return,
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(%name, %err, "failed to update ref name registry page");
                    return;
                }
            }
        }
        tracing::warn!(%name, "gave up updating ref name registry page");
    }
}

fn fatal(err: serde_json::Error) -> BackendError {
    BackendError::Fatal {
        source: Box::new(err),
    }
}
