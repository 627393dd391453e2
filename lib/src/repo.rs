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

//! The per-repository descriptor singleton and repository initialization.

use std::sync::Arc;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Bucket;
use crate::clock::Clock;
use crate::commit::CommitId;
use crate::commit::make_root_commit;
use crate::key_index::DEFAULT_SEGMENT_BYTE_BUDGET;
use crate::refs::RefKind;
use crate::refs::RefNameBuf;
use crate::refs::RefStore;
use crate::refs::Reference;
use crate::store::Store;

const REPO_DESC_KEY: &[u8] = b"repo";

/// Tunables persisted with the repository.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RepoConfig {
    /// Target serialized size of a key-index leaf.
    pub segment_byte_budget: usize,
    /// Attempts a commit makes against concurrent reference movement before
    /// surfacing a reference conflict.
    pub commit_retries: u32,
    /// Whether tags may be re-pointed after creation.
    pub movable_tags: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            segment_byte_budget: DEFAULT_SEGMENT_BYTE_BUDGET,
            commit_retries: 5,
            movable_tags: false,
        }
    }
}

/// Singleton descriptor of a repository.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RepoDescriptor {
    pub default_branch: RefNameBuf,
    pub created_at: crate::commit::Timestamp,
    pub config: RepoConfig,
}

/// Creates the repository: the root commit, the default branch pointing at
/// it, and the descriptor. Fails `AlreadyExists` if a descriptor is already
/// present.
pub async fn init_repo(
    store: &Arc<Store>,
    refs: &RefStore,
    clock: &dyn Clock,
    default_branch: RefNameBuf,
    config: RepoConfig,
) -> BackendResult<(RepoDescriptor, CommitId)> {
    let descriptor = RepoDescriptor {
        default_branch: default_branch.clone(),
        created_at: clock.now(),
        config,
    };
    let bytes = serde_json::to_vec(&descriptor).map_err(|err| BackendError::Fatal {
        source: Box::new(err),
    })?;
    let inserted = store
        .retrying(|| {
            store
                .backend()
                .compare_and_swap(Bucket::RepoDesc, REPO_DESC_KEY, None, &bytes)
        })
        .await?;
    if !inserted {
        return Err(BackendError::already_exists(Bucket::RepoDesc, REPO_DESC_KEY));
    }

    let (root_id, _) = store.write_commit(make_root_commit()).await?;
    refs.create_ref(&Reference {
        name: default_branch,
        kind: RefKind::Branch,
        head: root_id.clone(),
        created_at: descriptor.created_at,
    })
    .await?;
    Ok((descriptor, root_id))
}

/// Reads the repository descriptor.
pub async fn read_repo_desc(store: &Store) -> BackendResult<RepoDescriptor> {
    let bytes = store
        .retrying(|| store.backend().get(Bucket::RepoDesc, REPO_DESC_KEY))
        .await?;
    serde_json::from_slice(&bytes).map_err(|err| BackendError::Fatal {
        source: Box::new(err),
    })
}

/// CAS-updates the repository descriptor with `mutate`, retrying against
/// concurrent updates.
pub async fn update_repo_desc(
    store: &Store,
    mut mutate: impl FnMut(&mut RepoDescriptor),
) -> BackendResult<RepoDescriptor> {
    loop {
        let observed = store
            .retrying(|| store.backend().get(Bucket::RepoDesc, REPO_DESC_KEY))
            .await?;
        let mut descriptor: RepoDescriptor =
            serde_json::from_slice(&observed).map_err(|err| BackendError::Fatal {
                source: Box::new(err),
            })?;
        mutate(&mut descriptor);
        let bytes = serde_json::to_vec(&descriptor).map_err(|err| BackendError::Fatal {
            source: Box::new(err),
        })?;
        let swapped = store
            .retrying(|| {
                store.backend().compare_and_swap(
                    Bucket::RepoDesc,
                    REPO_DESC_KEY,
                    Some(&observed),
                    &bytes,
                )
            })
            .await?;
        if swapped {
            return Ok(descriptor);
        }
    }
}
