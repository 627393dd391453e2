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

//! Ancestry walks over the commit DAG.
//!
//! Commits refer to parents by id only, and no in-process parent/child
//! graph is ever materialized. Walks start at a head and proceed backward
//! by id lookup, breadth first.

use std::collections::HashSet;
use std::collections::VecDeque;

use crate::backend::BackendResult;
use crate::commit::CommitId;
use crate::store::Store;

/// Whether `ancestor` is reachable from `descendant` (inclusive: a commit
/// is its own ancestor).
pub async fn is_ancestor(
    store: &Store,
    ancestor: &CommitId,
    descendant: &CommitId,
) -> BackendResult<bool> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([descendant.clone()]);
    while let Some(id) = queue.pop_front() {
        if id == *ancestor {
            return Ok(true);
        }
        if !visited.insert(id.clone()) {
            continue;
        }
        let commit = store.get_commit_async(&id).await?;
        queue.extend(commit.parents.iter().cloned());
    }
    Ok(false)
}

/// Finds the nearest common ancestor of `a` and `b`, or `None` if the two
/// commits share no history.
///
/// Breadth-first from `b` over the ancestor set of `a`, so the returned
/// commit is the closest merge base as counted in edges from `b`.
pub async fn common_ancestor(
    store: &Store,
    a: &CommitId,
    b: &CommitId,
) -> BackendResult<Option<CommitId>> {
    let mut ancestors_of_a = HashSet::new();
    let mut queue = VecDeque::from([a.clone()]);
    while let Some(id) = queue.pop_front() {
        if !ancestors_of_a.insert(id.clone()) {
            continue;
        }
        let commit = store.get_commit_async(&id).await?;
        queue.extend(commit.parents.iter().cloned());
    }

    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([b.clone()]);
    while let Some(id) = queue.pop_front() {
        if ancestors_of_a.contains(&id) {
            return Ok(Some(id));
        }
        if !visited.insert(id.clone()) {
            continue;
        }
        let commit = store.get_commit_async(&id).await?;
        queue.extend(commit.parents.iter().cloned());
    }
    Ok(None)
}
