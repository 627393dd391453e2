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

//! The commit service: conflict-checked commits, merge, transplant, and
//! reference-consistent reads.
//!
//! Mutation serialization is entirely the storage adapter's CAS; the
//! service holds no per-reference lock. A commit that loses the CAS race
//! restarts from the freshly observed head, up to the configured retry
//! budget, then surfaces a reference conflict.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::BackendError;
use crate::clock::Clock;
use crate::commit::Commit;
use crate::commit::CommitId;
use crate::commit::CommitOperation;
use crate::commit::OperationKind;
use crate::commit::Signature;
use crate::content::ContentValue;
use crate::content::PayloadId;
use crate::content_key::ContentKey;
use crate::dag_walk;
use crate::error::Conflict;
use crate::error::ConflictKind;
use crate::error::VersionStoreError;
use crate::key_index;
use crate::key_index::IndexDiffEntry;
use crate::key_index::IndexEntry;
use crate::key_index::ScanCursor;
use crate::key_index::SegmentId;
use crate::merge::MergeBehavior;
use crate::merge::resolve_merge;
use crate::refs::RefKind;
use crate::refs::RefName;
use crate::refs::RefNameBuf;
use crate::refs::RefPage;
use crate::refs::RefStore;
use crate::refs::Reference;
use crate::refs::is_valid_ref_name;
use crate::repo::RepoConfig;
use crate::repo::RepoDescriptor;
use crate::repo::init_repo;
use crate::repo::read_repo_desc;
use crate::store::Store;

type Result<T> = std::result::Result<T, VersionStoreError>;

/// Addresses a commit: by reference name or detached by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefSpec {
    Name(RefNameBuf),
    Hash(CommitId),
}

impl RefSpec {
    pub fn name(name: impl Into<RefNameBuf>) -> Self {
        Self::Name(name.into())
    }

    pub fn hash(id: CommitId) -> Self {
        Self::Hash(id)
    }
}

/// A client-supplied assertion about the prior state of a key, checked
/// against the head the commit is built on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    MustNotExist,
    MustExist,
    HeadMatches(PayloadId),
}

/// What a commit should do to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedOperation {
    Put(ContentValue),
    Delete,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOperationRequest {
    pub key: ContentKey,
    pub operation: RequestedOperation,
    pub requirement: Option<Requirement>,
}

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub branch: RefNameBuf,
    /// If set, the commit fails with a reference conflict unless the branch
    /// still points here.
    pub expected_head: Option<CommitId>,
    pub message: String,
    pub author: Signature,
    pub operations: Vec<CommitOperationRequest>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub commit_id: CommitId,
    pub parent: CommitId,
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub source: RefSpec,
    pub target: RefNameBuf,
    pub behavior: MergeBehavior,
    pub author: Signature,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub head: CommitId,
    /// True when no merge commit was needed: the source was already merged
    /// or the target could fast-forward.
    pub fast_forward: bool,
    pub common_ancestor: CommitId,
}

#[derive(Debug, Clone)]
pub struct TransplantRequest {
    /// Source commits, applied in list order.
    pub commits: Vec<CommitId>,
    pub target: RefNameBuf,
    /// Collapse all steps into one synthesized commit.
    pub squash: bool,
    pub author: Signature,
    pub behavior: MergeBehavior,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransplantResult {
    pub head: CommitId,
    pub created: Vec<CommitId>,
}

/// Reference-consistent multi-key read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentsResult {
    /// The commit every key was resolved at.
    pub effective_commit: CommitId,
    /// One slot per requested key, in request order.
    pub values: Vec<Option<ContentValue>>,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: CommitId,
    pub commit: Arc<Commit>,
}

#[derive(Debug, Clone)]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    pub next: Option<CommitId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntriesPage {
    pub effective_commit: CommitId,
    pub entries: Vec<IndexEntry>,
    pub next: Option<ScanCursor>,
}

/// The versioned storage engine's service facade.
#[derive(Debug)]
pub struct VersionStore {
    store: Arc<Store>,
    refs: RefStore,
    clock: Arc<dyn Clock>,
    descriptor: RepoDescriptor,
}

impl VersionStore {
    /// Initializes a fresh repository and returns the service over it.
    pub async fn init(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        default_branch: RefNameBuf,
        config: RepoConfig,
    ) -> Result<Self> {
        let refs = RefStore::new(store.clone());
        let (descriptor, _root) = init_repo(&store, &refs, clock.as_ref(), default_branch, config)
            .await
            .map_err(|err| match err {
                BackendError::AlreadyExists { .. } => {
                    VersionStoreError::invalid_argument("repository already initialized")
                }
                err => err.into(),
            })?;
        Ok(Self {
            store,
            refs,
            clock,
            descriptor,
        })
    }

    /// Opens an existing repository.
    pub async fn open(store: Arc<Store>, clock: Arc<dyn Clock>) -> Result<Self> {
        let descriptor = read_repo_desc(&store).await.map_err(|err| match err {
            BackendError::NotFound { .. } => {
                VersionStoreError::invalid_argument("repository not initialized")
            }
            err => err.into(),
        })?;
        Ok(Self {
            refs: RefStore::new(store.clone()),
            store,
            clock,
            descriptor,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &RepoConfig {
        &self.descriptor.config
    }

    pub fn default_branch(&self) -> &RefName {
        &self.descriptor.default_branch
    }

    fn committer(&self, author: &Signature) -> Signature {
        Signature {
            name: author.name.clone(),
            email: author.email.clone(),
            timestamp: self.clock.now(),
        }
    }

    // ---- references ----------------------------------------------------

    /// Creates a branch or tag at the commit addressed by `at`.
    pub async fn create_ref(&self, name: RefNameBuf, kind: RefKind, at: &RefSpec) -> Result<Reference> {
        if !is_valid_ref_name(&name) {
            return Err(VersionStoreError::invalid_argument(format!(
                "invalid reference name: {name}"
            )));
        }
        let (_, head) = self.resolve_spec(at).await?;
        let reference = Reference {
            name: name.clone(),
            kind,
            head,
            created_at: self.clock.now(),
        };
        self.refs
            .create_ref(&reference)
            .await
            .map_err(|err| match err {
                BackendError::AlreadyExists { .. } => {
                    VersionStoreError::RefAlreadyExists { name: name.clone() }
                }
                err => err.into(),
            })?;
        Ok(reference)
    }

    pub async fn get_ref(&self, name: &RefName) -> Result<Reference> {
        self.refs
            .get_ref(name)
            .await
            .map_err(|err| ref_error(name, err))
    }

    /// Re-points a reference. Tags move only when the repository allows it.
    pub async fn update_ref(
        &self,
        name: &RefName,
        expected_head: &CommitId,
        new_head: &CommitId,
    ) -> Result<Reference> {
        let reference = self.get_ref(name).await?;
        if reference.kind == RefKind::Tag && !self.descriptor.config.movable_tags {
            return Err(VersionStoreError::invalid_argument(format!(
                "tag {name} is immutable"
            )));
        }
        // The target commit must exist before anything points at it.
        self.expect_commit(new_head).await?;
        self.refs
            .update_ref(name, expected_head, new_head)
            .await
            .map_err(|err| ref_error(name, err))
    }

    /// Deletes a reference if it still points at `expected_head`.
    pub async fn delete_ref(&self, name: &RefName, expected_head: &CommitId) -> Result<()> {
        self.refs
            .delete_ref(name, expected_head)
            .await
            .map_err(|err| ref_error(name, err))
    }

    pub async fn list_refs(
        &self,
        filter: Option<&str>,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<RefPage> {
        Ok(self.refs.list_refs(filter, page_token, limit).await?)
    }

    // ---- commit ---------------------------------------------------------

    /// Commits `operations` onto a branch, checking per-key requirements
    /// against the head the commit is built on.
    pub async fn commit(&self, request: CommitRequest) -> Result<CommitResult> {
        if request.operations.is_empty() {
            return Err(VersionStoreError::invalid_argument(
                "commit carries no operations",
            ));
        }
        let mut seen_keys = HashSet::new();
        for op in &request.operations {
            if !seen_keys.insert(&op.key) {
                return Err(VersionStoreError::invalid_argument(format!(
                    "duplicate operation for key {}",
                    op.key
                )));
            }
        }

        let mut attempts_left = self.descriptor.config.commit_retries.max(1);
        loop {
            attempts_left -= 1;
            let reference = self.get_ref(&request.branch).await?;
            if reference.kind != RefKind::Branch {
                return Err(VersionStoreError::invalid_argument(format!(
                    "cannot commit to {}: not a branch",
                    request.branch
                )));
            }
            if let Some(expected) = &request.expected_head {
                if *expected != reference.head {
                    return Err(VersionStoreError::ReferenceConflict {
                        name: request.branch.clone(),
                        message: format!(
                            "expected head {expected} but reference is at {}",
                            reference.head
                        ),
                    });
                }
            }
            let head = self.expect_commit(&reference.head).await?;

            let conflicts = self
                .check_requirements(head.index_root.as_ref(), &request.operations)
                .await?;
            if !conflicts.is_empty() {
                return Err(VersionStoreError::ContentConflict { conflicts });
            }

            let mut operations = Vec::with_capacity(request.operations.len());
            for op in &request.operations {
                let kind = match &op.operation {
                    RequestedOperation::Put(value) => {
                        let payload = self.store.write_content(value).await?;
                        OperationKind::Put {
                            content_id: value.id,
                            content_type: value.content.content_type(),
                            payload,
                        }
                    }
                    RequestedOperation::Delete => OperationKind::Delete,
                    RequestedOperation::Unchanged => OperationKind::Unchanged,
                };
                operations.push(CommitOperation {
                    key: op.key.clone(),
                    kind,
                });
            }

            let index_root = key_index::apply_operations(
                &self.store,
                head.index_root.as_ref(),
                &operations,
                self.descriptor.config.segment_byte_budget,
            )
            .await?;
            let commit = Commit {
                parents: vec![reference.head.clone()],
                committer: self.committer(&request.author),
                author: request.author.clone(),
                message: request.message.clone(),
                operations,
                index_root,
                metadata: request.metadata.clone(),
            };
            let (commit_id, _) = self.store.write_commit(commit).await?;

            match self
                .refs
                .update_ref(&request.branch, &reference.head, &commit_id)
                .await
            {
                Ok(_) => {
                    tracing::debug!(
                        branch = %request.branch,
                        commit = %commit_id,
                        "committed"
                    );
                    return Ok(CommitResult {
                        commit_id,
                        parent: reference.head,
                    });
                }
                Err(BackendError::CasMismatch { .. }) => {
                    if request.expected_head.is_some() || attempts_left == 0 {
                        return Err(VersionStoreError::ReferenceConflict {
                            name: request.branch.clone(),
                            message: "reference head moved concurrently".to_string(),
                        });
                    }
                    tracing::debug!(branch = %request.branch, "commit lost the race, retrying");
                }
                Err(err) => return Err(ref_error(&request.branch, err)),
            }
        }
    }

    async fn check_requirements(
        &self,
        index_root: Option<&SegmentId>,
        operations: &[CommitOperationRequest],
    ) -> Result<Vec<Conflict>> {
        let mut conflicts = vec![];
        for op in operations {
            let Some(requirement) = &op.requirement else {
                continue;
            };
            let current = key_index::lookup(&self.store, index_root, &op.key).await?;
            match (requirement, current) {
                (Requirement::MustNotExist, Some(_)) => conflicts.push(Conflict {
                    key: op.key.clone(),
                    kind: ConflictKind::KeyExists,
                    message: format!("key {} already exists", op.key),
                }),
                (Requirement::MustExist, None) | (Requirement::HeadMatches(_), None) => {
                    conflicts.push(Conflict {
                        key: op.key.clone(),
                        kind: ConflictKind::KeyDoesNotExist,
                        message: format!("key {} does not exist", op.key),
                    });
                }
                (Requirement::HeadMatches(expected), Some(value))
                    if value.payload != *expected =>
                {
                    conflicts.push(Conflict {
                        key: op.key.clone(),
                        kind: ConflictKind::PayloadDiffers,
                        message: format!(
                            "key {} points at {} instead of the expected {expected}",
                            op.key, value.payload
                        ),
                    });
                }
                _ => {}
            }
        }
        Ok(conflicts)
    }

    // ---- merge and transplant -------------------------------------------

    /// Three-way merge of `source` into the `target` branch.
    pub async fn merge(&self, request: MergeRequest) -> Result<MergeResult> {
        let (source_label, source_head) = self.resolve_spec(&request.source).await?;
        let source_commit = self.expect_commit(&source_head).await?;

        let mut attempts_left = self.descriptor.config.commit_retries.max(1);
        loop {
            attempts_left -= 1;
            let target_ref = self.get_ref(&request.target).await?;
            if target_ref.kind != RefKind::Branch {
                return Err(VersionStoreError::invalid_argument(format!(
                    "cannot merge into {}: not a branch",
                    request.target
                )));
            }
            let base = dag_walk::common_ancestor(&self.store, &source_head, &target_ref.head)
                .await?
                .ok_or_else(|| {
                    VersionStoreError::invalid_argument(
                        "source and target share no common ancestor",
                    )
                })?;

            // Merging an ancestor of the target is a no-op.
            if base == source_head {
                return Ok(MergeResult {
                    head: target_ref.head,
                    fast_forward: true,
                    common_ancestor: base,
                });
            }
            // The target hasn't diverged: advance it without a merge commit.
            if base == target_ref.head {
                match self
                    .refs
                    .update_ref(&request.target, &target_ref.head, &source_head)
                    .await
                {
                    Ok(_) => {
                        return Ok(MergeResult {
                            head: source_head,
                            fast_forward: true,
                            common_ancestor: base,
                        });
                    }
                    Err(BackendError::CasMismatch { .. }) if attempts_left > 0 => continue,
                    Err(err) => return Err(ref_error(&request.target, err)),
                }
            }

            let base_commit = self.expect_commit(&base).await?;
            let target_commit = self.expect_commit(&target_ref.head).await?;
            let source_changes = key_index::diff(
                &self.store,
                base_commit.index_root.as_ref(),
                source_commit.index_root.as_ref(),
            )
            .await?;
            let target_changes = key_index::diff(
                &self.store,
                base_commit.index_root.as_ref(),
                target_commit.index_root.as_ref(),
            )
            .await?;
            let resolved = resolve_merge(&source_changes, &target_changes, &request.behavior);
            if !resolved.conflicts.is_empty() {
                return Err(VersionStoreError::ContentConflict {
                    conflicts: resolved.conflicts,
                });
            }

            let index_root = key_index::apply_operations(
                &self.store,
                target_commit.index_root.as_ref(),
                &resolved.operations,
                self.descriptor.config.segment_byte_budget,
            )
            .await?;
            let message = request.message.clone().unwrap_or_else(|| {
                format!("Merge {source_label} into {}", request.target)
            });
            let commit = Commit {
                parents: vec![target_ref.head.clone(), source_head.clone()],
                committer: self.committer(&request.author),
                author: request.author.clone(),
                message,
                operations: resolved.operations,
                index_root,
                metadata: BTreeMap::new(),
            };
            let (merge_id, _) = self.store.write_commit(commit).await?;
            match self
                .refs
                .update_ref(&request.target, &target_ref.head, &merge_id)
                .await
            {
                Ok(_) => {
                    tracing::debug!(target = %request.target, commit = %merge_id, "merged");
                    return Ok(MergeResult {
                        head: merge_id,
                        fast_forward: false,
                        common_ancestor: base,
                    });
                }
                Err(BackendError::CasMismatch { .. }) if attempts_left > 0 => {
                    tracing::debug!(target = %request.target, "merge lost the race, retrying");
                }
                Err(BackendError::CasMismatch { .. }) => {
                    return Err(VersionStoreError::ReferenceConflict {
                        name: request.target.clone(),
                        message: "reference head moved concurrently".to_string(),
                    });
                }
                Err(err) => return Err(ref_error(&request.target, err)),
            }
        }
    }

    /// Applies the operations of `commits`, in order, on top of the target
    /// branch (cherry-pick).
    pub async fn transplant(&self, request: TransplantRequest) -> Result<TransplantResult> {
        if request.commits.is_empty() {
            return Err(VersionStoreError::invalid_argument(
                "no commits to transplant",
            ));
        }

        let mut attempts_left = self.descriptor.config.commit_retries.max(1);
        loop {
            attempts_left -= 1;
            let target_ref = self.get_ref(&request.target).await?;
            if target_ref.kind != RefKind::Branch {
                return Err(VersionStoreError::invalid_argument(format!(
                    "cannot transplant onto {}: not a branch",
                    request.target
                )));
            }
            let mut parent_id = target_ref.head.clone();
            let mut current_root = self.expect_commit(&parent_id).await?.index_root.clone();
            let mut created = vec![];
            let mut squashed: BTreeMap<ContentKey, CommitOperation> = BTreeMap::new();

            for source_id in &request.commits {
                let source_commit = self.expect_commit(source_id).await?;
                let base_id = source_commit.parents.first().ok_or_else(|| {
                    VersionStoreError::invalid_argument("cannot transplant the root commit")
                })?;
                let base_commit = self.expect_commit(base_id).await?;

                let source_changes = key_index::diff(
                    &self.store,
                    base_commit.index_root.as_ref(),
                    source_commit.index_root.as_ref(),
                )
                .await?;
                let target_changes = key_index::diff(
                    &self.store,
                    base_commit.index_root.as_ref(),
                    current_root.as_ref(),
                )
                .await?;
                let resolved = resolve_merge(&source_changes, &target_changes, &request.behavior);
                if !resolved.conflicts.is_empty() {
                    return Err(VersionStoreError::ContentConflict {
                        conflicts: resolved.conflicts,
                    });
                }
                if resolved.operations.is_empty() {
                    continue;
                }
                current_root = key_index::apply_operations(
                    &self.store,
                    current_root.as_ref(),
                    &resolved.operations,
                    self.descriptor.config.segment_byte_budget,
                )
                .await?;
                if request.squash {
                    for op in resolved.operations {
                        squashed.insert(op.key.clone(), op);
                    }
                } else {
                    let commit = Commit {
                        parents: vec![parent_id.clone()],
                        committer: self.committer(&request.author),
                        author: source_commit.author.clone(),
                        message: source_commit.message.clone(),
                        operations: resolved.operations,
                        index_root: current_root.clone(),
                        metadata: source_commit.metadata.clone(),
                    };
                    let (id, _) = self.store.write_commit(commit).await?;
                    created.push(id.clone());
                    parent_id = id;
                }
            }

            if request.squash && !squashed.is_empty() {
                let commit = Commit {
                    parents: vec![parent_id.clone()],
                    committer: self.committer(&request.author),
                    author: request.author.clone(),
                    message: format!("Transplant of {} commit(s)", request.commits.len()),
                    operations: squashed.into_values().collect(),
                    index_root: current_root.clone(),
                    metadata: BTreeMap::new(),
                };
                let (id, _) = self.store.write_commit(commit).await?;
                created.push(id.clone());
                parent_id = id;
            }

            if parent_id == target_ref.head {
                // Every step was a no-op.
                return Ok(TransplantResult {
                    head: parent_id,
                    created,
                });
            }
            match self
                .refs
                .update_ref(&request.target, &target_ref.head, &parent_id)
                .await
            {
                Ok(_) => {
                    return Ok(TransplantResult {
                        head: parent_id,
                        created,
                    });
                }
                Err(BackendError::CasMismatch { .. }) if attempts_left > 0 => {
                    tracing::debug!(target = %request.target, "transplant lost the race, retrying");
                }
                Err(BackendError::CasMismatch { .. }) => {
                    return Err(VersionStoreError::ReferenceConflict {
                        name: request.target.clone(),
                        message: "reference head moved concurrently".to_string(),
                    });
                }
                Err(err) => return Err(ref_error(&request.target, err)),
            }
        }
    }

    // ---- reads ----------------------------------------------------------

    /// Keyed differences between the commits addressed by `from` and `to`.
    pub async fn diff(&self, from: &RefSpec, to: &RefSpec) -> Result<Vec<IndexDiffEntry>> {
        let (_, from_id) = self.resolve_spec(from).await?;
        let (_, to_id) = self.resolve_spec(to).await?;
        let from_commit = self.expect_commit(&from_id).await?;
        let to_commit = self.expect_commit(&to_id).await?;
        Ok(key_index::diff(
            &self.store,
            from_commit.index_root.as_ref(),
            to_commit.index_root.as_ref(),
        )
        .await?)
    }

    /// Resolves the reference once, then reads every key against that fixed
    /// commit.
    pub async fn get_contents(&self, spec: &RefSpec, keys: &[ContentKey]) -> Result<ContentsResult> {
        let (_, commit_id) = self.resolve_spec(spec).await?;
        let commit = self.expect_commit(&commit_id).await?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            match key_index::lookup(&self.store, commit.index_root.as_ref(), key).await? {
                None => values.push(None),
                Some(value) => values.push(Some(self.store.get_content(&value.payload).await?)),
            }
        }
        Ok(ContentsResult {
            effective_commit: commit_id,
            values,
        })
    }

    /// Index-level read: the stored index values (content id, type, payload
    /// ref) for each key, resolved against one commit. Cheaper than
    /// [`Self::get_contents`] because payload blobs stay unread.
    pub async fn get_values(
        &self,
        spec: &RefSpec,
        keys: &[ContentKey],
    ) -> Result<(CommitId, Vec<Option<key_index::IndexValue>>)> {
        let (_, commit_id) = self.resolve_spec(spec).await?;
        let commit = self.expect_commit(&commit_id).await?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(key_index::lookup(&self.store, commit.index_root.as_ref(), key).await?);
        }
        Ok((commit_id, values))
    }

    /// Single-key read. Fails `NotFound` if the key has no content at the
    /// addressed commit.
    pub async fn get_content(
        &self,
        spec: &RefSpec,
        key: &ContentKey,
    ) -> Result<(CommitId, ContentValue)> {
        let result = self.get_contents(spec, std::slice::from_ref(key)).await?;
        match result.values.into_iter().next().flatten() {
            Some(value) => Ok((result.effective_commit, value)),
            None => Err(VersionStoreError::KeyNotFound { key: key.clone() }),
        }
    }

    /// Pages backward through first-parent history starting at `spec` (or at
    /// `page_token` on subsequent pages).
    pub async fn commit_log(
        &self,
        spec: &RefSpec,
        page_token: Option<CommitId>,
        limit: usize,
    ) -> Result<LogPage> {
        let start = match page_token {
            Some(token) => token,
            None => self.resolve_spec(spec).await?.1,
        };
        let mut entries = vec![];
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            if entries.len() == limit {
                return Ok(LogPage {
                    entries,
                    next: Some(id),
                });
            }
            let commit = self.expect_commit(&id).await?;
            cursor = commit.parents.first().cloned();
            entries.push(LogEntry { id, commit });
        }
        Ok(LogPage {
            entries,
            next: None,
        })
    }

    /// Pages through the keys live at the addressed commit, optionally
    /// filtered to a namespace prefix.
    pub async fn entries(
        &self,
        spec: &RefSpec,
        prefix: Option<&ContentKey>,
        page_token: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<EntriesPage> {
        let (_, commit_id) = self.resolve_spec(spec).await?;
        let commit = self.expect_commit(&commit_id).await?;
        let page = key_index::scan(
            &self.store,
            commit.index_root.as_ref(),
            prefix,
            page_token,
            limit,
        )
        .await?;
        Ok(EntriesPage {
            effective_commit: commit_id,
            entries: page.entries,
            next: page.next,
        })
    }

    // ---- internals -------------------------------------------------------

    async fn resolve_spec(&self, spec: &RefSpec) -> Result<(String, CommitId)> {
        match spec {
            RefSpec::Name(name) => {
                let reference = self.get_ref(name).await?;
                Ok((name.to_string(), reference.head))
            }
            RefSpec::Hash(id) => {
                self.expect_commit(id).await?;
                Ok((id.to_string(), id.clone()))
            }
        }
    }

    async fn expect_commit(&self, id: &CommitId) -> Result<Arc<Commit>> {
        self.store
            .get_commit_async(id)
            .await
            .map_err(|err| match err {
                BackendError::NotFound { .. } => {
                    VersionStoreError::CommitNotFound { id: id.clone() }
                }
                err => err.into(),
            })
    }
}

fn ref_error(name: &RefName, err: BackendError) -> VersionStoreError {
    match err {
        BackendError::NotFound { .. } => VersionStoreError::RefNotFound {
            name: name.to_owned(),
        },
        BackendError::AlreadyExists { .. } => VersionStoreError::RefAlreadyExists {
            name: name.to_owned(),
        },
        BackendError::CasMismatch { .. } => VersionStoreError::ReferenceConflict {
            name: name.to_owned(),
            message: "reference head moved concurrently".to_string(),
        },
        err => err.into(),
    }
}
