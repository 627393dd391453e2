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

//! The paginated key→content index reachable from every commit.
//!
//! Index nodes are content-addressed and immutable, so commits that leave a
//! key range untouched keep referencing the parent's nodes (structural
//! sharing). The root stays a single leaf until it outgrows the byte
//! budget, then becomes a branch of leaves, which keeps lookups at one or
//! two node reads.

use std::collections::BTreeMap;
use std::collections::HashSet;

use itertools::Itertools as _;

use crate::backend::BackendResult;
use crate::commit::CommitOperation;
use crate::commit::OperationKind;
use crate::content::ContentId;
use crate::content::ContentType;
use crate::content::PayloadId;
use crate::content_hash::ContentHash;
use crate::content_hash::DigestUpdate;
use crate::content_hash::impl_content_hash;
use crate::content_key::ContentKey;
use crate::object_id::ObjectId as _;
use crate::object_id::id_type;
use crate::store::Store;

id_type!(
    /// Identifier of an [`IndexNode`], the hash of its canonical bytes.
    pub SegmentId
);

/// Target serialized size of a leaf before it is split.
pub const DEFAULT_SEGMENT_BYTE_BUDGET: usize = 64 * 1024;

/// What the index stores per key: enough for listings and conflict checks
/// without loading the payload blob.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexValue {
    pub content_id: ContentId,
    pub content_type: ContentType,
    pub payload: PayloadId,
}

impl_content_hash!(IndexValue {
    content_id,
    content_type,
    payload,
});

/// One key→value mapping inside a leaf.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexEntry {
    pub key: ContentKey,
    pub value: IndexValue,
}

impl_content_hash!(IndexEntry { key, value });

/// Range pointer from a branch to a child node.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChildRef {
    pub first_key: ContentKey,
    pub last_key: ContentKey,
    pub id: SegmentId,
}

impl_content_hash!(ChildRef {
    first_key,
    last_key,
    id,
});

/// A content-addressed index node. Leaves hold sorted entries; branches
/// hold range-indexed children.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "node", rename_all = "kebab-case")]
pub enum IndexNode {
    Leaf { entries: Vec<IndexEntry> },
    Branch { children: Vec<ChildRef> },
}

impl ContentHash for IndexNode {
    fn hash(&self, state: &mut impl DigestUpdate) {
        match self {
            Self::Leaf { entries } => {
                0_u32.hash(state);
                entries.hash(state);
            }
            Self::Branch { children } => {
                1_u32.hash(state);
                children.hash(state);
            }
        }
    }
}

// Serialized-size estimate used for splitting. Ids and the type tag
// dominate the fixed part.
fn entry_weight(entry: &IndexEntry) -> usize {
    let key_len: usize = entry.key.elements().iter().map(|e| e.len() + 3).sum();
    key_len + 96
}

/// Applies `operations` in listed order on top of `parent_root`, writing new
/// nodes and returning the new root. Nodes whose key range is untouched are
/// reused from the parent index.
pub async fn apply_operations(
    store: &Store,
    parent_root: Option<&SegmentId>,
    operations: &[CommitOperation],
    byte_budget: usize,
) -> BackendResult<Option<SegmentId>> {
    let mut mutations: BTreeMap<&ContentKey, Option<IndexValue>> = BTreeMap::new();
    for op in operations {
        match &op.kind {
            OperationKind::Put {
                content_id,
                content_type,
                payload,
            } => {
                mutations.insert(
                    &op.key,
                    Some(IndexValue {
                        content_id: *content_id,
                        content_type: *content_type,
                        payload: payload.clone(),
                    }),
                );
            }
            OperationKind::Delete => {
                mutations.insert(&op.key, None);
            }
            OperationKind::Unchanged => {}
        }
    }
    if mutations.is_empty() {
        return Ok(parent_root.cloned());
    }

    let Some(root_id) = parent_root else {
        let entries = mutations
            .into_iter()
            .filter_map(|(key, value)| {
                value.map(|value| IndexEntry {
                    key: key.clone(),
                    value,
                })
            })
            .collect_vec();
        let children = write_leaf_chunks(store, entries, byte_budget).await?;
        return finish_root(store, children).await;
    };

    let root = store.get_node(root_id).await?;
    let children = match &*root {
        IndexNode::Leaf { entries } => {
            let merged = merge_entries(entries, mutations);
            write_leaf_chunks(store, merged, byte_budget).await?
        }
        IndexNode::Branch { children } => {
            let mut new_children = vec![];
            let mut mutations = mutations.into_iter().peekable();
            for (child_index, child) in children.iter().enumerate() {
                // Mutations sort below the next child's range belong here;
                // everything left over lands in the last child.
                let next_first = children.get(child_index + 1).map(|next| &next.first_key);
                let mut child_mutations: BTreeMap<&ContentKey, Option<IndexValue>> =
                    BTreeMap::new();
                while let Some((key, _)) = mutations.peek() {
                    match next_first {
                        Some(next_first) if *key >= next_first => break,
                        _ => {
                            let (key, value) = mutations.next().unwrap();
                            child_mutations.insert(key, value);
                        }
                    }
                }
                if child_mutations.is_empty() {
                    new_children.push(child.clone());
                    continue;
                }
                let child_node = store.get_node(&child.id).await?;
                let IndexNode::Leaf { entries } = &*child_node else {
                    // Branches are always one level deep by construction.
                    return Err(crate::backend::BackendError::Fatal {
                        source: format!("index branch {} nested under a branch", child.id).into(),
                    });
                };
                let merged = merge_entries(entries, child_mutations);
                new_children.extend(write_leaf_chunks(store, merged, byte_budget).await?);
            }
            new_children
        }
    };
    finish_root(store, children).await
}

// Merge-joins sorted `existing` entries with sorted mutations. `Some`
// inserts or replaces, `None` removes.
fn merge_entries(
    existing: &[IndexEntry],
    mutations: BTreeMap<&ContentKey, Option<IndexValue>>,
) -> Vec<IndexEntry> {
    let mut result = Vec::with_capacity(existing.len() + mutations.len());
    let mut existing = existing.iter().peekable();
    for (key, value) in mutations {
        while let Some(entry) = existing.next_if(|entry| entry.key < *key) {
            result.push(entry.clone());
        }
        if existing.peek().is_some_and(|entry| entry.key == *key) {
            existing.next();
        }
        if let Some(value) = value {
            result.push(IndexEntry {
                key: key.clone(),
                value,
            });
        }
    }
    result.extend(existing.cloned());
    result
}

// Writes `entries` as one or more leaves chunked by the byte budget.
async fn write_leaf_chunks(
    store: &Store,
    entries: Vec<IndexEntry>,
    byte_budget: usize,
) -> BackendResult<Vec<ChildRef>> {
    let mut children = vec![];
    let mut chunk: Vec<IndexEntry> = vec![];
    let mut chunk_weight = 0;
    for entry in entries {
        let weight = entry_weight(&entry);
        if !chunk.is_empty() && chunk_weight + weight > byte_budget {
            children.push(write_leaf(store, std::mem::take(&mut chunk)).await?);
            chunk_weight = 0;
        }
        chunk_weight += weight;
        chunk.push(entry);
    }
    if !chunk.is_empty() {
        children.push(write_leaf(store, chunk).await?);
    }
    Ok(children)
}

async fn write_leaf(store: &Store, entries: Vec<IndexEntry>) -> BackendResult<ChildRef> {
    let first_key = entries.first().unwrap().key.clone();
    let last_key = entries.last().unwrap().key.clone();
    let id = store.write_node(IndexNode::Leaf { entries }).await?;
    Ok(ChildRef {
        first_key,
        last_key,
        id,
    })
}

async fn finish_root(store: &Store, children: Vec<ChildRef>) -> BackendResult<Option<SegmentId>> {
    match children.len() {
        0 => Ok(None),
        1 => Ok(Some(children.into_iter().next().unwrap().id)),
        _ => Ok(Some(
            store.write_node(IndexNode::Branch { children }).await?,
        )),
    }
}

/// Resolves `key` in the index rooted at `root`.
pub async fn lookup(
    store: &Store,
    root: Option<&SegmentId>,
    key: &ContentKey,
) -> BackendResult<Option<IndexValue>> {
    let Some(root_id) = root else {
        return Ok(None);
    };
    let mut node = store.get_node(root_id).await?;
    loop {
        match &*node {
            IndexNode::Leaf { entries } => {
                return Ok(entries
                    .binary_search_by(|entry| entry.key.cmp(key))
                    .ok()
                    .map(|index| entries[index].value.clone()));
            }
            IndexNode::Branch { children } => {
                let index = children
                    .partition_point(|child| child.first_key <= *key)
                    .saturating_sub(1);
                node = store.get_node(&children[index].id).await?;
            }
        }
    }
}

/// Resume position of a [`scan`]: the leaf to continue in and the entry
/// offset within it. Stable because every commit references its own
/// immutable root.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanCursor {
    pub segment: SegmentId,
    pub offset: usize,
}

/// One page of an index scan.
#[derive(Debug, PartialEq, Eq)]
pub struct IndexScanPage {
    pub entries: Vec<IndexEntry>,
    pub next: Option<ScanCursor>,
}

/// Streams entries in key order, filtered to `prefix`, resuming at `cursor`.
pub async fn scan(
    store: &Store,
    root: Option<&SegmentId>,
    prefix: Option<&ContentKey>,
    cursor: Option<&ScanCursor>,
    limit: usize,
) -> BackendResult<IndexScanPage> {
    let mut page = IndexScanPage {
        entries: vec![],
        next: None,
    };
    let leaves = leaf_ids(store, root).await?;
    let (start_leaf, start_offset) = match cursor {
        None => (0, 0),
        // A cursor from a different root restarts the scan from the top.
        Some(cursor) => match leaves.iter().position(|id| *id == cursor.segment) {
            Some(index) => (index, cursor.offset),
            None => (0, 0),
        },
    };
    for (leaf_index, leaf_id) in leaves.iter().enumerate().skip(start_leaf) {
        let node = store.get_node(leaf_id).await?;
        let IndexNode::Leaf { entries } = &*node else {
            continue;
        };
        let offset = if leaf_index == start_leaf { start_offset } else { 0 };
        for (entry_index, entry) in entries.iter().enumerate().skip(offset) {
            if let Some(prefix) = prefix {
                if !entry.key.starts_with(prefix) {
                    if entry.key > *prefix {
                        // Sorted order puts every remaining key past the
                        // prefix range.
                        return Ok(page);
                    }
                    continue;
                }
            }
            if page.entries.len() == limit {
                page.next = Some(ScanCursor {
                    segment: leaf_id.clone(),
                    offset: entry_index,
                });
                return Ok(page);
            }
            page.entries.push(entry.clone());
        }
    }
    Ok(page)
}

/// A keyed difference between two index roots.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexDiffEntry {
    pub key: ContentKey,
    pub before: Option<IndexValue>,
    pub after: Option<IndexValue>,
}

/// Compares the indexes rooted at `from` and `to`, short-circuiting over
/// nodes shared by both sides.
pub async fn diff(
    store: &Store,
    from: Option<&SegmentId>,
    to: Option<&SegmentId>,
) -> BackendResult<Vec<IndexDiffEntry>> {
    if from == to {
        return Ok(vec![]);
    }
    let from_leaves = leaf_ids(store, from).await?;
    let to_leaves = leaf_ids(store, to).await?;
    let shared: HashSet<&SegmentId> = from_leaves
        .iter()
        .collect::<HashSet<_>>()
        .intersection(&to_leaves.iter().collect())
        .copied()
        .collect();

    let from_entries = collect_entries(store, &from_leaves, &shared).await?;
    let to_entries = collect_entries(store, &to_leaves, &shared).await?;

    let mut result = vec![];
    let mut from_entries = from_entries.into_iter().peekable();
    let mut to_entries = to_entries.into_iter().peekable();
    loop {
        match (from_entries.peek(), to_entries.peek()) {
            (None, None) => return Ok(result),
            (Some(_), None) => {
                let entry = from_entries.next().unwrap();
                result.push(IndexDiffEntry {
                    key: entry.key,
                    before: Some(entry.value),
                    after: None,
                });
            }
            (None, Some(_)) => {
                let entry = to_entries.next().unwrap();
                result.push(IndexDiffEntry {
                    key: entry.key,
                    before: None,
                    after: Some(entry.value),
                });
            }
            (Some(before), Some(after)) => match before.key.cmp(&after.key) {
                std::cmp::Ordering::Less => {
                    let entry = from_entries.next().unwrap();
                    result.push(IndexDiffEntry {
                        key: entry.key,
                        before: Some(entry.value),
                        after: None,
                    });
                }
                std::cmp::Ordering::Greater => {
                    let entry = to_entries.next().unwrap();
                    result.push(IndexDiffEntry {
                        key: entry.key,
                        before: None,
                        after: Some(entry.value),
                    });
                }
                std::cmp::Ordering::Equal => {
                    let before = from_entries.next().unwrap();
                    let after = to_entries.next().unwrap();
                    if before.value != after.value {
                        result.push(IndexDiffEntry {
                            key: before.key,
                            before: Some(before.value),
                            after: Some(after.value),
                        });
                    }
                }
            },
        }
    }
}

// Leaf ids of the index in key order.
async fn leaf_ids(store: &Store, root: Option<&SegmentId>) -> BackendResult<Vec<SegmentId>> {
    let Some(root_id) = root else {
        return Ok(vec![]);
    };
    let node = store.get_node(root_id).await?;
    match &*node {
        IndexNode::Leaf { .. } => Ok(vec![root_id.clone()]),
        IndexNode::Branch { children } => {
            Ok(children.iter().map(|child| child.id.clone()).collect())
        }
    }
}

// Entries of all leaves not in `skip`, in key order.
async fn collect_entries(
    store: &Store,
    leaves: &[SegmentId],
    skip: &HashSet<&SegmentId>,
) -> BackendResult<Vec<IndexEntry>> {
    let mut result = vec![];
    for leaf_id in leaves {
        if skip.contains(leaf_id) {
            continue;
        }
        let node = store.get_node(leaf_id).await?;
        if let IndexNode::Leaf { entries } = &*node {
            result.extend(entries.iter().cloned());
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use pollster::FutureExt as _;

    use super::*;
    use crate::memory_backend::MemoryBackend;

    fn key(s: &str) -> ContentKey {
        ContentKey::parse_dotted(s).unwrap()
    }

    fn put(s: &str, payload: &'static str) -> CommitOperation {
        CommitOperation {
            key: key(s),
            kind: OperationKind::Put {
                content_id: ContentId::from_uuid(uuid::Uuid::nil()),
                content_type: ContentType::IcebergTable,
                payload: PayloadId::from_hex(payload),
            },
        }
    }

    fn delete(s: &str) -> CommitOperation {
        CommitOperation {
            key: key(s),
            kind: OperationKind::Delete,
        }
    }

    #[test]
    fn test_lookup_and_delete() {
        let store = Store::new(Box::new(MemoryBackend::new()));
        let root = apply_operations(
            &store,
            None,
            &[put("db.a", "aa"), put("db.b", "bb")],
            DEFAULT_SEGMENT_BYTE_BUDGET,
        )
        .block_on()
        .unwrap();

        let value = lookup(&store, root.as_ref(), &key("db.a"))
            .block_on()
            .unwrap()
            .unwrap();
        assert_eq!(value.payload, PayloadId::from_hex("aa"));
        assert_eq!(
            lookup(&store, root.as_ref(), &key("db.c")).block_on().unwrap(),
            None
        );

        let root2 = apply_operations(
            &store,
            root.as_ref(),
            &[delete("db.a")],
            DEFAULT_SEGMENT_BYTE_BUDGET,
        )
        .block_on()
        .unwrap();
        // Drop the node cache so lookups decode stored bytes.
        store.clear_caches();
        assert_eq!(
            lookup(&store, root2.as_ref(), &key("db.a")).block_on().unwrap(),
            None
        );
        // The old root is untouched.
        assert!(
            lookup(&store, root.as_ref(), &key("db.a"))
                .block_on()
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_deleting_everything_yields_empty_root() {
        let store = Store::new(Box::new(MemoryBackend::new()));
        let root = apply_operations(&store, None, &[put("a", "aa")], DEFAULT_SEGMENT_BYTE_BUDGET)
            .block_on()
            .unwrap();
        let root = apply_operations(&store, root.as_ref(), &[delete("a")], DEFAULT_SEGMENT_BYTE_BUDGET)
            .block_on()
            .unwrap();
        assert_eq!(root, None);
    }

    #[test]
    fn test_root_splits_into_branch() {
        let store = Store::new(Box::new(MemoryBackend::new()));
        // A tiny budget forces splitting after a couple of entries.
        let ops: Vec<_> = (0..20).map(|i| put(&format!("db.t{i:02}"), "aa")).collect();
        let root = apply_operations(&store, None, &ops, 300)
            .block_on()
            .unwrap()
            .unwrap();

        let node = store.get_node(&root).block_on().unwrap();
        let IndexNode::Branch { children } = &*node else {
            panic!("expected a branch root, got {node:?}");
        };
        assert!(children.len() > 1);
        // Every key still resolves.
        for i in 0..20 {
            assert!(
                lookup(&store, Some(&root), &key(&format!("db.t{i:02}")))
                    .block_on()
                    .unwrap()
                    .is_some()
            );
        }
    }

    #[test]
    fn test_structural_sharing_across_commits() {
        let store = Store::new(Box::new(MemoryBackend::new()));
        let ops: Vec<_> = (0..20).map(|i| put(&format!("db.t{i:02}"), "aa")).collect();
        let root1 = apply_operations(&store, None, &ops, 300).block_on().unwrap();
        let root2 = apply_operations(&store, root1.as_ref(), &[put("db.t00", "bb")], 300)
            .block_on()
            .unwrap();

        let leaves1 = leaf_ids(&store, root1.as_ref()).block_on().unwrap();
        let leaves2 = leaf_ids(&store, root2.as_ref()).block_on().unwrap();
        let shared = leaves1.iter().filter(|id| leaves2.contains(id)).count();
        // Only the leaf containing db.t00 was rewritten.
        assert_eq!(shared, leaves1.len() - 1);
    }

    #[test]
    fn test_scan_resumes_with_cursor() {
        let store = Store::new(Box::new(MemoryBackend::new()));
        let mut ops: Vec<_> = (0..10).map(|i| put(&format!("db.t{i}"), "aa")).collect();
        ops.push(put("other.x", "aa"));
        let root = apply_operations(&store, None, &ops, 300).block_on().unwrap();

        let mut seen = vec![];
        let mut cursor = None;
        loop {
            let page = scan(
                &store,
                root.as_ref(),
                Some(&key("db")),
                cursor.as_ref(),
                3,
            )
            .block_on()
            .unwrap();
            seen.extend(page.entries.iter().map(|entry| entry.key.to_string()));
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        let expected: Vec<_> = (0..10).map(|i| format!("db.t{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_diff() {
        let store = Store::new(Box::new(MemoryBackend::new()));
        let root1 = apply_operations(
            &store,
            None,
            &[put("a", "aa"), put("b", "bb"), put("c", "cc")],
            DEFAULT_SEGMENT_BYTE_BUDGET,
        )
        .block_on()
        .unwrap();
        let root2 = apply_operations(
            &store,
            root1.as_ref(),
            &[put("b", "dd"), delete("c"), put("d", "ee")],
            DEFAULT_SEGMENT_BYTE_BUDGET,
        )
        .block_on()
        .unwrap();

        assert_eq!(
            diff(&store, root1.as_ref(), root1.as_ref()).block_on().unwrap(),
            vec![]
        );

        let forward = diff(&store, root1.as_ref(), root2.as_ref())
            .block_on()
            .unwrap();
        let keys: Vec<_> = forward.iter().map(|entry| entry.key.to_string()).collect();
        assert_eq!(keys, ["b", "c", "d"]);
        assert!(forward[0].before.is_some() && forward[0].after.is_some());
        assert!(forward[1].before.is_some() && forward[1].after.is_none());
        assert!(forward[2].before.is_none() && forward[2].after.is_some());

        // Reversed direction flips before/after.
        let backward = diff(&store, root2.as_ref(), root1.as_ref())
            .block_on()
            .unwrap();
        assert_eq!(backward.len(), forward.len());
        for (fwd, bwd) in std::iter::zip(&forward, &backward) {
            assert_eq!(fwd.key, bwd.key);
            assert_eq!(fwd.before, bwd.after);
            assert_eq!(fwd.after, bwd.before);
        }
    }
}
