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

//! Keyed three-way merge resolution.
//!
//! Given the changes each side made relative to the common ancestor, every
//! key falls into one of three cases: changed on one side (apply that
//! side), changed identically on both (nothing to do), or diverging
//! (resolved per strategy). The caller turns the resolved operations into a
//! merge commit; this module never touches storage.

use std::collections::BTreeMap;

use crate::commit::CommitOperation;
use crate::commit::OperationKind;
use crate::content_key::ContentKey;
use crate::error::Conflict;
use crate::error::ConflictKind;
use crate::key_index::IndexDiffEntry;
use crate::key_index::IndexValue;

/// How to resolve a key modified on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Divergent modifications are conflicts.
    Normal,
    /// The source side wins unconditionally.
    Force,
    /// Divergent keys are silently left at the target's value.
    DropOnConflict,
    /// Same as `Force`, kept distinct for per-key overrides.
    PreferSource,
    /// Same as `DropOnConflict` but intended as an explicit choice.
    PreferTarget,
}

/// Merge configuration: the default strategy plus per-key overrides.
#[derive(Debug, Clone, Default)]
pub struct MergeBehavior {
    pub default_strategy: Option<MergeStrategy>,
    pub key_overrides: BTreeMap<ContentKey, MergeStrategy>,
}

impl MergeBehavior {
    fn strategy_for(&self, key: &ContentKey) -> MergeStrategy {
        self.key_overrides
            .get(key)
            .copied()
            .or(self.default_strategy)
            .unwrap_or(MergeStrategy::Normal)
    }
}

/// Outcome of resolving one merge: the operations to apply on the target,
/// and the conflicts that could not be resolved.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResolvedMerge {
    pub operations: Vec<CommitOperation>,
    pub conflicts: Vec<Conflict>,
}

fn operation_for(key: &ContentKey, after: Option<&IndexValue>) -> CommitOperation {
    CommitOperation {
        key: key.clone(),
        kind: match after {
            Some(value) => OperationKind::Put {
                content_id: value.content_id,
                content_type: value.content_type,
                payload: value.payload.clone(),
            },
            None => OperationKind::Delete,
        },
    }
}

/// Resolves `source_changes` against `target_changes`, both relative to the
/// common ancestor.
pub fn resolve_merge(
    source_changes: &[IndexDiffEntry],
    target_changes: &[IndexDiffEntry],
    behavior: &MergeBehavior,
) -> ResolvedMerge {
    let target_by_key: BTreeMap<&ContentKey, &IndexDiffEntry> = target_changes
        .iter()
        .map(|change| (&change.key, change))
        .collect();

    let mut resolved = ResolvedMerge::default();
    for change in source_changes {
        let Some(target_change) = target_by_key.get(&change.key) else {
            // Only the source touched this key.
            resolved
                .operations
                .push(operation_for(&change.key, change.after.as_ref()));
            continue;
        };
        if change.after == target_change.after {
            // Both sides arrived at the same value.
            continue;
        }
        match behavior.strategy_for(&change.key) {
            MergeStrategy::Normal => resolved.conflicts.push(Conflict {
                key: change.key.clone(),
                kind: ConflictKind::PayloadDiffers,
                message: format!("values of existing and expected content for key {} are different", change.key),
            }),
            MergeStrategy::Force | MergeStrategy::PreferSource => resolved
                .operations
                .push(operation_for(&change.key, change.after.as_ref())),
            MergeStrategy::DropOnConflict | MergeStrategy::PreferTarget => {}
        }
    }
    resolved
}
