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

//! The snapshot-update state machine.
//!
//! One machine instance drives one table or view through a catalog commit:
//! `Initial → (check_requirements) → RequirementsChecked → (apply_updates)
//! → Draft → (finalize) → Finalized`. Requirement and update failures are
//! terminal. Every update is a pure, validated function of the draft; an
//! update list that leaves the draft equal to the prior metadata is
//! detected as a no-op so the caller can skip the commit entirely.

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;

use crate::iceberg::metadata::LAST_ADDED;
use crate::iceberg::metadata::PartitionSpec;
use crate::iceberg::metadata::Schema;
use crate::iceberg::metadata::Snapshot;
use crate::iceberg::metadata::SnapshotLogEntry;
use crate::iceberg::metadata::SortOrder;
use crate::iceberg::metadata::TABLE_FORMAT_VERSION;
use crate::iceberg::metadata::TableMetadata;
use crate::iceberg::metadata::ViewMetadata;
use crate::iceberg::metadata::ViewVersion;
use crate::iceberg::metadata::ViewVersionLogEntry;

/// The table branch every snapshot ref update must target.
pub const MAIN_BRANCH: &str = "main";

/// An Iceberg metadata update, named per the REST spec's `action` values.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum IcebergUpdate {
    AssignUuid { uuid: Uuid },
    UpgradeFormatVersion { format_version: i32 },
    AddSchema { schema: Schema },
    SetCurrentSchema { schema_id: i32 },
    AddPartitionSpec { spec: PartitionSpec },
    SetDefaultPartitionSpec { spec_id: i32 },
    AddSortOrder { sort_order: SortOrder },
    SetDefaultSortOrder { sort_order_id: i32 },
    AddSnapshot { snapshot: Snapshot },
    RemoveSnapshots { snapshot_ids: Vec<i64> },
    SetSnapshotRef { ref_name: String, snapshot_id: i64 },
    SetLocation { location: String },
    SetProperties { updates: BTreeMap<String, String> },
    RemoveProperties { removals: Vec<String> },
    AddViewVersion { view_version: ViewVersion },
    SetCurrentViewVersion { view_version_id: i64 },
}

/// A client assertion about the prior state of the entity.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IcebergRequirement {
    AssertCreate,
    AssertTableUuid { uuid: Uuid },
    AssertRefSnapshotId { r#ref: String, snapshot_id: Option<i64> },
    AssertCurrentSchemaId { current_schema_id: i32 },
    AssertLastAssignedFieldId { last_assigned_field_id: i32 },
    AssertLastAssignedPartitionId { last_assigned_partition_id: i32 },
    AssertDefaultSpecId { default_spec_id: i32 },
    AssertDefaultSortOrderId { default_sort_order_id: i32 },
}

/// Terminal failures of the state machine.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Requirement violated: {message}")]
    RequirementViolated { message: String },
    #[error("Update rejected: {message}")]
    UpdateRejected { message: String },
    #[error("Snapshot update in state {actual:?}, expected {expected:?}")]
    IllegalState {
        expected: UpdateState,
        actual: UpdateState,
    },
}

fn violated(message: impl Into<String>) -> UpdateError {
    UpdateError::RequirementViolated {
        message: message.into(),
    }
}

fn rejected(message: impl Into<String>) -> UpdateError {
    UpdateError::UpdateRejected {
        message: message.into(),
    }
}

/// Machine states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Initial,
    RequirementsChecked,
    Draft,
    Finalized,
}

/// The metadata draft being built, table or view.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftMetadata {
    Table(TableMetadata),
    View(ViewMetadata),
}

impl DraftMetadata {
    pub fn location(&self) -> &str {
        match self {
            Self::Table(table) => &table.location,
            Self::View(view) => &view.location,
        }
    }
}

/// Drives one entity through requirement checking and update application.
#[derive(Debug)]
pub struct SnapshotUpdateMachine {
    state: UpdateState,
    original: Option<DraftMetadata>,
    draft: DraftMetadata,
    now_ms: i64,
    last_added_schema: Option<i32>,
    last_added_spec: Option<i32>,
    last_added_sort_order: Option<i32>,
    last_added_view_version: Option<i64>,
}

impl SnapshotUpdateMachine {
    /// Starts from the prior table metadata, or a fresh empty table at
    /// `location` on create.
    pub fn for_table(prior: Option<TableMetadata>, location: String, now_ms: i64) -> Self {
        let draft = match &prior {
            Some(metadata) => metadata.clone(),
            None => TableMetadata::empty(Uuid::new_v4(), location, now_ms),
        };
        Self {
            state: UpdateState::Initial,
            original: prior.map(DraftMetadata::Table),
            draft: DraftMetadata::Table(draft),
            now_ms,
            last_added_schema: None,
            last_added_spec: None,
            last_added_sort_order: None,
            last_added_view_version: None,
        }
    }

    /// Starts from the prior view metadata, or a fresh empty view.
    pub fn for_view(prior: Option<ViewMetadata>, location: String, now_ms: i64) -> Self {
        let draft = match &prior {
            Some(metadata) => metadata.clone(),
            None => ViewMetadata::empty(Uuid::new_v4(), location),
        };
        Self {
            state: UpdateState::Initial,
            original: prior.map(DraftMetadata::View),
            draft: DraftMetadata::View(draft),
            now_ms,
            last_added_schema: None,
            last_added_spec: None,
            last_added_sort_order: None,
            last_added_view_version: None,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    fn expect_state(&self, expected: UpdateState) -> Result<(), UpdateError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(UpdateError::IllegalState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Validates all `requirements` against the prior state. Transitions
    /// `Initial → RequirementsChecked`.
    pub fn check_requirements(
        &mut self,
        requirements: &[IcebergRequirement],
    ) -> Result<(), UpdateError> {
        self.expect_state(UpdateState::Initial)?;
        for requirement in requirements {
            self.check_requirement(requirement)?;
        }
        self.state = UpdateState::RequirementsChecked;
        Ok(())
    }

    fn check_requirement(&self, requirement: &IcebergRequirement) -> Result<(), UpdateError> {
        use IcebergRequirement::*;
        if matches!(requirement, AssertCreate) {
            return if self.original.is_none() {
                Ok(())
            } else {
                Err(violated("entity already exists"))
            };
        }
        let Some(original) = &self.original else {
            return Err(violated("entity does not exist"));
        };
        match (requirement, original) {
            (AssertCreate, _) => unreachable!("handled above"),
            (AssertTableUuid { uuid }, DraftMetadata::Table(table)) => {
                if table.table_uuid != *uuid {
                    return Err(violated(format!(
                        "table uuid is {}, expected {uuid}",
                        table.table_uuid
                    )));
                }
            }
            (AssertTableUuid { uuid }, DraftMetadata::View(view)) => {
                if view.view_uuid != *uuid {
                    return Err(violated(format!(
                        "view uuid is {}, expected {uuid}",
                        view.view_uuid
                    )));
                }
            }
            (AssertRefSnapshotId { r#ref, snapshot_id }, DraftMetadata::Table(table)) => {
                let ref_name = r#ref;
                if ref_name != MAIN_BRANCH {
                    return Err(violated(format!("unknown table branch {ref_name}")));
                }
                if table.current_snapshot_id != *snapshot_id {
                    return Err(violated(format!(
                        "current snapshot id is {:?}, expected {snapshot_id:?}",
                        table.current_snapshot_id
                    )));
                }
            }
            (AssertCurrentSchemaId { current_schema_id }, DraftMetadata::Table(table)) => {
                if table.current_schema_id != *current_schema_id {
                    return Err(violated(format!(
                        "current schema id is {}, expected {current_schema_id}",
                        table.current_schema_id
                    )));
                }
            }
            (AssertLastAssignedFieldId { last_assigned_field_id }, DraftMetadata::Table(table)) => {
                if table.last_column_id != *last_assigned_field_id {
                    return Err(violated(format!(
                        "last assigned field id is {}, expected {last_assigned_field_id}",
                        table.last_column_id
                    )));
                }
            }
            (
                AssertLastAssignedPartitionId {
                    last_assigned_partition_id,
                },
                DraftMetadata::Table(table),
            ) => {
                if table.last_partition_id != *last_assigned_partition_id {
                    return Err(violated(format!(
                        "last assigned partition id is {}, expected {last_assigned_partition_id}",
                        table.last_partition_id
                    )));
                }
            }
            (AssertDefaultSpecId { default_spec_id }, DraftMetadata::Table(table)) => {
                if table.default_spec_id != *default_spec_id {
                    return Err(violated(format!(
                        "default spec id is {}, expected {default_spec_id}",
                        table.default_spec_id
                    )));
                }
            }
            (AssertDefaultSortOrderId { default_sort_order_id }, DraftMetadata::Table(table)) => {
                if table.default_sort_order_id != *default_sort_order_id {
                    return Err(violated(format!(
                        "default sort order id is {}, expected {default_sort_order_id}",
                        table.default_sort_order_id
                    )));
                }
            }
            (requirement, DraftMetadata::View(_)) => {
                return Err(violated(format!(
                    "requirement {requirement:?} does not apply to a view"
                )));
            }
        }
        Ok(())
    }

    /// Applies `updates` in listed order. Transitions `RequirementsChecked
    /// → Draft`.
    pub fn apply_updates(&mut self, updates: &[IcebergUpdate]) -> Result<(), UpdateError> {
        self.expect_state(UpdateState::RequirementsChecked)?;
        for update in updates {
            self.apply_update(update)?;
        }
        self.state = UpdateState::Draft;
        Ok(())
    }

    /// Whether the whole update list changed nothing. Callers short-circuit
    /// without writing a metadata file or a commit in that case.
    pub fn is_noop(&self) -> bool {
        debug_assert_eq!(self.state, UpdateState::Draft);
        self.original.as_ref() == Some(&self.draft)
    }

    /// Transitions `Draft → Finalized` and yields the draft for emission.
    pub fn finalize(mut self) -> Result<DraftMetadata, UpdateError> {
        self.expect_state(UpdateState::Draft)?;
        self.state = UpdateState::Finalized;
        Ok(self.draft)
    }

    fn table_mut(&mut self, update: &IcebergUpdate) -> Result<&mut TableMetadata, UpdateError> {
        match &mut self.draft {
            DraftMetadata::Table(table) => Ok(table),
            DraftMetadata::View(_) => Err(rejected(format!(
                "update {update:?} does not apply to a view"
            ))),
        }
    }

    fn view_mut(&mut self, update: &IcebergUpdate) -> Result<&mut ViewMetadata, UpdateError> {
        match &mut self.draft {
            DraftMetadata::View(view) => Ok(view),
            DraftMetadata::Table(_) => Err(rejected(format!(
                "update {update:?} does not apply to a table"
            ))),
        }
    }

    fn apply_update(&mut self, update: &IcebergUpdate) -> Result<(), UpdateError> {
        use IcebergUpdate::*;
        match update {
            AssignUuid { uuid } => match &mut self.draft {
                DraftMetadata::Table(table) => {
                    if self.original.is_some() && table.table_uuid != *uuid {
                        return Err(rejected("cannot reassign the uuid of an existing table"));
                    }
                    table.table_uuid = *uuid;
                }
                DraftMetadata::View(view) => {
                    if self.original.is_some() && view.view_uuid != *uuid {
                        return Err(rejected("cannot reassign the uuid of an existing view"));
                    }
                    view.view_uuid = *uuid;
                }
            },
            UpgradeFormatVersion { format_version } => {
                let table = self.table_mut(update)?;
                if *format_version < table.format_version {
                    return Err(rejected(format!(
                        "cannot downgrade format version from {} to {format_version}",
                        table.format_version
                    )));
                }
                if *format_version > TABLE_FORMAT_VERSION {
                    return Err(rejected(format!(
                        "unsupported format version {format_version}"
                    )));
                }
                table.format_version = *format_version;
            }
            AddSchema { schema } => {
                if schema.fields.is_empty() {
                    return Err(rejected("schema has no fields"));
                }
                let last_added = match &mut self.draft {
                    DraftMetadata::Table(table) => {
                        match table
                            .schemas
                            .iter()
                            .find(|existing| existing.fields == schema.fields)
                        {
                            // Adding a schema that already exists changes
                            // nothing.
                            Some(existing) => existing.schema_id,
                            None => {
                                let schema_id = table
                                    .schemas
                                    .iter()
                                    .map(|s| s.schema_id + 1)
                                    .max()
                                    .unwrap_or(0);
                                table.last_column_id =
                                    table.last_column_id.max(schema.max_field_id());
                                table.schemas.push(Schema {
                                    schema_id,
                                    ..schema.clone()
                                });
                                schema_id
                            }
                        }
                    }
                    DraftMetadata::View(view) => {
                        match view
                            .schemas
                            .iter()
                            .find(|existing| existing.fields == schema.fields)
                        {
                            Some(existing) => existing.schema_id,
                            None => {
                                let schema_id = view
                                    .schemas
                                    .iter()
                                    .map(|s| s.schema_id + 1)
                                    .max()
                                    .unwrap_or(0);
                                view.schemas.push(Schema {
                                    schema_id,
                                    ..schema.clone()
                                });
                                schema_id
                            }
                        }
                    }
                };
                self.last_added_schema = Some(last_added);
            }
            SetCurrentSchema { schema_id } => {
                let schema_id = if *schema_id == LAST_ADDED {
                    self.last_added_schema
                        .ok_or_else(|| rejected("set-current-schema: no schema was added"))?
                } else {
                    *schema_id
                };
                match &mut self.draft {
                    DraftMetadata::Table(table) => {
                        if table.schema_by_id(schema_id).is_none() {
                            return Err(rejected(format!("no schema with id {schema_id}")));
                        }
                        table.current_schema_id = schema_id;
                    }
                    DraftMetadata::View(view) => {
                        if view.schema_by_id(schema_id).is_none() {
                            return Err(rejected(format!("no schema with id {schema_id}")));
                        }
                    }
                }
            }
            AddPartitionSpec { spec } => {
                let table = self.table_mut(update)?;
                let spec_id = match table
                    .partition_specs
                    .iter()
                    .find(|existing| existing.fields == spec.fields)
                {
                    Some(existing) => existing.spec_id,
                    None => {
                        let spec_id = table
                            .partition_specs
                            .iter()
                            .map(|s| s.spec_id + 1)
                            .max()
                            .unwrap_or(0);
                        table.last_partition_id = table.last_partition_id.max(spec.max_field_id());
                        table.partition_specs.push(PartitionSpec {
                            spec_id,
                            ..spec.clone()
                        });
                        spec_id
                    }
                };
                self.last_added_spec = Some(spec_id);
            }
            SetDefaultPartitionSpec { spec_id } => {
                let last_added = self.last_added_spec;
                let table = self.table_mut(update)?;
                let spec_id = if *spec_id == LAST_ADDED {
                    last_added
                        .ok_or_else(|| rejected("set-default-partition-spec: no spec was added"))?
                } else {
                    *spec_id
                };
                if !table.partition_specs.iter().any(|s| s.spec_id == spec_id) {
                    return Err(rejected(format!("no partition spec with id {spec_id}")));
                }
                table.default_spec_id = spec_id;
            }
            AddSortOrder { sort_order } => {
                let table = self.table_mut(update)?;
                let order_id = match table
                    .sort_orders
                    .iter()
                    .find(|existing| existing.fields == sort_order.fields)
                {
                    Some(existing) => existing.order_id,
                    None => {
                        let order_id = table
                            .sort_orders
                            .iter()
                            .map(|s| s.order_id + 1)
                            .max()
                            .unwrap_or(0);
                        table.sort_orders.push(SortOrder {
                            order_id,
                            ..sort_order.clone()
                        });
                        order_id
                    }
                };
                self.last_added_sort_order = Some(order_id);
            }
            SetDefaultSortOrder { sort_order_id } => {
                let last_added = self.last_added_sort_order;
                let table = self.table_mut(update)?;
                let sort_order_id = if *sort_order_id == LAST_ADDED {
                    last_added
                        .ok_or_else(|| rejected("set-default-sort-order: no sort order was added"))?
                } else {
                    *sort_order_id
                };
                if !table.sort_orders.iter().any(|s| s.order_id == sort_order_id) {
                    return Err(rejected(format!("no sort order with id {sort_order_id}")));
                }
                table.default_sort_order_id = sort_order_id;
            }
            AddSnapshot { snapshot } => {
                let table = self.table_mut(update)?;
                if table.snapshot_by_id(snapshot.snapshot_id).is_some() {
                    return Err(rejected(format!(
                        "snapshot {} already exists",
                        snapshot.snapshot_id
                    )));
                }
                if snapshot.sequence_number <= table.last_sequence_number {
                    return Err(rejected(format!(
                        "snapshot sequence number {} is not after {}",
                        snapshot.sequence_number, table.last_sequence_number
                    )));
                }
                if table.current_schema_id == LAST_ADDED {
                    return Err(rejected("cannot add a snapshot before a current schema"));
                }
                table.last_sequence_number = snapshot.sequence_number;
                table.snapshots.push(snapshot.clone());
            }
            RemoveSnapshots { snapshot_ids } => {
                let table = self.table_mut(update)?;
                if let Some(current) = table.current_snapshot_id {
                    if snapshot_ids.contains(&current) {
                        return Err(rejected("cannot remove the current snapshot"));
                    }
                }
                table
                    .snapshots
                    .retain(|snapshot| !snapshot_ids.contains(&snapshot.snapshot_id));
                table
                    .snapshot_log
                    .retain(|entry| !snapshot_ids.contains(&entry.snapshot_id));
            }
            SetSnapshotRef { ref_name, snapshot_id } => {
                let now_ms = self.now_ms;
                let table = self.table_mut(update)?;
                if ref_name != MAIN_BRANCH {
                    return Err(rejected(format!("unknown table branch {ref_name}")));
                }
                if table.snapshot_by_id(*snapshot_id).is_none() {
                    return Err(rejected(format!("no snapshot with id {snapshot_id}")));
                }
                if table.current_snapshot_id != Some(*snapshot_id) {
                    table.current_snapshot_id = Some(*snapshot_id);
                    table.snapshot_log.push(SnapshotLogEntry {
                        timestamp_ms: now_ms,
                        snapshot_id: *snapshot_id,
                    });
                }
            }
            SetLocation { location } => match &mut self.draft {
                DraftMetadata::Table(table) => table.location = location.clone(),
                DraftMetadata::View(view) => view.location = location.clone(),
            },
            SetProperties { updates } => match &mut self.draft {
                DraftMetadata::Table(table) => {
                    table.properties.extend(updates.clone());
                }
                DraftMetadata::View(view) => {
                    view.properties.extend(updates.clone());
                }
            },
            RemoveProperties { removals } => match &mut self.draft {
                DraftMetadata::Table(table) => {
                    table.properties.retain(|key, _| !removals.contains(key));
                }
                DraftMetadata::View(view) => {
                    view.properties.retain(|key, _| !removals.contains(key));
                }
            },
            AddViewVersion { view_version } => {
                let now_ms = self.now_ms;
                let view = self.view_mut(update)?;
                if view.version_by_id(view_version.version_id).is_some() {
                    return Err(rejected(format!(
                        "view version {} already exists",
                        view_version.version_id
                    )));
                }
                let mut view_version = view_version.clone();
                if view_version.timestamp_ms == 0 {
                    view_version.timestamp_ms = now_ms;
                }
                let version_id = view_version.version_id;
                view.versions.push(view_version);
                self.last_added_view_version = Some(version_id);
            }
            SetCurrentViewVersion { view_version_id } => {
                let last_added = self.last_added_view_version;
                let now_ms = self.now_ms;
                let view = self.view_mut(update)?;
                let version_id = if *view_version_id == i64::from(LAST_ADDED) {
                    last_added.ok_or_else(|| {
                        rejected("set-current-view-version: no view version was added")
                    })?
                } else {
                    *view_version_id
                };
                if view.version_by_id(version_id).is_none() {
                    return Err(rejected(format!("no view version with id {version_id}")));
                }
                if view.current_version_id != version_id {
                    view.current_version_id = version_id;
                    view.version_log.push(ViewVersionLogEntry {
                        timestamp_ms: now_ms,
                        version_id,
                    });
                }
            }
        }
        Ok(())
    }
}
