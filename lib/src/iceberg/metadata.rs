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

//! Serde models of Iceberg table metadata (format v2) and view metadata
//! (format v1), using the Iceberg wire names.

use std::collections::BTreeMap;

use uuid::Uuid;

pub const TABLE_FORMAT_VERSION: i32 = 2;
pub const VIEW_FORMAT_VERSION: i32 = 1;

/// Sentinel accepted by `set-current-schema` and friends meaning "the last
/// added one".
pub const LAST_ADDED: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NestedField {
    pub id: i32,
    pub name: String,
    pub required: bool,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Schema {
    pub schema_id: i32,
    #[serde(rename = "type", default = "struct_type")]
    pub struct_type: String,
    pub fields: Vec<NestedField>,
}

fn struct_type() -> String {
    "struct".to_string()
}

impl Schema {
    /// The highest field id used by this schema.
    pub fn max_field_id(&self) -> i32 {
        self.fields.iter().map(|field| field.id).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionField {
    pub source_id: i32,
    pub field_id: i32,
    pub name: String,
    pub transform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSpec {
    pub spec_id: i32,
    pub fields: Vec<PartitionField>,
}

impl PartitionSpec {
    pub fn max_field_id(&self) -> i32 {
        self.fields.iter().map(|field| field.field_id).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SortField {
    pub source_id: i32,
    pub transform: String,
    pub direction: String,
    pub null_order: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SortOrder {
    pub order_id: i32,
    pub fields: Vec<SortField>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub snapshot_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: i64,
    pub timestamp_ms: i64,
    pub manifest_list: String,
    #[serde(default)]
    pub summary: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotLogEntry {
    pub timestamp_ms: i64,
    pub snapshot_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetadataLogEntry {
    pub timestamp_ms: i64,
    pub metadata_file: String,
}

/// Iceberg table metadata, format version 2.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadata {
    pub format_version: i32,
    pub table_uuid: Uuid,
    pub location: String,
    pub last_sequence_number: i64,
    pub last_updated_ms: i64,
    pub last_column_id: i32,
    pub schemas: Vec<Schema>,
    pub current_schema_id: i32,
    #[serde(default)]
    pub partition_specs: Vec<PartitionSpec>,
    pub default_spec_id: i32,
    pub last_partition_id: i32,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_snapshot_id: Option<i64>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default)]
    pub snapshot_log: Vec<SnapshotLogEntry>,
    #[serde(default)]
    pub metadata_log: Vec<MetadataLogEntry>,
    #[serde(default)]
    pub sort_orders: Vec<SortOrder>,
    pub default_sort_order_id: i32,
}

impl TableMetadata {
    /// A fresh table with no schema yet; clients add one before the first
    /// snapshot.
    pub fn empty(table_uuid: Uuid, location: String, last_updated_ms: i64) -> Self {
        Self {
            format_version: TABLE_FORMAT_VERSION,
            table_uuid,
            location,
            last_sequence_number: 0,
            last_updated_ms,
            last_column_id: 0,
            schemas: vec![],
            current_schema_id: LAST_ADDED,
            partition_specs: vec![PartitionSpec {
                spec_id: 0,
                fields: vec![],
            }],
            default_spec_id: 0,
            last_partition_id: 999,
            properties: BTreeMap::new(),
            current_snapshot_id: None,
            snapshots: vec![],
            snapshot_log: vec![],
            metadata_log: vec![],
            sort_orders: vec![SortOrder {
                order_id: 0,
                fields: vec![],
            }],
            default_sort_order_id: 0,
        }
    }

    pub fn schema_by_id(&self, schema_id: i32) -> Option<&Schema> {
        self.schemas.iter().find(|schema| schema.schema_id == schema_id)
    }

    pub fn snapshot_by_id(&self, snapshot_id: i64) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .find(|snapshot| snapshot.snapshot_id == snapshot_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ViewRepresentation {
    #[serde(rename = "type")]
    pub kind: String,
    pub sql: String,
    pub dialect: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ViewVersion {
    pub version_id: i64,
    pub schema_id: i32,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub summary: BTreeMap<String, String>,
    pub representations: Vec<ViewRepresentation>,
    #[serde(default)]
    pub default_namespace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ViewVersionLogEntry {
    pub timestamp_ms: i64,
    pub version_id: i64,
}

/// Iceberg view metadata, format version 1.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ViewMetadata {
    pub view_uuid: Uuid,
    pub format_version: i32,
    pub location: String,
    pub current_version_id: i64,
    #[serde(default)]
    pub versions: Vec<ViewVersion>,
    #[serde(default)]
    pub version_log: Vec<ViewVersionLogEntry>,
    #[serde(default)]
    pub schemas: Vec<Schema>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ViewMetadata {
    pub fn empty(view_uuid: Uuid, location: String) -> Self {
        Self {
            view_uuid,
            format_version: VIEW_FORMAT_VERSION,
            location,
            current_version_id: 0,
            versions: vec![],
            version_log: vec![],
            schemas: vec![],
            properties: BTreeMap::new(),
        }
    }

    pub fn version_by_id(&self, version_id: i64) -> Option<&ViewVersion> {
        self.versions
            .iter()
            .find(|version| version.version_id == version_id)
    }

    pub fn schema_by_id(&self, schema_id: i32) -> Option<&Schema> {
        self.schemas.iter().find(|schema| schema.schema_id == schema_id)
    }
}
