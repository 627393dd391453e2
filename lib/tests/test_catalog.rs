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

use std::collections::BTreeMap;
use std::sync::Arc;

use assert_matches::assert_matches;
use icevault_lib::catalog::CatalogCommit;
use icevault_lib::catalog::CatalogConfig;
use icevault_lib::catalog::CatalogOperation;
use icevault_lib::catalog::CatalogService;
use icevault_lib::catalog::PROP_COMMIT_REF;
use icevault_lib::catalog::PROP_CONTENT_ID;
use icevault_lib::catalog::SnapshotFormat;
use icevault_lib::catalog::SnapshotResponse;
use icevault_lib::catalog::snapshot::EntitySnapshot;
use icevault_lib::catalog::update::IcebergRequirement;
use icevault_lib::catalog::update::IcebergUpdate;
use icevault_lib::content::Content;
use icevault_lib::error::CatalogError;
use icevault_lib::error::ErrorCode;
use icevault_lib::iceberg::codec::IcebergCodec as _;
use icevault_lib::iceberg::codec::JsonCodec;
use icevault_lib::iceberg::metadata::LAST_ADDED;
use icevault_lib::iceberg::metadata::NestedField;
use icevault_lib::iceberg::metadata::Schema;
use icevault_lib::iceberg::metadata::TableMetadata;
use icevault_lib::object_io::ObjectIO;
use icevault_lib::refs::RefName;
use icevault_lib::task_cache::TaskCacheConfig;
use icevault_lib::version_store::CommitOperationRequest;
use icevault_lib::version_store::CommitRequest;
use icevault_lib::version_store::RefSpec;
use icevault_lib::version_store::RequestedOperation;
use pollster::FutureExt as _;
use testutils::TestCatalog;
use testutils::content_key;
use testutils::namespace_content;
use testutils::test_signature;

fn schema(fields: &[(i32, &str)]) -> Schema {
    Schema {
        schema_id: 0,
        struct_type: "struct".to_string(),
        fields: fields
            .iter()
            .map(|(id, name)| NestedField {
                id: *id,
                name: (*name).to_string(),
                required: true,
                field_type: "long".to_string(),
                doc: None,
            })
            .collect(),
    }
}

fn create_table_op(key: &str, fields: &[(i32, &str)]) -> CatalogOperation {
    CatalogOperation {
        key: content_key(key),
        requirements: vec![IcebergRequirement::AssertCreate],
        updates: vec![
            IcebergUpdate::AddSchema {
                schema: schema(fields),
            },
            IcebergUpdate::SetCurrentSchema {
                schema_id: LAST_ADDED,
            },
        ],
    }
}

fn catalog_commit(env: &TestCatalog, operations: Vec<CatalogOperation>) -> CatalogCommit {
    env.catalog
        .commit(
            "main".into(),
            operations,
            test_signature(),
            "catalog commit".to_string(),
        )
        .block_on()
        .unwrap()
}

fn main_head(env: &TestCatalog) -> icevault_lib::commit::CommitId {
    env.repo
        .versions
        .get_ref(RefName::new("main"))
        .block_on()
        .unwrap()
        .head
}

#[test]
fn test_create_table_then_update_metadata() {
    let env = TestCatalog::init();
    let h0 = main_head(&env);

    // Create db.t1 with one schema.
    let created = catalog_commit(&env, vec![create_table_op("db.t1", &[(1, "id")])]);
    assert!(created.committed);
    let h1 = main_head(&env);
    assert_ne!(h1, h0);
    assert_eq!(created.commit_id, h1);

    let (_, value) = env
        .repo
        .versions
        .get_content(&RefSpec::name("main"), &content_key("db.t1"))
        .block_on()
        .unwrap();
    let Content::IcebergTable(table) = &value.content else {
        panic!("expected a table blob");
    };
    assert!(table
        .metadata_location
        .starts_with("mem://warehouse/db/t1/metadata/"));
    assert!(env.object_io.contains(&table.metadata_location));
    let first_location = table.metadata_location.clone();
    let s1 = created.snapshots[0].1.id().clone();

    // Update the schema.
    let updated = catalog_commit(
        &env,
        vec![CatalogOperation {
            key: content_key("db.t1"),
            requirements: vec![IcebergRequirement::AssertTableUuid {
                uuid: match &created.snapshots[0].1 {
                    EntitySnapshot::Table(snapshot) => snapshot.table_uuid,
                    EntitySnapshot::View(_) => panic!("expected a table snapshot"),
                },
            }],
            updates: vec![
                IcebergUpdate::AddSchema {
                    schema: schema(&[(1, "id"), (2, "data")]),
                },
                IcebergUpdate::SetCurrentSchema {
                    schema_id: LAST_ADDED,
                },
            ],
        }],
    );
    assert!(updated.committed);
    let h2 = main_head(&env);
    assert_ne!(h2, h1);

    let (_, value) = env
        .repo
        .versions
        .get_content(&RefSpec::name("main"), &content_key("db.t1"))
        .block_on()
        .unwrap();
    let Content::IcebergTable(table) = &value.content else {
        panic!("expected a table blob");
    };
    assert_ne!(table.metadata_location, first_location);
    let s2 = updated.snapshots[0].1.id().clone();
    assert_ne!(s2, s1);

    // The content id is stable across the update.
    assert_eq!(value.id, *created.snapshots[0].1.content_id());
}

#[test]
fn test_location_outside_warehouse_is_rejected() {
    let env = TestCatalog::init();
    catalog_commit(&env, vec![create_table_op("db.t1", &[(1, "id")])]);
    let head_before = main_head(&env);
    let objects_before = env.object_io.object_count();

    let err = env
        .catalog
        .commit(
            "main".into(),
            vec![CatalogOperation {
                key: content_key("db.t1"),
                requirements: vec![],
                updates: vec![IcebergUpdate::SetLocation {
                    location: "s3://other-bucket/x".to_string(),
                }],
            }],
            test_signature(),
            "move table".to_string(),
        )
        .block_on()
        .unwrap_err();
    assert_matches!(err, CatalogError::UpdateRejected { .. });
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    // No metadata file written, branch head unchanged.
    assert_eq!(env.object_io.object_count(), objects_before);
    assert_eq!(main_head(&env), head_before);
}

#[test]
fn test_noop_update_list_writes_no_commit() {
    let env = TestCatalog::init();
    catalog_commit(&env, vec![create_table_op("db.t1", &[(1, "id")])]);
    let head_before = main_head(&env);
    let objects_before = env.object_io.object_count();

    // Adding the schema that is already current changes nothing.
    let result = catalog_commit(
        &env,
        vec![CatalogOperation {
            key: content_key("db.t1"),
            requirements: vec![],
            updates: vec![
                IcebergUpdate::AddSchema {
                    schema: schema(&[(1, "id")]),
                },
                IcebergUpdate::SetCurrentSchema {
                    schema_id: LAST_ADDED,
                },
            ],
        }],
    );
    assert!(!result.committed);
    assert_eq!(result.commit_id, head_before);
    assert_eq!(main_head(&env), head_before);
    assert_eq!(env.object_io.object_count(), objects_before);
    // The prior snapshot is still reported.
    assert_eq!(result.snapshots.len(), 1);
}

#[test]
fn test_multi_table_commit_is_atomic() {
    let env = TestCatalog::init();
    let result = catalog_commit(
        &env,
        vec![
            create_table_op("db.t1", &[(1, "id")]),
            create_table_op("db.t2", &[(1, "id")]),
        ],
    );
    assert!(result.committed);
    assert_eq!(result.snapshots.len(), 2);

    // One commit carries both Puts.
    let commit = env.repo.store.get_commit(&result.commit_id).unwrap();
    assert_eq!(commit.operations.len(), 2);
}

#[test]
fn test_create_requires_absent_key() {
    let env = TestCatalog::init();
    catalog_commit(&env, vec![create_table_op("db.t1", &[(1, "id")])]);

    let err = env
        .catalog
        .commit(
            "main".into(),
            vec![create_table_op("db.t1", &[(1, "id")])],
            test_signature(),
            "recreate".to_string(),
        )
        .block_on()
        .unwrap_err();
    assert_matches!(err, CatalogError::RequirementViolated { .. });
}

#[test]
fn test_retrieve_snapshot_formats_and_passthrough() {
    let env = TestCatalog::init();
    catalog_commit(&env, vec![create_table_op("db.t1", &[(1, "id")])]);

    let native = env
        .catalog
        .retrieve_snapshot(
            &RefSpec::name("main"),
            &content_key("db.t1"),
            SnapshotFormat::Native,
        )
        .block_on()
        .unwrap();
    let SnapshotResponse::Native {
        snapshot,
        effective_ref,
        commit_id,
    } = native
    else {
        panic!("expected native format");
    };
    assert_eq!(effective_ref, "main");
    assert_eq!(commit_id, main_head(&env));
    let EntitySnapshot::Table(table) = &snapshot else {
        panic!("expected table snapshot");
    };
    assert_eq!(table.schemas.len(), 1);
    assert!(table.properties.contains_key(PROP_CONTENT_ID));
    assert_eq!(table.properties[PROP_COMMIT_REF], "main");

    let iceberg = env
        .catalog
        .retrieve_snapshot(
            &RefSpec::name("main"),
            &content_key("db.t1"),
            SnapshotFormat::Iceberg,
        )
        .block_on()
        .unwrap();
    let SnapshotResponse::Iceberg { metadata } = iceberg else {
        panic!("expected iceberg format");
    };
    assert_eq!(metadata["format-version"], 2);
    assert!(metadata["metadata-location"]
        .as_str()
        .unwrap()
        .starts_with("mem://warehouse/db/t1/metadata/"));
    assert!(metadata["properties"][PROP_CONTENT_ID].is_string());
}

#[test]
fn test_namespace_has_no_snapshot() {
    let env = TestCatalog::init();
    env.repo
        .versions
        .commit(CommitRequest {
            branch: "main".into(),
            expected_head: None,
            message: "create namespace".to_string(),
            author: test_signature(),
            operations: vec![CommitOperationRequest {
                key: content_key("db"),
                operation: RequestedOperation::Put(namespace_content()),
                requirement: None,
            }],
            metadata: BTreeMap::new(),
        })
        .block_on()
        .unwrap();

    let err = env
        .catalog
        .retrieve_snapshot(
            &RefSpec::name("main"),
            &content_key("db"),
            SnapshotFormat::Native,
        )
        .block_on()
        .unwrap_err();
    assert_matches!(err, CatalogError::NotASnapshot { .. });
    let info = err.to_error_info();
    assert_eq!(info.error_code, ErrorCode::NotFound);
    assert_eq!(info.reason, "Not a table");
}

#[test]
fn test_retrieve_snapshots_resolves_one_commit() {
    let env = TestCatalog::init();
    catalog_commit(&env, vec![create_table_op("db.t1", &[(1, "id")])]);

    let (commit_id, responses) = env
        .catalog
        .retrieve_snapshots(
            &RefSpec::name("main"),
            &[content_key("db.t1"), content_key("db.absent")],
            SnapshotFormat::Native,
        )
        .block_on()
        .unwrap();
    assert_eq!(commit_id, main_head(&env));
    assert!(responses[0].is_some());
    assert!(responses[1].is_none());
}

// Seeds a table whose snapshot is NOT pre-warmed in the cache, so the
// materialization path through ObjectIO is observable.
fn seed_unwarmed_table(env: &TestCatalog, key: &str, location: &str) {
    let metadata = TableMetadata::empty(uuid::Uuid::new_v4(), location.to_string(), 1);
    let bytes = JsonCodec.serialize_table(&metadata).unwrap();
    let metadata_location = format!("{location}/metadata/00000-seed.metadata.json");
    env.object_io
        .write_object(&metadata_location, &bytes)
        .block_on()
        .unwrap();

    env.repo
        .versions
        .commit(CommitRequest {
            branch: "main".into(),
            expected_head: None,
            message: "seed".to_string(),
            author: test_signature(),
            operations: vec![CommitOperationRequest {
                key: content_key(key),
                operation: RequestedOperation::Put(icevault_lib::content::ContentValue {
                    id: icevault_lib::content::ContentId::random(),
                    content: Content::IcebergTable(icevault_lib::content::IcebergTable {
                        metadata_location,
                        // Matches the empty metadata's absent current
                        // snapshot, so the derived ids line up.
                        snapshot_id: -1,
                        schema_id: 0,
                        spec_id: 0,
                        sort_order_id: 0,
                    }),
                }),
                requirement: None,
            }],
            metadata: BTreeMap::new(),
        })
        .block_on()
        .unwrap();
}

#[test]
fn test_snapshot_reads_are_deduplicated() {
    let env = TestCatalog::init();
    seed_unwarmed_table(&env, "db.raw", "mem://warehouse/db/raw");
    assert_eq!(env.object_io.read_count(), 0);

    for _ in 0..3 {
        env.catalog
            .retrieve_snapshot(
                &RefSpec::name("main"),
                &content_key("db.raw"),
                SnapshotFormat::Native,
            )
            .block_on()
            .unwrap();
    }
    // The metadata file was read exactly once; later calls hit the cache.
    assert_eq!(env.object_io.read_count(), 1);
}

#[test]
fn test_snapshot_cache_persists_across_service_instances() {
    let env = TestCatalog::init();
    seed_unwarmed_table(&env, "db.raw", "mem://warehouse/db/raw");

    env.catalog
        .retrieve_snapshot(
            &RefSpec::name("main"),
            &content_key("db.raw"),
            SnapshotFormat::Native,
        )
        .block_on()
        .unwrap();
    assert_eq!(env.object_io.read_count(), 1);

    // A second service over the same backend finds the persisted snapshot
    // and never touches the metadata file.
    let second = CatalogService::new(
        env.repo.versions.clone(),
        env.object_io.clone(),
        Arc::new(JsonCodec),
        env.repo.clock.clone(),
        CatalogConfig {
            warehouse_root: TestCatalog::WAREHOUSE.to_string(),
        },
        TaskCacheConfig::default(),
    );
    second
        .retrieve_snapshot(
            &RefSpec::name("main"),
            &content_key("db.raw"),
            SnapshotFormat::Native,
        )
        .block_on()
        .unwrap();
    assert_eq!(env.object_io.read_count(), 1);
}

#[test]
fn test_successive_catalog_writers_serialize() {
    let env = TestCatalog::init();
    catalog_commit(&env, vec![create_table_op("db.t1", &[(1, "id")])]);

    let op = |value: &str| CatalogOperation {
        key: content_key("db.t1"),
        requirements: vec![],
        updates: vec![IcebergUpdate::SetProperties {
            updates: BTreeMap::from([("owner".to_string(), value.to_string())]),
        }],
    };
    catalog_commit(&env, vec![op("alice")]);
    let second = catalog_commit(&env, vec![op("bob")]);
    assert!(second.committed);

    let native = env
        .catalog
        .retrieve_snapshot(
            &RefSpec::name("main"),
            &content_key("db.t1"),
            SnapshotFormat::Native,
        )
        .block_on()
        .unwrap();
    let SnapshotResponse::Native { snapshot, .. } = native else {
        panic!("expected native format");
    };
    let EntitySnapshot::Table(table) = snapshot else {
        panic!("expected table snapshot");
    };
    assert_eq!(table.properties["owner"], "bob");
}
