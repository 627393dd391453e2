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

//! The catalog layer: Iceberg-aware commits and snapshot retrieval on top
//! of the versioned storage engine.
//!
//! A catalog commit runs each operation through the snapshot-update state
//! machine, emits the new metadata file through [`ObjectIO`], and lands all
//! resulting content Puts in one engine commit. Conflict protection per key
//! comes from head-matching requirements, so a concurrent change to any
//! touched table turns into a content conflict rather than a lost update.

pub mod snapshot;
pub mod update;

use std::collections::BTreeMap;
use std::sync::Arc;

use pollster::FutureExt as _;
use uuid::Uuid;

use crate::backend::Bucket;
use crate::clock::Clock;
use crate::commit::CommitId;
use crate::commit::Signature;
use crate::content::Content;
use crate::content::ContentId;
use crate::content::ContentValue;
use crate::content::IcebergTable;
use crate::content::IcebergView;
use crate::content_key::ContentKey;
use crate::error::CatalogError;
use crate::error::VersionStoreError;
use crate::iceberg::codec::IcebergCodec;
use crate::iceberg::metadata::MetadataLogEntry;
use crate::object_id::ObjectId as _;
use crate::object_io::ObjectIO;
use crate::refs::RefNameBuf;
use crate::store::Store;
use crate::task_cache::TaskCache;
use crate::task_cache::TaskCacheConfig;
use crate::task_cache::TaskError;
use crate::task_cache::TaskPersister;
use crate::version_store::CommitOperationRequest;
use crate::version_store::CommitRequest;
use crate::version_store::RefSpec;
use crate::version_store::RequestedOperation;
use crate::version_store::Requirement;
use crate::version_store::VersionStore;
use self::snapshot::EntitySnapshot;
use self::snapshot::build_table_snapshot;
use self::snapshot::build_view_snapshot;
use self::snapshot::snapshot_id_for_content;
use self::update::DraftMetadata;
use self::update::IcebergRequirement;
use self::update::IcebergUpdate;
use self::update::SnapshotUpdateMachine;

/// Pass-through properties embedded in every retrieved snapshot.
pub const PROP_CONTENT_ID: &str = "icevault.catalog.content-id";
pub const PROP_SNAPSHOT_ID: &str = "icevault.catalog.snapshot-id";
pub const PROP_COMMIT_ID: &str = "icevault.commit.id";
pub const PROP_COMMIT_REF: &str = "icevault.commit.ref";

/// Catalog configuration injected at construction.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Root URI all table and view metadata must live under.
    pub warehouse_root: String,
}

/// Output format of a snapshot retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// The native projection plus the effective reference.
    Native,
    /// The Iceberg metadata document form.
    Iceberg,
}

/// A retrieved snapshot in the requested format.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotResponse {
    Native {
        snapshot: EntitySnapshot,
        effective_ref: String,
        commit_id: CommitId,
    },
    Iceberg {
        metadata: serde_json::Value,
    },
}

/// One table or view mutation inside a catalog commit.
#[derive(Debug, Clone)]
pub struct CatalogOperation {
    pub key: ContentKey,
    pub requirements: Vec<IcebergRequirement>,
    pub updates: Vec<IcebergUpdate>,
}

/// Result of a catalog commit.
#[derive(Debug, Clone)]
pub struct CatalogCommit {
    /// The head after the commit; unchanged if every operation was a no-op.
    pub commit_id: CommitId,
    /// Whether a commit was actually written.
    pub committed: bool,
    /// The derived snapshot per operation, in request order.
    pub snapshots: Vec<(ContentKey, EntitySnapshot)>,
}

// Snapshot cache entries live next to content payloads; the prefix keeps
// the two keyspaces apart.
const SNAPSHOT_CACHE_PREFIX: &[u8] = b"snapshot/";

#[derive(Debug)]
struct SnapshotCachePersister {
    store: Arc<Store>,
}

impl SnapshotCachePersister {
    fn cache_key(key: &snapshot::SnapshotId) -> Vec<u8> {
        let mut bytes = SNAPSHOT_CACHE_PREFIX.to_vec();
        bytes.extend_from_slice(key.as_bytes());
        bytes
    }
}

impl TaskPersister<EntitySnapshot> for SnapshotCachePersister {
    fn load(&self, key: &snapshot::SnapshotId) -> Option<EntitySnapshot> {
        let bytes = self
            .store
            .backend()
            .get(Bucket::Attachments, &Self::cache_key(key))
            .block_on()
            .ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                // A corrupt cache entry falls back to recomputation.
                tracing::warn!(%key, %err, "discarding unreadable snapshot cache entry");
                None
            }
        }
    }

    fn store(&self, key: &snapshot::SnapshotId, value: &EntitySnapshot) {
        let Ok(bytes) = serde_json::to_vec(value) else {
            return;
        };
        if let Err(err) = self
            .store
            .backend()
            .put(Bucket::Attachments, &Self::cache_key(key), &bytes)
            .block_on()
        {
            tracing::debug!(%key, %err, "snapshot cache persistence failed");
        }
    }
}

/// Iceberg-aware catalog service.
#[derive(Debug)]
pub struct CatalogService {
    versions: Arc<VersionStore>,
    object_io: Arc<dyn ObjectIO>,
    codec: Arc<dyn IcebergCodec>,
    tasks: Arc<TaskCache<EntitySnapshot>>,
    persister: Arc<SnapshotCachePersister>,
    config: CatalogConfig,
    clock: Arc<dyn Clock>,
}

impl CatalogService {
    pub fn new(
        versions: Arc<VersionStore>,
        object_io: Arc<dyn ObjectIO>,
        codec: Arc<dyn IcebergCodec>,
        clock: Arc<dyn Clock>,
        config: CatalogConfig,
        task_config: TaskCacheConfig,
    ) -> Self {
        let persister = Arc::new(SnapshotCachePersister {
            store: versions.store().clone(),
        });
        let tasks = TaskCache::new(clock.clone(), task_config, Some(persister.clone()));
        Self {
            versions,
            object_io,
            codec,
            tasks,
            persister,
            config,
            clock,
        }
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    fn validate_location(&self, uri: &str) -> Result<(), CatalogError> {
        if !self.object_io.is_valid_uri(uri) {
            return Err(CatalogError::UpdateRejected {
                message: format!("location {uri} is not a valid object URI"),
            });
        }
        let mut root = self.config.warehouse_root.trim_end_matches('/').to_string();
        root.push('/');
        if !uri.starts_with(&root) {
            return Err(CatalogError::UpdateRejected {
                message: format!(
                    "location {uri} is outside the warehouse {}",
                    self.config.warehouse_root
                ),
            });
        }
        Ok(())
    }

    fn default_location(&self, key: &ContentKey) -> String {
        format!(
            "{}/{}",
            self.config.warehouse_root.trim_end_matches('/'),
            key.elements().join("/")
        )
    }

    async fn load_draft(&self, content: &Content) -> Result<DraftMetadata, CatalogError> {
        match content {
            Content::IcebergTable(table) => {
                let bytes = self
                    .object_io
                    .read_object(&table.metadata_location)
                    .await
                    .map_err(|err| CatalogError::Internal {
                        source: Box::new(err),
                    })?;
                Ok(DraftMetadata::Table(self.codec.deserialize_table(&bytes)?))
            }
            Content::IcebergView(view) => {
                let bytes = self
                    .object_io
                    .read_object(&view.metadata_location)
                    .await
                    .map_err(|err| CatalogError::Internal {
                        source: Box::new(err),
                    })?;
                Ok(DraftMetadata::View(self.codec.deserialize_view(&bytes)?))
            }
            other => Err(CatalogError::UpdateRejected {
                message: format!("content of type {} has no metadata", other.content_type()),
            }),
        }
    }

    /// Runs a multi-table catalog commit: every operation through the
    /// snapshot-update state machine, one engine commit for all resulting
    /// Puts. Operations whose update list changes nothing are dropped from
    /// the commit; if all of them are, no commit is written at all.
    pub async fn commit(
        &self,
        branch: RefNameBuf,
        operations: Vec<CatalogOperation>,
        author: Signature,
        message: String,
    ) -> Result<CatalogCommit, CatalogError> {
        if operations.is_empty() {
            return Err(VersionStoreError::invalid_argument("no catalog operations").into());
        }
        let keys: Vec<ContentKey> = operations.iter().map(|op| op.key.clone()).collect();
        let (head, current_values) = self
            .versions
            .get_values(&RefSpec::Name(branch.clone()), &keys)
            .await?;
        let now_ms = self.clock.now().timestamp.0;

        let mut commit_operations = vec![];
        let mut snapshots = vec![];
        for (op, current) in std::iter::zip(&operations, current_values) {
            let prior = match &current {
                Some(index_value) => {
                    let value = self.versions.store().get_content(&index_value.payload).await
                        .map_err(VersionStoreError::from)?;
                    let draft = self.load_draft(&value.content).await?;
                    Some((value, draft))
                }
                None => None,
            };

            for update in &op.updates {
                if let IcebergUpdate::SetLocation { location } = update {
                    self.validate_location(location)?;
                }
            }

            let mut machine = match &prior {
                Some((_, DraftMetadata::Table(table))) => {
                    SnapshotUpdateMachine::for_table(Some(table.clone()), String::new(), now_ms)
                }
                Some((_, DraftMetadata::View(view))) => {
                    SnapshotUpdateMachine::for_view(Some(view.clone()), String::new(), now_ms)
                }
                None if is_view_creation(&op.updates) => {
                    SnapshotUpdateMachine::for_view(None, self.default_location(&op.key), now_ms)
                }
                None => {
                    SnapshotUpdateMachine::for_table(None, self.default_location(&op.key), now_ms)
                }
            };
            machine.check_requirements(&op.requirements)?;
            machine.apply_updates(&op.updates)?;

            if machine.is_noop() {
                // Design intent: an update list with no effective change
                // must not produce a commit.
                let (value, draft) = prior.expect("a no-op implies prior metadata");
                snapshots.push((op.key.clone(), self.project(&value, &draft)));
                continue;
            }

            let draft = machine.finalize()?;
            self.validate_location(draft.location())?;
            let prior_value = prior.as_ref().map(|(value, _)| value);
            let (content, entity_snapshot) = self
                .emit_metadata(draft, prior_value, now_ms)
                .await?;
            let content_id = entity_snapshot.content_id();
            let requirement = match &current {
                Some(index_value) => Requirement::HeadMatches(index_value.payload.clone()),
                None => Requirement::MustNotExist,
            };
            commit_operations.push(CommitOperationRequest {
                key: op.key.clone(),
                operation: RequestedOperation::Put(ContentValue {
                    id: *content_id,
                    content,
                }),
                requirement: Some(requirement),
            });
            snapshots.push((op.key.clone(), entity_snapshot));
        }

        if commit_operations.is_empty() {
            tracing::debug!(branch = %branch, "catalog commit was a no-op");
            return Ok(CatalogCommit {
                commit_id: head,
                committed: false,
                snapshots,
            });
        }

        let result = self
            .versions
            .commit(CommitRequest {
                branch,
                expected_head: None,
                message,
                author,
                operations: commit_operations,
                metadata: BTreeMap::new(),
            })
            .await?;

        // Warm the snapshot cache; purely best-effort.
        for (_, entity_snapshot) in &snapshots {
            self.persister.store(entity_snapshot.id(), entity_snapshot);
        }
        Ok(CatalogCommit {
            commit_id: result.commit_id,
            committed: true,
            snapshots,
        })
    }

    // Serializes the draft, writes the metadata file, and builds the new
    // content blob plus its derived snapshot.
    async fn emit_metadata(
        &self,
        draft: DraftMetadata,
        prior: Option<&ContentValue>,
        now_ms: i64,
    ) -> Result<(Content, EntitySnapshot), CatalogError> {
        let content_id = prior.map_or_else(ContentId::random, |value| value.id);
        match draft {
            DraftMetadata::Table(mut table) => {
                table.last_updated_ms = now_ms;
                if let Some(ContentValue {
                    content: Content::IcebergTable(prior_table),
                    ..
                }) = prior
                {
                    table.metadata_log.push(MetadataLogEntry {
                        timestamp_ms: now_ms,
                        metadata_file: prior_table.metadata_location.clone(),
                    });
                }
                let path = format!(
                    "{}/metadata/{:05}-{}.metadata.json",
                    table.location,
                    table.metadata_log.len(),
                    Uuid::new_v4()
                );
                let bytes = self.codec.serialize_table(&table)?;
                self.object_io
                    .write_object(&path, &bytes)
                    .await
                    .map_err(|err| CatalogError::MetadataEmissionFailed {
                        source: Box::new(err),
                    })?;
                let content = Content::IcebergTable(IcebergTable {
                    metadata_location: path.clone(),
                    snapshot_id: table.current_snapshot_id.unwrap_or(-1),
                    schema_id: table.current_schema_id,
                    spec_id: table.default_spec_id,
                    sort_order_id: table.default_sort_order_id,
                });
                let entity = EntitySnapshot::Table(build_table_snapshot(content_id, &path, &table));
                Ok((content, entity))
            }
            DraftMetadata::View(view) => {
                let path = format!(
                    "{}/metadata/{:05}-{}.metadata.json",
                    view.location,
                    view.versions.len(),
                    Uuid::new_v4()
                );
                let bytes = self.codec.serialize_view(&view)?;
                self.object_io
                    .write_object(&path, &bytes)
                    .await
                    .map_err(|err| CatalogError::MetadataEmissionFailed {
                        source: Box::new(err),
                    })?;
                let schema_id = view
                    .version_by_id(view.current_version_id)
                    .map_or(-1, |version| version.schema_id);
                let content = Content::IcebergView(IcebergView {
                    metadata_location: path.clone(),
                    version_id: view.current_version_id,
                    schema_id,
                });
                let entity = EntitySnapshot::View(build_view_snapshot(content_id, &path, &view));
                Ok((content, entity))
            }
        }
    }

    fn project(&self, value: &ContentValue, draft: &DraftMetadata) -> EntitySnapshot {
        match (&value.content, draft) {
            (Content::IcebergTable(table), DraftMetadata::Table(metadata)) => {
                EntitySnapshot::Table(build_table_snapshot(
                    value.id,
                    &table.metadata_location,
                    metadata,
                ))
            }
            (Content::IcebergView(view), DraftMetadata::View(metadata)) => EntitySnapshot::View(
                build_view_snapshot(value.id, &view.metadata_location, metadata),
            ),
            _ => unreachable!("content and draft kinds always match"),
        }
    }

    /// Retrieves the derived snapshot for one key, materializing it through
    /// the task cache.
    pub async fn retrieve_snapshot(
        &self,
        spec: &RefSpec,
        key: &ContentKey,
        format: SnapshotFormat,
    ) -> Result<SnapshotResponse, CatalogError> {
        let (commit_id, value) = self.versions.get_content(spec, key).await?;
        let Some(snapshot_id) = snapshot_id_for_content(&value.content) else {
            return Err(CatalogError::NotASnapshot { key: key.clone() });
        };

        let object_io = self.object_io.clone();
        let codec = self.codec.clone();
        let content = value.content.clone();
        let content_id = value.id;
        let future = self
            .tasks
            .get_or_start(&snapshot_id, move || {
                materialize(&*object_io, &*codec, content_id, &content)
            })
            .map_err(|err| match err {
                TaskError::Busy => CatalogError::Busy,
                err => CatalogError::Internal {
                    source: Box::new(err),
                },
            })?;
        let entity = future.await.map_err(|err| CatalogError::Internal {
            source: Box::new(err),
        })?;

        let mut entity = (*entity).clone();
        let effective_ref = match spec {
            RefSpec::Name(name) => name.to_string(),
            RefSpec::Hash(id) => id.hex(),
        };
        let properties = entity.properties_mut();
        properties.insert(PROP_CONTENT_ID.to_string(), value.id.to_string());
        properties.insert(PROP_SNAPSHOT_ID.to_string(), snapshot_id.hex());
        properties.insert(PROP_COMMIT_ID.to_string(), commit_id.hex());
        properties.insert(PROP_COMMIT_REF.to_string(), effective_ref.clone());

        match format {
            SnapshotFormat::Native => Ok(SnapshotResponse::Native {
                snapshot: entity,
                effective_ref,
                commit_id,
            }),
            SnapshotFormat::Iceberg => Ok(SnapshotResponse::Iceberg {
                metadata: snapshot_to_iceberg_json(&entity)?,
            }),
        }
    }

    /// Retrieves snapshots for several keys against one resolved commit.
    /// Keys that are missing or carry non-snapshot content yield `None`.
    pub async fn retrieve_snapshots(
        &self,
        spec: &RefSpec,
        keys: &[ContentKey],
        format: SnapshotFormat,
    ) -> Result<(CommitId, Vec<Option<SnapshotResponse>>), CatalogError> {
        let (commit_id, _) = self.versions.get_values(spec, &[]).await?;
        let fixed = RefSpec::Hash(commit_id.clone());
        let mut responses = Vec::with_capacity(keys.len());
        for key in keys {
            match self.retrieve_snapshot(&fixed, key, format).await {
                Ok(response) => responses.push(Some(response)),
                Err(CatalogError::NotASnapshot { .. }) => responses.push(None),
                Err(CatalogError::Version(VersionStoreError::KeyNotFound { .. })) => {
                    responses.push(None);
                }
                Err(err) => return Err(err),
            }
        }
        Ok((commit_id, responses))
    }
}

fn is_view_creation(updates: &[IcebergUpdate]) -> bool {
    updates.iter().any(|update| {
        matches!(
            update,
            IcebergUpdate::AddViewVersion { .. } | IcebergUpdate::SetCurrentViewVersion { .. }
        )
    })
}

// Runs on a snapshot worker thread: reads and parses the metadata file the
// content blob points at.
fn materialize(
    object_io: &dyn ObjectIO,
    codec: &dyn IcebergCodec,
    content_id: ContentId,
    content: &Content,
) -> Result<EntitySnapshot, String> {
    match content {
        Content::IcebergTable(table) => {
            let bytes = object_io
                .read_object(&table.metadata_location)
                .block_on()
                .map_err(|err| err.to_string())?;
            let metadata = codec
                .deserialize_table(&bytes)
                .map_err(|err| err.to_string())?;
            Ok(EntitySnapshot::Table(build_table_snapshot(
                content_id,
                &table.metadata_location,
                &metadata,
            )))
        }
        Content::IcebergView(view) => {
            let bytes = object_io
                .read_object(&view.metadata_location)
                .block_on()
                .map_err(|err| err.to_string())?;
            let metadata = codec
                .deserialize_view(&bytes)
                .map_err(|err| err.to_string())?;
            Ok(EntitySnapshot::View(build_view_snapshot(
                content_id,
                &view.metadata_location,
                &metadata,
            )))
        }
        other => Err(format!(
            "content of type {} has no snapshot",
            other.content_type()
        )),
    }
}

// The Iceberg metadata form of a snapshot, rebuilt from the projection.
fn snapshot_to_iceberg_json(entity: &EntitySnapshot) -> Result<serde_json::Value, CatalogError> {
    match entity {
        EntitySnapshot::Table(table) => Ok(serde_json::json!({
            "format-version": crate::iceberg::metadata::TABLE_FORMAT_VERSION,
            "table-uuid": table.table_uuid,
            "location": table.iceberg_location,
            "metadata-location": table.metadata_location,
            "current-snapshot-id": table.current_snapshot_id,
            "current-schema-id": table.current_schema_id,
            "default-spec-id": table.default_spec_id,
            "default-sort-order-id": table.default_sort_order_id,
            "schemas": table.schemas,
            "partition-specs": table.partition_specs,
            "sort-orders": table.sort_orders,
            "properties": table.properties,
        })),
        EntitySnapshot::View(view) => Ok(serde_json::json!({
            "format-version": crate::iceberg::metadata::VIEW_FORMAT_VERSION,
            "view-uuid": view.view_uuid,
            "location": view.iceberg_location,
            "metadata-location": view.metadata_location,
            "current-version-id": view.current_version_id,
            "versions": view.versions,
            "schemas": view.schemas,
            "properties": view.properties,
        })),
    }
}
