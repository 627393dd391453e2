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

//! Error kinds surfaced to callers, and the boundary error shape.

use thiserror::Error;

use crate::backend::BackendError;
use crate::commit::CommitId;
use crate::content_key::ContentKey;
use crate::refs::RefNameBuf;

/// Stable error codes carried across the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    ReferenceConflict,
    ContentConflict,
    AlreadyExists,
    InvalidArgument,
    Unavailable,
    Internal,
    DeadlineExceeded,
}

impl ErrorCode {
    /// The HTTP status an API layer should map this code to.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::ReferenceConflict | Self::ContentConflict | Self::AlreadyExists => 409,
            Self::InvalidArgument => 400,
            Self::Unavailable => 503,
            Self::Internal => 500,
            Self::DeadlineExceeded => 504,
        }
    }
}

/// The way a single key failed a commit or merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// The key's payload differs from what the caller or merge base
    /// expected.
    PayloadDiffers,
    /// A key required to be absent exists.
    KeyExists,
    /// A key required to exist is absent.
    KeyDoesNotExist,
}

/// A per-key conflict. Conflicts are always aggregated, never surfaced one
/// at a time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Conflict {
    pub key: ContentKey,
    pub kind: ConflictKind,
    pub message: String,
}

/// Error shape on the external boundary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub error_code: ErrorCode,
    pub reason: String,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<Conflict>>,
}

/// Error of the versioned-storage engine.
#[derive(Debug, Error)]
pub enum VersionStoreError {
    #[error("Reference {name} not found")]
    RefNotFound { name: RefNameBuf },
    #[error("Commit {id} not found")]
    CommitNotFound { id: CommitId },
    #[error("Key {key} not found")]
    KeyNotFound { key: ContentKey },
    #[error("Reference {name}: {message}")]
    ReferenceConflict { name: RefNameBuf, message: String },
    #[error("{} conflicting key(s)", conflicts.len())]
    ContentConflict { conflicts: Vec<Conflict> },
    #[error("Reference {name} already exists")]
    RefAlreadyExists { name: RefNameBuf },
    #[error("{message}")]
    InvalidArgument { message: String },
    #[error("Backend temporarily unavailable")]
    Unavailable {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Internal error")]
    Internal {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

impl VersionStoreError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            source: message.into().into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RefNotFound { .. } | Self::CommitNotFound { .. } | Self::KeyNotFound { .. } => {
                ErrorCode::NotFound
            }
            Self::ReferenceConflict { .. } => ErrorCode::ReferenceConflict,
            Self::ContentConflict { .. } => ErrorCode::ContentConflict,
            Self::RefAlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Unavailable { .. } => ErrorCode::Unavailable,
            Self::Internal { .. } => ErrorCode::Internal,
            Self::DeadlineExceeded => ErrorCode::DeadlineExceeded,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::RefNotFound { .. } => "Reference not found",
            Self::CommitNotFound { .. } => "Commit not found",
            Self::KeyNotFound { .. } => "Key not found",
            Self::ReferenceConflict { .. } => "Reference conflict",
            Self::ContentConflict { .. } => "Content conflict",
            Self::RefAlreadyExists { .. } => "Reference already exists",
            Self::InvalidArgument { .. } => "Invalid argument",
            Self::Unavailable { .. } => "Backend unavailable",
            Self::Internal { .. } => "Internal error",
            Self::DeadlineExceeded => "Deadline exceeded",
        }
    }

    /// Converts to the boundary shape.
    pub fn to_error_info(&self) -> ErrorInfo {
        let code = self.code();
        let conflicts = match self {
            Self::ContentConflict { conflicts } => Some(conflicts.clone()),
            _ => None,
        };
        ErrorInfo {
            error_code: code,
            reason: self.reason().to_string(),
            status: code.status(),
            message: self.to_string(),
            conflicts,
        }
    }
}

impl From<BackendError> for VersionStoreError {
    /// Fallback conversion for backend failures that reach the service
    /// layer without a more specific meaning. `NotFound`, `AlreadyExists`,
    /// and `CasMismatch` are translated at the call sites that know which
    /// entity they concern; reaching this conversion means an invariant
    /// broke.
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable { source } => Self::Unavailable { source },
            err => Self::Internal {
                source: Box::new(err),
            },
        }
    }
}

/// Error of the catalog layer, wrapping the engine's errors with the
/// Iceberg-pipeline failure modes.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Version(#[from] VersionStoreError),
    #[error("Requirement violated: {message}")]
    RequirementViolated { message: String },
    #[error("Update rejected: {message}")]
    UpdateRejected { message: String },
    #[error("Metadata emission failed")]
    MetadataEmissionFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Not a table: {key}")]
    NotASnapshot { key: ContentKey },
    #[error("Snapshot worker queue is full")]
    Busy,
    #[error("Internal error")]
    Internal {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl CatalogError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Version(err) => err.code(),
            Self::RequirementViolated { .. } => ErrorCode::ReferenceConflict,
            Self::UpdateRejected { .. } => ErrorCode::InvalidArgument,
            Self::MetadataEmissionFailed { .. } | Self::Internal { .. } => ErrorCode::Internal,
            Self::NotASnapshot { .. } => ErrorCode::NotFound,
            Self::Busy => ErrorCode::Unavailable,
        }
    }

    /// Converts to the boundary shape.
    pub fn to_error_info(&self) -> ErrorInfo {
        if let Self::Version(err) = self {
            return err.to_error_info();
        }
        let code = self.code();
        let reason = match self {
            Self::Version(_) => unreachable!("handled above"),
            Self::RequirementViolated { .. } => "Requirement violated",
            Self::UpdateRejected { .. } => "Update rejected",
            Self::MetadataEmissionFailed { .. } => "Metadata emission failed",
            Self::NotASnapshot { .. } => "Not a table",
            Self::Busy => "Busy",
            Self::Internal { .. } => "Internal error",
        };
        ErrorInfo {
            error_code: code,
            reason: reason.to_string(),
            status: code.status(),
            message: self.to_string(),
            conflicts: None,
        }
    }
}

impl From<crate::catalog::update::UpdateError> for CatalogError {
    fn from(err: crate::catalog::update::UpdateError) -> Self {
        use crate::catalog::update::UpdateError;
        match err {
            UpdateError::RequirementViolated { message } => Self::RequirementViolated { message },
            UpdateError::UpdateRejected { message } => Self::UpdateRejected { message },
            err @ UpdateError::IllegalState { .. } => Self::Internal {
                source: Box::new(err),
            },
        }
    }
}

impl From<crate::iceberg::codec::CodecError> for CatalogError {
    fn from(err: crate::iceberg::codec::CodecError) -> Self {
        Self::Internal {
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_shape() {
        let err = VersionStoreError::ContentConflict {
            conflicts: vec![Conflict {
                key: ContentKey::parse_dotted("db.t1").unwrap(),
                kind: ConflictKind::PayloadDiffers,
                message: "values differ".to_string(),
            }],
        };
        let info = err.to_error_info();
        assert_eq!(info.error_code, ErrorCode::ContentConflict);
        assert_eq!(info.status, 409);
        assert_eq!(info.conflicts.as_ref().unwrap().len(), 1);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["errorCode"], "CONTENT_CONFLICT");
        assert_eq!(json["conflicts"][0]["kind"], "payload-differs");
    }

    #[test]
    fn test_backend_error_fallback() {
        let err: VersionStoreError = BackendError::Unavailable {
            source: "down".into(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        let err: VersionStoreError = BackendError::Fatal {
            source: "bug".into(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
