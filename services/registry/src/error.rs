//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::format::FormatField;
use crate::image::{ImageId, ImageStatus};
use crate::metadata::MetadataError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
///
/// Validation errors are raised before anything is mutated. Ingestion errors
/// ([`RegistryError::ChecksumMismatch`] and [`RegistryError::UploadFailed`])
/// leave the image behind in the `killed` state.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No image with this id, or the image was deleted
    #[error("image not found: {0}")]
    NotFound(ImageId),

    /// A format value outside the allowed set
    #[error("Invalid {field} format '{value}'")]
    InvalidFormat {
        /// Which format was rejected
        field: FormatField,
        /// The rejected value
        value: String,
    },

    /// A disk and container format which may not be combined
    #[error(
        "Invalid mix of disk and container formats: disk format '{disk_format}' with container format '{container_format}'. \
         When either format is 'aki', 'ari' or 'ami', the disk and container formats must match."
    )]
    IncompatibleFormats {
        /// The disk format
        disk_format: String,
        /// The container format
        container_format: String,
    },

    /// A status value that is not a known image status
    #[error("Invalid image status '{0}'")]
    InvalidImageStatus(String),

    /// A status change that the image lifecycle does not permit
    #[error("Invalid image status transition from '{from}' to '{to}'")]
    InvalidStatusTransition {
        /// Current status
        from: ImageStatus,
        /// Requested status
        to: ImageStatus,
    },

    /// Uploaded content did not hash to the expected checksum
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum supplied by the client
        expected: String,
        /// Checksum computed over the received bytes
        actual: String,
    },

    /// The upload stream or the storage backend failed mid-upload
    #[error("upload of image {id} failed: {source}")]
    UploadFailed {
        /// The image being uploaded
        id: ImageId,
        /// The underlying failure
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The request conflicts with the image's current state
    #[error("conflict: {0}")]
    Conflict(String),

    /// A request field could not be understood
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request named a store other than the configured backend
    #[error("unknown store '{0}'")]
    UnknownStore(String),

    /// Storage error outside of an upload
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Metadata store failure
    #[error("metadata error: {0}")]
    Metadata(#[source] MetadataError),
}

impl From<MetadataError> for RegistryError {
    fn from(error: MetadataError) -> Self {
        match error {
            MetadataError::NotFound(id) => RegistryError::NotFound(id),
            error => RegistryError::Metadata(error),
        }
    }
}

impl RegistryError {
    pub(crate) fn upload_failed<E>(id: ImageId, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        RegistryError::UploadFailed {
            id,
            source: source.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidFormat { .. }
            | RegistryError::IncompatibleFormats { .. }
            | RegistryError::InvalidImageStatus(_)
            | RegistryError::InvalidStatusTransition { .. }
            | RegistryError::ChecksumMismatch { .. }
            | RegistryError::InvalidRequest(_)
            | RegistryError::UnknownStore(_) => StatusCode::BAD_REQUEST,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::UploadFailed { .. }
            | RegistryError::Storage(_)
            | RegistryError::Metadata(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the stable error code for error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "IMAGE_UNKNOWN",
            RegistryError::InvalidFormat { .. } => "FORMAT_INVALID",
            RegistryError::IncompatibleFormats { .. } => "FORMAT_MISMATCH",
            RegistryError::InvalidImageStatus(_) => "STATUS_INVALID",
            RegistryError::InvalidStatusTransition { .. } => "STATUS_TRANSITION_INVALID",
            RegistryError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            RegistryError::UploadFailed { .. } => "UPLOAD_FAILED",
            RegistryError::Conflict(_) => "CONFLICT",
            RegistryError::InvalidRequest(_) => "REQUEST_INVALID",
            RegistryError::UnknownStore(_) => "STORE_UNKNOWN",
            RegistryError::Storage(_) | RegistryError::Metadata(_) => "UNKNOWN",
        }
    }
}

/// Error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let code = self.error_code();
        let message = self.to_string();

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_rejected_value() {
        let error = RegistryError::InvalidFormat {
            field: FormatField::Container,
            value: "invalid".into(),
        };
        assert_eq!(error.to_string(), "Invalid container format 'invalid'");
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);

        let error = RegistryError::IncompatibleFormats {
            disk_format: "ari".into(),
            container_format: "aki".into(),
        };
        assert!(error.to_string().starts_with("Invalid mix of disk and container formats"));
    }

    #[test]
    fn metadata_not_found_becomes_not_found() {
        let error: RegistryError = MetadataError::NotFound(ImageId::new(42)).into();
        assert!(matches!(error, RegistryError::NotFound(id) if id == ImageId::new(42)));
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
    }
}
