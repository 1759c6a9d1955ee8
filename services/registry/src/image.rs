//! Image records and the image status lifecycle

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RegistryError, RegistryResult};
use crate::format::{ContainerFormat, DiskFormat};

/// Identifier of an image, assigned by the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(u64);

impl ImageId {
    /// Wrap a raw identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ImageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ImageId)
    }
}

/// Lifecycle state of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Metadata registered, no content yet
    Queued,
    /// Content is being uploaded
    Saving,
    /// Content uploaded and verified
    Active,
    /// Upload failed; the record is kept for inspection
    Killed,
    /// Deleted, backend cleanup deferred
    PendingDelete,
    /// Deleted
    Deleted,
}

impl ImageStatus {
    /// The wire name of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Queued => "queued",
            ImageStatus::Saving => "saving",
            ImageStatus::Active => "active",
            ImageStatus::Killed => "killed",
            ImageStatus::PendingDelete => "pending_delete",
            ImageStatus::Deleted => "deleted",
        }
    }

    /// The status an image is created in.
    pub fn initial(has_content: bool) -> Self {
        if has_content {
            ImageStatus::Saving
        } else {
            ImageStatus::Queued
        }
    }

    /// Whether the lifecycle permits moving from this status to `to`.
    ///
    /// `saving -> saving` is permitted so that an upload may resume a record
    /// which is already marked as saving.
    pub fn can_transition_to(&self, to: ImageStatus) -> bool {
        use ImageStatus::*;

        matches!(
            (self, to),
            (Queued, Saving)
                | (Queued, Deleted)
                | (Saving, Saving)
                | (Saving, Active)
                | (Saving, Killed)
                | (Active, PendingDelete)
                | (Active, Deleted)
                | (PendingDelete, Deleted)
                | (Killed, Deleted)
        )
    }

    /// Validate a transition, returning the new status.
    pub fn transition(self, to: ImageStatus) -> RegistryResult<ImageStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(RegistryError::InvalidStatusTransition { from: self, to })
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => ImageStatus::Queued,
            "saving" => ImageStatus::Saving,
            "active" => ImageStatus::Active,
            "killed" => ImageStatus::Killed,
            "pending_delete" => ImageStatus::PendingDelete,
            "deleted" => ImageStatus::Deleted,
            _ => return Err(RegistryError::InvalidImageStatus(s.to_owned())),
        })
    }
}

/// Free-form string properties attached to an image.
pub type Properties = HashMap<String, String>;

/// An image record.
///
/// `status`, `checksum`, `size` and `location` are only written by the
/// registry. The record upholds:
///
/// - `checksum` is set only while `status` is `active`.
/// - `location` is set only while `status` is `saving`, `active` or `killed`.
/// - `disk_format` and `container_format` are a compatible pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Assigned by the metadata store
    pub id: ImageId,
    /// Display name
    pub name: Option<String>,
    /// Visible to every tenant
    pub is_public: bool,
    /// Encoding of the disk image bytes
    pub disk_format: Option<DiskFormat>,
    /// Packaging around the disk image
    pub container_format: Option<ContainerFormat>,
    /// Content length in bytes, zero until an upload completes
    pub size: u64,
    /// Hex MD5 digest of the content
    pub checksum: Option<String>,
    /// Lifecycle state
    pub status: ImageStatus,
    /// Where the storage backend keeps the content
    pub location: Option<Url>,
    /// Free-form properties
    pub properties: Properties,
    /// Owning tenant
    pub owner: Option<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record last changed
    pub updated_at: DateTime<Utc>,
    /// When the record was soft-deleted
    pub deleted_at: Option<DateTime<Utc>>,
    /// Whether the record is soft-deleted
    pub deleted: bool,
}

impl Image {
    /// Move to `to`, if the lifecycle permits it.
    pub fn transition(&mut self, to: ImageStatus) -> RegistryResult<()> {
        self.status = self.status.transition(to)?;
        self.touch();
        Ok(())
    }

    /// Mark the record as modified now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the image has verified content that can be served.
    pub fn has_content(&self) -> bool {
        self.status == ImageStatus::Active && self.location.is_some()
    }

    /// The reduced field set used in listings.
    pub fn summary(&self) -> ImageSummary {
        ImageSummary {
            id: self.id,
            name: self.name.clone(),
            size: self.size,
            checksum: self.checksum.clone(),
            disk_format: self.disk_format,
            container_format: self.container_format,
            status: self.status,
            is_public: self.is_public,
        }
    }
}

/// The stable reduced view of an image. Fields mirror [`Image`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ImageSummary {
    pub id: ImageId,
    pub name: Option<String>,
    pub size: u64,
    pub checksum: Option<String>,
    pub disk_format: Option<DiskFormat>,
    pub container_format: Option<ContainerFormat>,
    pub status: ImageStatus,
    pub is_public: bool,
}

/// Metadata supplied by a client registering a new image.
///
/// Formats and status arrive as the client sent them and are validated by
/// the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct NewImage {
    pub name: Option<String>,
    pub is_public: bool,
    pub disk_format: Option<String>,
    pub container_format: Option<String>,
    pub status: Option<String>,
    pub owner: Option<String>,
    pub properties: Properties,
    /// Checksum the uploaded content must hash to, if any.
    pub checksum: Option<String>,
}

/// A partial change to an existing image. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ImageUpdate {
    pub name: Option<String>,
    pub is_public: Option<bool>,
    pub disk_format: Option<String>,
    pub container_format: Option<String>,
    pub status: Option<String>,
    pub owner: Option<String>,
    pub properties: Properties,
    /// Replace the existing properties instead of merging into them.
    pub purge_properties: bool,
    /// Checksum an accompanying upload must hash to, if any.
    pub checksum: Option<String>,
}

impl ImageUpdate {
    /// Whether the update carries no field changes.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.is_public.is_none()
            && self.disk_format.is_none()
            && self.container_format.is_none()
            && self.status.is_none()
            && self.owner.is_none()
            && self.properties.is_empty()
            && !self.purge_properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ImageStatus::*;

    const ALL: [ImageStatus; 6] = [Queued, Saving, Active, Killed, PendingDelete, Deleted];

    #[test]
    fn legal_transitions() {
        let legal = [
            (Queued, Saving),
            (Queued, Deleted),
            (Saving, Saving),
            (Saving, Active),
            (Saving, Killed),
            (Active, PendingDelete),
            (Active, Deleted),
            (PendingDelete, Deleted),
            (Killed, Deleted),
        ];

        for from in ALL {
            for to in ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
                match from.transition(to) {
                    Ok(status) => assert_eq!(status, to),
                    Err(RegistryError::InvalidStatusTransition { from: f, to: t }) => {
                        assert!(!expected);
                        assert_eq!((f, t), (from, to));
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
        }
    }

    #[test]
    fn deleted_is_terminal() {
        for to in ALL {
            assert!(!Deleted.can_transition_to(to));
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(matches!(
            "bad status".parse::<ImageStatus>(),
            Err(RegistryError::InvalidImageStatus(s)) if s == "bad status"
        ));
        for status in ALL {
            assert_eq!(status.as_str().parse::<ImageStatus>().unwrap(), status);
        }
    }

    #[test]
    fn initial_status_depends_on_content() {
        assert_eq!(ImageStatus::initial(false), Queued);
        assert_eq!(ImageStatus::initial(true), Saving);
    }

    #[test]
    fn status_serializes_as_wire_name() {
        assert_eq!(
            serde_json::to_string(&PendingDelete).unwrap(),
            "\"pending_delete\""
        );
    }
}
