//! # Disk Image Registry
//!
//! Tracks virtual machine disk image metadata and streams image content into
//! a pluggable storage backend, verifying a checksum on the way in.
//!
//! ## Features
//!
//! - Disk and container format validation
//! - A closed image lifecycle (`queued`, `saving`, `active`, `killed`,
//!   `pending_delete`, `deleted`) with a central transition table
//! - Bounded memory streaming uploads with incremental MD5 checksums
//! - Pluggable storage backend via the `storage` crate
//! - Pluggable metadata store via [`MetadataStore`]
//! - Builder pattern for configuration
//!
//! ## Example
//!
//! ```no_run
//! use image_registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RegistryBuilder::new()
//!     .storage(MemoryStorage::new().into())
//!     .delayed_delete(true)
//!     .build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
pub mod checksum;
mod config;
mod error;
pub mod format;
pub mod image;
pub mod images;
pub mod metadata;
mod registry;
pub mod upload;

pub use api::{RegistryBuilder, router};
pub use config::RegistryConfig;
pub use error::{RegistryError, RegistryResult};
pub use image::{Image, ImageId, ImageStatus, ImageSummary, ImageUpdate, NewImage};
pub use metadata::{ImageFilter, MemoryMetadataStore, MetadataError, MetadataStore};
pub use registry::Registry;
