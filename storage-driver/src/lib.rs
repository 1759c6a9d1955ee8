//! # Storage driver interface
//!
//! The contract every image byte store implements. Drivers hand out
//! [`Writer`] handles addressed by image identifier, serve stored bytes back
//! as a [`ByteStream`], and delete them by location.

mod driver;
mod error;

pub use driver::ByteStream;
pub use driver::ChunkStream;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Writer;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
