//! Archive transport between local paths and a keyed blob store.
//!
//! A file or a directory tree is packed into one `tar.gz` blob and stored
//! under a hierarchical key. Single files carry an extra zero-byte sentinel
//! entry so that `download` knows to restore them as an exact file path rather
//! than as a directory root.
//!
//! Modules:
//! - `archive`: blocking pack/unpack of the blob format
//! - `keys`: key layout and the closed set of transfer kinds
//! - `store`: blob store backends (S3, local directory)
//! - `transfer`: async upload/download with scoped temp artifacts

pub mod archive;
pub mod error;
pub mod keys;
pub mod store;
pub mod transfer;

pub use archive::ArchiveForm;
pub use error::{Result, TransferError};
pub use keys::{ARCHIVE_EXTENSION, ArchiveKey, TransferKind};
pub use store::{BlobStore, localfs::LocalFsBlobStore, s3::S3BlobStore, s3::S3Config};
pub use transfer::{ArchiveTransfer, ExecutionStore};
