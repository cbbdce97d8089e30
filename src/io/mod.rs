//! Low-level buffer plumbing shared by the merge engine: block-compressed
//! temporary streams and checksum-hashing wrappers.

pub(crate) mod compressed;
pub(crate) mod hashing;

pub use compressed::{copy_all, CompressedReader, CompressedWriter};
pub use hashing::{file_checksum, FileChecksum, HashReader, HashWriter};
