//! The contract external adapters bind against.
//!
//! A pieces-storage layer (or any chunked-file consumer) talks to the
//! cache purely through these traits: per-blob handles satisfying
//! [`Resource`], produced by a [`ResourceProvider`], with
//! [`ConsecutiveChunkWriter`] as the bulk reassembly path.

use std::io::{Read, Write};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::instance::{BlobInfo, Instance};
use crate::provider::Provider;

/// File-like operations on one named blob.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Names under `location + "/"`, prefix stripped.
    fn readdir_names(&self) -> Result<Vec<String>, StorageError>;

    /// Open for streaming reads; counts as a content access.
    fn get(&self) -> Result<Box<dyn Read + Send>, StorageError>;

    /// Size without counting as an access.
    fn stat(&self) -> Result<BlobInfo, StorageError>;

    /// Positional read; short reads signal the end of the blob.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError>;

    /// Store the reader's contents, replacing any existing blob.
    async fn put(&self, reader: &mut (dyn Read + Send)) -> Result<(), StorageError>;

    /// Remove the blob.
    async fn delete(&self) -> Result<(), StorageError>;

    /// Positional write. Implementations may not support this; the
    /// sqlite-backed implementation panics.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, StorageError>;
}

/// Produces [`Resource`] handles keyed by location.
pub trait ResourceProvider {
    type Resource: Resource;

    /// Pair `location` with this provider. Never fails.
    fn new_instance(&self, location: &str) -> Self::Resource;
}

/// Reassembles a chunked file from blobs named `prefix + <integer>`.
pub trait ConsecutiveChunkWriter {
    /// Stream the chunks in ascending numeric-suffix order into `sink`,
    /// returning the bytes written.
    fn write_consecutive_chunks(
        &self,
        prefix: &str,
        sink: &mut dyn Write,
    ) -> Result<u64, StorageError>;
}

#[async_trait]
impl Resource for Instance {
    fn readdir_names(&self) -> Result<Vec<String>, StorageError> {
        Instance::readdir_names(self)
    }

    fn get(&self) -> Result<Box<dyn Read + Send>, StorageError> {
        Ok(Box::new(Instance::get(self)?))
    }

    fn stat(&self) -> Result<BlobInfo, StorageError> {
        Instance::stat(self)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        Instance::read_at(self, buf, offset)
    }

    async fn put(&self, reader: &mut (dyn Read + Send)) -> Result<(), StorageError> {
        Instance::put(self, reader).await
    }

    async fn delete(&self) -> Result<(), StorageError> {
        Instance::delete(self).await
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, StorageError> {
        Instance::write_at(self, buf, offset)
    }
}

impl ResourceProvider for Provider {
    type Resource = Instance;

    fn new_instance(&self, location: &str) -> Instance {
        Provider::new_instance(self, location)
    }
}

impl ConsecutiveChunkWriter for Provider {
    fn write_consecutive_chunks(
        &self,
        prefix: &str,
        sink: &mut dyn Write,
    ) -> Result<u64, StorageError> {
        Provider::write_consecutive_chunks(self, prefix, sink)
    }
}
