//! Object store factory and archive path layout.
//!
//! Raw trace batches and archived stream flushes share one bucket and are
//! separated by prefix:
//!
//! ```text
//! otel-traces/{YYYY-MM-DD-HH-MM}/{ulid}.json
//! {stream prefix}{YYYY}/{MM}/{DD}/{HH}/{stream}-{YYYY-MM-DD-HH-MM-SS}-{ulid}[.gz]
//! ```
//!
//! The raw prefix is the only one the extraction trigger listens on, so stream
//! prefixes must never fall under it (checked by `ArchiveConfig::validate`).
//! Retention is best configured with lifecycle rules on the bucket, one rule
//! per prefix.

use chrono::{DateTime, Utc};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use std::sync::Arc;
use ulid::Ulid;

use crate::config::{Compression, StorageConfig, RAW_TRACE_PREFIX};
use crate::PipelineError;

/// Create an object store from configuration.
///
/// # Errors
///
/// Returns an error if the object store cannot be created (e.g., invalid path,
/// missing credentials for cloud storage).
pub fn create_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, PipelineError> {
    match config {
        StorageConfig::Local { path } => {
            std::fs::create_dir_all(path)?;
            let store = LocalFileSystem::new_with_prefix(path)?;
            Ok(Arc::new(store))
        }
        StorageConfig::Memory => Ok(Arc::new(InMemory::new())),
        #[cfg(feature = "s3")]
        StorageConfig::S3 {
            bucket,
            region,
            endpoint,
            allow_http,
        } => {
            use object_store::aws::{AmazonS3Builder, S3ConditionalPut};

            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(r) = region {
                builder = builder.with_region(r);
            }
            if let Some(ep) = endpoint {
                builder = builder.with_endpoint(ep);
            }
            if *allow_http {
                builder = builder.with_allow_http(true);
            }
            // The sink relies on create-only writes.
            builder = builder.with_conditional_put(S3ConditionalPut::ETagMatch);
            Ok(Arc::new(builder.build()?))
        }
        #[cfg(not(feature = "s3"))]
        StorageConfig::S3 { .. } => Err(PipelineError::Config(
            "S3 storage requires the 's3' feature to be enabled".to_owned(),
        )),
    }
}

/// Minute partition key of a raw trace object, e.g. `2024-01-01-00-00`.
pub fn minute_partition(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d-%H-%M").to_string()
}

/// Path of a raw trace batch received at `received_at`.
///
/// The object name is the batch id, so re-exporting the same batch targets
/// the same path.
pub fn raw_trace_path(received_at: DateTime<Utc>, batch_id: &Ulid) -> Path {
    Path::from(format!(
        "{RAW_TRACE_PREFIX}{}/{batch_id}.json",
        minute_partition(received_at)
    ))
}

/// Path of one stream flush whose buffer opened at `opened_at`.
pub fn archive_path(
    prefix: &str,
    stream: &str,
    opened_at: DateTime<Utc>,
    compression: Compression,
) -> Path {
    let extension = match compression {
        Compression::Gzip => ".gz",
        Compression::Uncompressed => "",
    };
    Path::from(format!(
        "{prefix}{}/{stream}-{}-{}{extension}",
        opened_at.format("%Y/%m/%d/%H"),
        opened_at.format("%Y-%m-%d-%H-%M-%S"),
        Ulid::new()
    ))
}
