//! ObjectStore trait and the request/response types it exchanges
//!
//! The core never talks to an SDK directly. Everything it needs from the
//! remote store goes through this trait, which keeps the cache, pager and
//! transfer queue testable against in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Boxed stream of body chunks
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Upload progress callback, called with `(bytes_sent, total_bytes)`
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Metadata for a single object returned by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Full object key
    pub key: String,

    /// Size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,

    /// Last modification time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,

    /// Entity tag without surrounding quotes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ObjectInfo {
    /// Create object metadata with a known size
    pub fn file(key: impl Into<String>, size: i64) -> Self {
        Self {
            key: key.into(),
            size_bytes: Some(size),
            last_modified: None,
            etag: None,
        }
    }

    /// Set the modification time
    pub fn with_last_modified(mut self, ts: Timestamp) -> Self {
        self.last_modified = Some(ts);
        self
    }
}

/// A single delimiter-based listing request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: String,
    pub continuation_token: Option<String>,
    pub max_keys: Option<i32>,
    pub delimiter: Option<String>,
}

impl ListRequest {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn continuation_token(mut self, token: Option<String>) -> Self {
        self.continuation_token = token;
        self
    }

    pub fn max_keys(mut self, max: i32) -> Self {
        self.max_keys = Some(max);
        self
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }
}

/// One page of a listing as returned by the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResult {
    /// Folder-like groupings (full prefixes, delimiter included)
    pub common_prefixes: Vec<String>,

    /// Objects on this page, folder markers included
    pub objects: Vec<ObjectInfo>,

    /// Whether more pages follow
    pub truncated: bool,

    /// Token for the next page
    pub continuation_token: Option<String>,
}

/// Streaming body of a downloaded object
pub struct ObjectBody {
    pub stream: ByteStream,
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Streaming body of an object being uploaded
pub struct UploadBody {
    pub stream: ByteStream,
    pub content_length: u64,
}

impl std::fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Remote object store primitives consumed by the core.
///
/// Implementations must observe `cancel` at their own I/O boundaries and
/// return `Error::Cancelled` once it fires.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List bucket names visible to the current credentials
    async fn list_buckets(&self) -> Result<Vec<String>>;

    /// Fetch one page of a delimiter-based listing
    async fn list_objects(&self, request: ListRequest) -> Result<ListResult>;

    /// Open a streaming download
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectBody>;

    /// Upload a body, reporting progress as bytes leave the process
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: UploadBody,
        content_type: &str,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Server-side copy
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()>;

    /// Delete keys in one batch, returning the keys actually deleted
    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<String>>;

    /// Rename within a bucket: copy, then delete the source
    async fn rename_object(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<()> {
        self.copy_object(bucket, src_key, bucket, dst_key).await?;
        self.delete_objects(bucket, vec![src_key.to_string()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_info_creation() {
        let info = ObjectInfo::file("photos/cat.jpg", 1024);
        assert_eq!(info.key, "photos/cat.jpg");
        assert_eq!(info.size_bytes, Some(1024));
        assert!(info.last_modified.is_none());
    }

    #[test]
    fn test_list_request_builder() {
        let req = ListRequest::new("media", "photos/")
            .max_keys(200)
            .delimiter("/")
            .continuation_token(Some("abc".to_string()));
        assert_eq!(req.bucket, "media");
        assert_eq!(req.prefix, "photos/");
        assert_eq!(req.max_keys, Some(200));
        assert_eq!(req.delimiter.as_deref(), Some("/"));
        assert_eq!(req.continuation_token.as_deref(), Some("abc"));
    }
}
