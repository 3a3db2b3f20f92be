//! S3 client implementation
//!
//! Wraps aws-sdk-s3 and implements the ObjectStore trait from sm-core.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use jiff::Timestamp;
use tokio_util::sync::CancellationToken;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use sm_core::{
    Error, ListRequest, ListResult, ObjectBody, ObjectInfo, ObjectStore, ProgressFn, Result,
    UploadBody,
};

/// Smallest part size S3 accepts for all but the last part
pub const MIN_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Upper bound on parts in one multipart upload
pub const MAX_PARTS: u64 = 10_000;

/// Connection settings for one S3-compatible endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Custom endpoint; `None` uses AWS
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Path-style addressing, needed by most non-AWS servers
    pub force_path_style: bool,
}

impl ConnectionConfig {
    /// Reject endpoints that are not absolute http(s) URLs
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.endpoint {
            let url = url::Url::parse(endpoint)
                .map_err(|e| Error::Config(format!("Invalid endpoint '{endpoint}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "Endpoint must use http or https: {endpoint}"
                )));
            }
        }
        if self.region.is_empty() {
            return Err(Error::Config("Region must not be empty".into()));
        }
        Ok(())
    }
}

/// S3 client wrapper
pub struct S3Client {
    inner: aws_sdk_s3::Client,
}

impl S3Client {
    /// Create a new S3 client from connection settings
    pub async fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        // Build credentials provider
        let credentials = aws_credential_types::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None, // session token
            None, // expiry
            "sm-static-credentials",
        );

        // Build SDK config
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        tracing::debug!(
            endpoint = ?config.endpoint,
            region = %config.region,
            path_style = config.force_path_style,
            "Created S3 client"
        );

        Ok(Self {
            inner: aws_sdk_s3::Client::from_conf(s3_config),
        })
    }

    /// Get the underlying aws-sdk-s3 client
    pub fn inner(&self) -> &aws_sdk_s3::Client {
        &self.inner
    }

    /// Format AWS SDK error into a detailed error message
    fn format_sdk_error<E: std::fmt::Display>(error: &aws_sdk_s3::error::SdkError<E>) -> String {
        match error {
            aws_sdk_s3::error::SdkError::ServiceError(service_err) => {
                let err = service_err.err();
                let meta = service_err.raw();
                let mut msg = format!("Service error: {}", err);
                if let Some(code) = meta.headers().get("x-amz-error-code") {
                    msg.push_str(&format!(" (code: {})", code));
                }
                msg
            }
            aws_sdk_s3::error::SdkError::ConstructionFailure(err) => {
                format!("Request construction failed: {:?}", err)
            }
            aws_sdk_s3::error::SdkError::TimeoutError(_) => "Request timeout".to_string(),
            aws_sdk_s3::error::SdkError::DispatchFailure(err) => {
                format!("Network dispatch error: {:?}", err)
            }
            aws_sdk_s3::error::SdkError::ResponseError(err) => {
                format!("Response error: {:?}", err)
            }
            _ => error.to_string(),
        }
    }

    fn map_sdk_error<E: std::fmt::Display>(
        error: &aws_sdk_s3::error::SdkError<E>,
        target: &str,
    ) -> Error {
        classify_error(&Self::format_sdk_error(error), target)
    }

    async fn abort_upload(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(e) = self
            .inner
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(
                bucket = %bucket,
                key = %key,
                error = %Self::format_sdk_error(&e),
                "Failed to abort multipart upload"
            );
        }
    }

    async fn put_single(
        &self,
        bucket: &str,
        key: &str,
        body: UploadBody,
        content_type: &str,
        progress: &ProgressFn,
    ) -> Result<()> {
        let total = body.content_length;
        let mut buffer = BytesMut::with_capacity(usize::try_from(total).unwrap_or(0));
        let mut stream = body.stream;
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            progress(buffered_progress(buffer.len() as u64, total), total);
        }
        let size = buffer.len() as u64;

        self.inner
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(buffer.freeze()))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e, &format!("{bucket}/{key}")))?;

        progress(size, total.max(size));
        Ok(())
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        body: UploadBody,
        content_type: &str,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = format!("{bucket}/{key}");
        let response = self
            .inner
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e, &target))?;
        let upload_id = response
            .upload_id()
            .ok_or_else(|| Error::General("No upload ID returned".into()))?
            .to_string();

        let part_size = part_size_for(body.content_length);
        let total = body.content_length;

        let result = self
            .upload_parts(bucket, key, &upload_id, body, part_size, progress, cancel)
            .await;

        let parts = match result {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_upload(bucket, key, &upload_id).await;
                return Err(e);
            }
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        if let Err(e) = self
            .inner
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
        {
            self.abort_upload(bucket, key, &upload_id).await;
            return Err(Self::map_sdk_error(&e, &target));
        }

        tracing::debug!(bucket = %bucket, key = %key, size = total, "Completed multipart upload");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        body: UploadBody,
        part_size: u64,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompletedPart>> {
        let total = body.content_length;
        let part_len = usize::try_from(part_size).unwrap_or(usize::MAX);
        let mut stream = body.stream;
        let mut buffer = BytesMut::new();
        let mut parts = Vec::new();
        let mut sent: u64 = 0;
        let mut finished = false;

        while !finished {
            match stream.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => finished = true,
            }

            while buffer.len() >= part_len || (finished && !buffer.is_empty()) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let take = buffer.len().min(part_len);
                let data: Bytes = buffer.split_to(take).freeze();
                let part_number = i32::try_from(parts.len() + 1)
                    .map_err(|_| Error::General("Too many parts".into()))?;

                let response = self
                    .inner
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error(&e, &format!("{bucket}/{key}")))?;

                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(response.e_tag().map(str::to_string))
                        .build(),
                );

                sent += take as u64;
                progress(sent, total.max(sent));
            }
        }

        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn list_buckets(&self) -> Result<Vec<String>> {
        let response = self
            .inner
            .list_buckets()
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e, "buckets"))?;

        Ok(response
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn list_objects(&self, request: ListRequest) -> Result<ListResult> {
        let mut builder = self.inner.list_objects_v2().bucket(&request.bucket);

        if !request.prefix.is_empty() {
            builder = builder.prefix(&request.prefix);
        }
        if let Some(delimiter) = &request.delimiter {
            builder = builder.delimiter(delimiter);
        }
        if let Some(max) = request.max_keys {
            builder = builder.max_keys(max);
        }
        if let Some(token) = &request.continuation_token {
            builder = builder.continuation_token(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e, &request.bucket))?;

        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();

        let objects = response
            .contents()
            .iter()
            .map(|object| ObjectInfo {
                key: object.key().unwrap_or_default().to_string(),
                size_bytes: object.size(),
                last_modified: object.last_modified().and_then(to_timestamp),
                etag: object.e_tag().map(|s| s.trim_matches('"').to_string()),
            })
            .collect();

        let truncated = response.is_truncated().unwrap_or(false);
        Ok(ListResult {
            common_prefixes,
            objects,
            truncated,
            continuation_token: response.next_continuation_token().map(str::to_string),
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectBody> {
        let send = self.inner.get_object().bucket(bucket).key(key).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = send => response.map_err(|e| Self::map_sdk_error(&e, &format!("{bucket}/{key}")))?,
        };

        let content_length = response
            .content_length()
            .and_then(|len| u64::try_from(len).ok());
        let stream = futures::stream::unfold(response.body, |mut body| async move {
            body.next().await.map(|chunk| {
                (
                    chunk.map_err(|e| Error::Network(format!("Body read failed: {e}"))),
                    body,
                )
            })
        })
        .boxed();

        Ok(ObjectBody {
            stream,
            content_length,
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: UploadBody,
        content_type: &str,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if body.content_length <= MIN_PART_SIZE {
            self.put_single(bucket, key, body, content_type, &progress)
                .await
        } else {
            self.put_multipart(bucket, key, body, content_type, &progress, cancel)
                .await
        }
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        self.inner
            .copy_object()
            .copy_source(copy_source(src_bucket, src_key))
            .bucket(dst_bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e, &format!("{src_bucket}/{src_key}")))?;

        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let objects = keys
            .iter()
            .map(|k| ObjectIdentifier::builder().key(k).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::General(e.to_string()))?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .map_err(|e| Error::General(e.to_string()))?;

        let response = self
            .inner
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e, bucket))?;

        // Collect deleted keys
        let deleted: Vec<String> = response
            .deleted()
            .iter()
            .filter_map(|d| d.key().map(|k| k.to_string()))
            .collect();

        // Check for errors
        if !response.errors().is_empty() {
            let error_keys: Vec<String> = response
                .errors()
                .iter()
                .filter_map(|e| e.key().map(|k| k.to_string()))
                .collect();
            tracing::warn!(bucket = %bucket, keys = ?error_keys, "Failed to delete some objects");
        }

        Ok(deleted)
    }
}

/// Map a formatted SDK error onto the core error taxonomy
pub fn classify_error(message: &str, target: &str) -> Error {
    const NOT_FOUND: &[&str] = &["NoSuchKey", "NoSuchBucket", "NotFound"];
    const DENIED: &[&str] = &[
        "AccessDenied",
        "InvalidAccessKeyId",
        "SignatureDoesNotMatch",
        "Forbidden",
    ];

    if NOT_FOUND.iter().any(|code| message.contains(code)) {
        Error::NotFound(target.to_string())
    } else if DENIED.iter().any(|code| message.contains(code)) {
        Error::Auth(message.to_string())
    } else {
        Error::Network(message.to_string())
    }
}

/// Part size keeping a body of `total` bytes within the part limit
pub fn part_size_for(total: u64) -> u64 {
    total.div_ceil(MAX_PARTS).max(MIN_PART_SIZE)
}

/// `bucket/key` with the key percent-encoded, as CopyObject expects
pub fn copy_source(bucket: &str, key: &str) -> String {
    let key = key
        .split('/')
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("/");
    format!("{bucket}/{key}")
}

/// Bytes to report while a single-part body is still being read.
///
/// The last byte is held back until the PUT has been acknowledged.
fn buffered_progress(read: u64, total: u64) -> u64 {
    read.min(total.saturating_sub(1))
}

fn to_timestamp(dt: &aws_smithy_types::DateTime) -> Option<Timestamp> {
    Timestamp::from_second(dt.secs()).ok()
}
