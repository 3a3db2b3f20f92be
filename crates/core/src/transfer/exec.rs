//! Streaming upload and download bodies
//!
//! Both directions observe the cancellation token at every chunk. A
//! canceled download leaves its partial local file in place.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::traits::{ObjectStore, ProgressFn, UploadBody};

use super::item::TransferRequest;

/// Content type for an upload, guessed from the file extension
pub fn content_type_for(path: &std::path::Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

pub(crate) async fn upload(
    store: &dyn ObjectStore,
    request: &TransferRequest,
    progress: ProgressFn,
    token: &CancellationToken,
) -> Result<()> {
    let file = tokio::fs::File::open(&request.local_path).await?;
    let total = file.metadata().await?.len();
    let content_type = content_type_for(&request.local_path);

    tracing::debug!(
        bucket = %request.bucket,
        key = %request.key,
        size = total,
        content_type = %content_type,
        "Uploading file"
    );

    let chunk_token = token.clone();
    let stream = ReaderStream::new(file)
        .map(move |chunk| {
            if chunk_token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            chunk.map_err(Error::from)
        })
        .boxed();

    let body = UploadBody {
        stream,
        content_length: total,
    };

    let put = store.put_object(
        &request.bucket,
        &request.key,
        body,
        &content_type,
        Arc::clone(&progress),
        token,
    );

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = put => result,
    };
    result?;

    progress(total, total);
    Ok(())
}

pub(crate) async fn download(
    store: &dyn ObjectStore,
    request: &TransferRequest,
    progress: ProgressFn,
    token: &CancellationToken,
) -> Result<()> {
    let body = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(Error::Cancelled),
        body = store.get_object(&request.bucket, &request.key, token) => body?,
    };

    if let Some(parent) = request.local_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(&request.local_path).await?;
    // Zero when the store did not send a length; only bytes are reported then
    let total = body.content_length.unwrap_or(0);
    let mut stream = body.stream;
    let mut written: u64 = 0;

    tracing::debug!(
        bucket = %request.bucket,
        key = %request.key,
        path = %request.local_path.display(),
        size = ?body.content_length,
        "Downloading object"
    );

    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => {
                file.flush().await?;
                return Err(Error::Cancelled);
            }
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        progress(written, total);
    }

    file.flush().await?;
    progress(written, total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a/photo.JPG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("notes.txt")), "text/plain");
        assert_eq!(
            content_type_for(Path::new("blob.unknownext")),
            "application/octet-stream"
        );
        assert_eq!(content_type_for(Path::new("Makefile")), "application/octet-stream");
    }
}
