//! Command/event surface for a host application
//!
//! The host sends `Command` values and renders from `CoreEvent`
//! notifications. Nothing here knows how rows or transfers are drawn.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::browser::Browser;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::listing::{fetch_all_objects, is_folder_marker, parent_prefix};
use crate::pager::VirtualPageProvider;
use crate::traits::ObjectStore;
use crate::transfer::{
    TransferId, TransferQueue, TransferRequest, TransferState, plan_download, plan_folder_download,
    plan_upload,
};

/// Requests from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SelectBucket(String),
    /// Open a folder key of the current bucket
    ActivateFolder(String),
    NavigateUp,
    Refresh,
    /// Upload a local file or folder under `prefix`
    Upload {
        path: PathBuf,
        bucket: String,
        prefix: String,
        /// Set once the host has confirmed a large folder
        confirmed: bool,
    },
    /// Download objects into `dest_dir`; folder keys bring their whole tree
    Download {
        bucket: String,
        keys: Vec<String>,
        dest_dir: PathBuf,
    },
    Rename {
        bucket: String,
        from: String,
        to: String,
    },
    Delete {
        bucket: String,
        keys: Vec<String>,
    },
    CancelTransfer(TransferId),
    RetryTransfer(TransferId),
    SetMaxConcurrentTransfers(usize),
}

/// Immediate result of a command; everything later arrives as events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Opened { bucket: String, prefix: String, rows: usize },
    AtRoot,
    Enqueued(Vec<TransferId>),
    ConfirmationRequired { files: usize, bytes: u64 },
    Transfer(TransferState),
    /// Keys the store reported as deleted
    Deleted(Vec<String>),
    Done,
}

pub struct Controller {
    store: Arc<dyn ObjectStore>,
    browser: Browser,
    transfers: TransferQueue,
    events: EventBus,
    config: Config,
}

impl Controller {
    /// Must be called from within a tokio runtime
    pub fn new(store: Arc<dyn ObjectStore>, config: Config) -> Self {
        let events = EventBus::default();
        let browser = Browser::new(Arc::clone(&store), &config, events.clone());
        let transfers = TransferQueue::new(Arc::clone(&store), &config.transfers, events.clone());
        Self {
            store,
            browser,
            transfers,
            events,
            config,
        }
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    pub fn transfers(&self) -> &TransferQueue {
        &self.transfers
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub async fn handle(&self, command: Command) -> Result<Outcome> {
        tracing::debug!(?command, "Handling command");
        match command {
            Command::SelectBucket(bucket) => {
                let session = self.browser.select_bucket(&bucket).await?;
                Ok(opened(&session))
            }
            Command::ActivateFolder(key) => {
                let session = self.browser.activate_folder(&key).await?;
                Ok(opened(&session))
            }
            Command::NavigateUp => Ok(match self.browser.navigate_up().await? {
                Some(session) => opened(&session),
                None => Outcome::AtRoot,
            }),
            Command::Refresh => {
                let session = self.browser.refresh().await?;
                Ok(opened(&session))
            }
            Command::Upload {
                path,
                bucket,
                prefix,
                confirmed,
            } => self.upload(path, bucket, prefix, confirmed).await,
            Command::Download {
                bucket,
                keys,
                dest_dir,
            } => self.download(bucket, keys, dest_dir).await,
            Command::Rename { bucket, from, to } => {
                self.browser.rename(&bucket, &from, &to).await?;
                Ok(Outcome::Done)
            }
            Command::Delete { bucket, keys } => {
                Ok(Outcome::Deleted(self.browser.delete(&bucket, keys).await?))
            }
            Command::CancelTransfer(id) => Ok(Outcome::Transfer(self.transfers.cancel(id)?)),
            Command::RetryTransfer(id) => {
                self.transfers.retry(id)?;
                Ok(Outcome::Transfer(TransferState::Queued))
            }
            Command::SetMaxConcurrentTransfers(max) => {
                self.transfers.set_max_concurrent(max);
                Ok(Outcome::Done)
            }
        }
    }

    /// Handle commands from `rx` until it closes.
    ///
    /// Failures are logged; the host learns about state through events.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<Command>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let Err(e) = self.handle(command).await {
                    tracing::warn!(error = %e, "Command failed");
                }
            }
            tracing::debug!("Command channel closed");
        })
    }

    pub async fn shutdown(&self) {
        self.transfers.shutdown();
        self.browser.shutdown().await;
    }

    /// Plan every key before submitting, so a failed folder listing
    /// enqueues nothing
    async fn download(
        &self,
        bucket: String,
        keys: Vec<String>,
        dest_dir: PathBuf,
    ) -> Result<Outcome> {
        let delimiter = &self.config.browser.delimiter;
        let mut requests: Vec<TransferRequest> = Vec::with_capacity(keys.len());
        for key in &keys {
            if is_folder_marker(key, delimiter) {
                let objects =
                    fetch_all_objects(self.store.as_ref(), &bucket, key, delimiter).await?;
                tracing::info!(
                    bucket = %bucket,
                    folder = %key,
                    files = objects.len(),
                    "Downloading folder"
                );
                requests.extend(plan_folder_download(
                    &bucket, key, &objects, &dest_dir, delimiter,
                )?);
            } else {
                requests.extend(plan_download(
                    &bucket,
                    std::slice::from_ref(key),
                    &dest_dir,
                    delimiter,
                )?);
            }
        }

        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let (id, _) = self.transfers.submit(request)?;
            ids.push(id);
        }
        Ok(Outcome::Enqueued(ids))
    }

    async fn upload(
        &self,
        path: PathBuf,
        bucket: String,
        prefix: String,
        confirmed: bool,
    ) -> Result<Outcome> {
        let threshold = self.config.transfers.large_folder_threshold;
        let plan_bucket = bucket.clone();
        let plan_prefix = prefix.clone();
        let plan = tokio::task::spawn_blocking(move || {
            plan_upload(&path, &plan_bucket, &plan_prefix, threshold)
        })
        .await
        .map_err(|e| Error::General(format!("upload planning task failed: {e}")))??;

        if plan.needs_confirmation && !confirmed {
            return Ok(Outcome::ConfirmationRequired {
                files: plan.file_count(),
                bytes: plan.total_bytes,
            });
        }

        let delimiter = self.config.browser.delimiter.clone();
        let mut ids = Vec::with_capacity(plan.requests.len());
        let mut handles = Vec::with_capacity(plan.requests.len());
        for request in plan.requests {
            let parent = parent_prefix(&request.key, &delimiter);
            let (id, handle) = self.transfers.submit(request)?;
            ids.push(id);
            handles.push((parent, handle));
        }

        // Uploaded keys make the cached listings of their folders stale
        let cache = Arc::clone(self.browser.cache());
        tokio::spawn(async move {
            for (parent, handle) in handles {
                if let Ok(TransferState::Complete) = handle.await {
                    cache.invalidate(&bucket, &parent);
                }
            }
            cache.invalidate(&bucket, &prefix);
        });

        Ok(Outcome::Enqueued(ids))
    }
}

fn opened(session: &VirtualPageProvider) -> Outcome {
    Outcome::Opened {
        bucket: session.bucket().to_string(),
        prefix: session.prefix().to_string(),
        rows: session.row_count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockObjectStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_large_folder_needs_confirmation() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("many");
        std::fs::create_dir(&root).unwrap();
        for i in 0..3 {
            std::fs::write(root.join(format!("{i}.txt")), b"x").unwrap();
        }

        let mut config = Config::default();
        config.transfers.large_folder_threshold = 2;
        let controller = Controller::new(Arc::new(MockObjectStore::new()), config);

        let outcome = controller
            .handle(Command::Upload {
                path: root,
                bucket: "b".into(),
                prefix: "".into(),
                confirmed: false,
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::ConfirmationRequired { files: 3, bytes: 3 });
        assert!(controller.transfers().is_empty());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_transfer_id() {
        let controller = Controller::new(Arc::new(MockObjectStore::new()), Config::default());
        let err = controller
            .handle(Command::CancelTransfer(TransferId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let outcome = controller
            .handle(Command::SetMaxConcurrentTransfers(7))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(controller.transfers().max_concurrent(), 7);
        controller.shutdown().await;
    }
}
