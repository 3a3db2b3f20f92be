//! Transfer identifiers, requests, states and snapshots

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a queued transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// Lifecycle of a transfer.
///
/// `Queued -> Starting -> Uploading | Downloading -> Complete`, with
/// `Canceled` or `Failed` reachable from any running state and `Queued`
/// reachable again only through retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum TransferState {
    Queued,
    Starting,
    Uploading,
    Downloading,
    /// Cancel requested, not yet observed by the running transfer
    Canceling,
    Complete,
    Canceled,
    Failed(String),
}

impl TransferState {
    /// The running state for a direction
    pub fn running(direction: Direction) -> Self {
        match direction {
            Direction::Upload => TransferState::Uploading,
            Direction::Download => TransferState::Downloading,
        }
    }

    /// Holds (or is about to release) a concurrency slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransferState::Starting
                | TransferState::Uploading
                | TransferState::Downloading
                | TransferState::Canceling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Canceled | TransferState::Failed(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferState::Canceled | TransferState::Failed(_))
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Queued => write!(f, "Queued"),
            TransferState::Starting => write!(f, "Starting"),
            TransferState::Uploading => write!(f, "Uploading"),
            TransferState::Downloading => write!(f, "Downloading"),
            TransferState::Canceling => write!(f, "Canceling"),
            TransferState::Complete => write!(f, "Complete"),
            TransferState::Canceled => write!(f, "Canceled"),
            TransferState::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

/// What to move and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub direction: Direction,
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
}

impl TransferRequest {
    pub fn upload(
        local_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            direction: Direction::Upload,
            bucket: bucket.into(),
            key: key.into(),
            local_path: local_path.into(),
        }
    }

    pub fn download(
        bucket: impl Into<String>,
        key: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            direction: Direction::Download,
            bucket: bucket.into(),
            key: key.into(),
            local_path: local_path.into(),
        }
    }
}

/// Point-in-time view of one transfer, as handed to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub direction: Direction,
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    /// Percent complete, 0..=100
    pub progress: u8,
    pub state: TransferState,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}
