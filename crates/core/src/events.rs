//! Outbound notifications for the host
//!
//! The core never calls into presentation code. It publishes `CoreEvent`
//! values on a broadcast channel and the host renders from them.

use tokio::sync::broadcast;

use crate::pager::PageMode;
use crate::transfer::{TransferId, TransferSnapshot};

const DEFAULT_CAPACITY: usize = 256;

/// A state change the host may want to render
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A new listing session replaced the previous one
    PrefixOpened {
        bucket: String,
        prefix: String,
        mode: PageMode,
    },

    /// A page was committed; the visible row count may have grown
    PageLoaded {
        bucket: String,
        prefix: String,
        page: usize,
        loaded_count: usize,
        has_more: bool,
    },

    /// A transfer's state, progress or position changed
    TransferUpdated(TransferSnapshot),

    /// A completed transfer left the visible list
    TransferRemoved(TransferId),
}

/// Cloneable publisher; sending without subscribers is not an error
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: CoreEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }
}
