//! Lazily paged listings
//!
//! A `VirtualPageProvider` presents one `(bucket, prefix)` listing as an
//! index-addressable sequence. In eager mode every page is already in
//! memory; in virtualized mode pages are fetched from the store on demand,
//! strictly in continuation-token order.
//!
//! Reads never block. An index that is not loaded yet yields
//! `Row::Placeholder` and starts a background load sequence; at most one
//! such sequence runs per session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::listing::{Entry, FullListing, ListingPage, Row};
use crate::traits::{ListRequest, ObjectStore};

/// How a session's pages are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageMode {
    /// All pages are cut from a known complete listing
    Eager,
    /// Pages are fetched from the store as they are needed
    Virtualized,
}

impl PageMode {
    /// Eager when the listing fits in two pages
    pub fn for_listing(total: usize, page_size: usize) -> Self {
        if total <= page_size.saturating_mul(2).max(1) {
            PageMode::Eager
        } else {
            PageMode::Virtualized
        }
    }
}

/// Paging parameters shared by both modes
#[derive(Debug, Clone)]
pub struct PagerSettings {
    pub page_size: usize,
    pub delimiter: String,
    pub events: Option<EventBus>,
}

impl PagerSettings {
    pub fn new(page_size: usize, delimiter: impl Into<String>) -> Self {
        Self {
            page_size: page_size.max(1),
            delimiter: delimiter.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }
}

#[derive(Debug, Default)]
struct PageState {
    pages: Vec<Vec<Entry>>,
    /// Token each loaded page was requested with, parallel to `pages`
    tokens: Vec<Option<String>>,
    next_token: Option<String>,
    has_more: bool,
    loaded_count: usize,
}

impl PageState {
    /// Page and offset holding `index`, if loaded
    fn locate(&self, index: usize) -> Option<&Entry> {
        let mut start = 0;
        for page in &self.pages {
            if index < start + page.len() {
                return page.get(index - start);
            }
            start += page.len();
        }
        None
    }

    fn commit(&mut self, token: Option<String>, page: ListingPage) {
        self.loaded_count += page.entries.len();
        self.pages.push(page.entries);
        self.tokens.push(token);
        self.has_more = page.is_truncated && page.next_continuation_token.is_some();
        self.next_token = page.next_continuation_token;
    }
}

struct Inner {
    bucket: String,
    prefix: String,
    page_size: usize,
    delimiter: String,
    mode: PageMode,
    store: Option<Arc<dyn ObjectStore>>,
    events: Option<EventBus>,
    state: RwLock<PageState>,
    /// Serializes remote page loads
    load_lock: tokio::sync::Mutex<()>,
    /// Set while a triggered load sequence is running
    loading: AtomicBool,
    pending: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

/// Index-addressable view over one listing session
#[derive(Clone)]
pub struct VirtualPageProvider {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VirtualPageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPageProvider")
            .field("bucket", &self.inner.bucket)
            .field("prefix", &self.inner.prefix)
            .field("mode", &self.inner.mode)
            .field("loaded_count", &self.loaded_count())
            .field("has_more", &self.has_more())
            .finish()
    }
}

impl VirtualPageProvider {
    /// A session whose pages come from the store; call `initialize` next
    pub fn remote(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        settings: PagerSettings,
    ) -> Self {
        let state = PageState {
            has_more: true,
            ..Default::default()
        };
        Self::build(bucket.into(), prefix.into(), settings, PageMode::Virtualized, Some(store), state)
    }

    /// A session paged in memory from a complete listing
    pub fn from_listing(
        listing: &FullListing,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        settings: PagerSettings,
    ) -> Self {
        let prefix = prefix.into();
        let entries = listing.entries(&prefix, &settings.delimiter);

        let mut state = PageState {
            loaded_count: entries.len(),
            ..Default::default()
        };
        for chunk in entries.chunks(settings.page_size.max(1)) {
            state.pages.push(chunk.to_vec());
            state.tokens.push(None);
        }

        Self::build(bucket.into(), prefix, settings, PageMode::Eager, None, state)
    }

    fn build(
        bucket: String,
        prefix: String,
        settings: PagerSettings,
        mode: PageMode,
        store: Option<Arc<dyn ObjectStore>>,
        state: PageState,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bucket,
                prefix,
                page_size: settings.page_size.max(1),
                delimiter: settings.delimiter,
                mode,
                store,
                events: settings.events,
                state: RwLock::new(state),
                load_lock: tokio::sync::Mutex::new(()),
                loading: AtomicBool::new(false),
                pending: Mutex::new(None),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn mode(&self) -> PageMode {
        self.inner.mode
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Load page 0 if it is not loaded yet
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_page_loaded(0).await
    }

    /// Row at `index`, or a placeholder while its page is still remote.
    ///
    /// Never blocks; a missing page starts a background load sequence
    /// unless one is already running.
    pub fn get_item_at(&self, index: usize) -> Row {
        let target = {
            let state = self.inner.read_state();
            if let Some(entry) = state.locate(index) {
                return Row::Data(entry.clone());
            }
            if !state.has_more {
                return Row::Placeholder;
            }
            state.pages.len() + index.saturating_sub(state.loaded_count) / self.inner.page_size
        };

        self.trigger_load(target);
        Row::Placeholder
    }

    /// Load pages in order until `page_index` is loaded or the listing ends
    pub async fn ensure_page_loaded(&self, page_index: usize) -> Result<()> {
        loop {
            {
                let state = self.inner.read_state();
                if state.pages.len() > page_index || !state.has_more {
                    return Ok(());
                }
            }
            self.inner.load_next().await?;
        }
    }

    /// Load exactly `page_index`, which must be the next unloaded page.
    ///
    /// Returns `false` when the page was already loaded or the listing has
    /// no further pages.
    pub async fn load_page(&self, page_index: usize) -> Result<bool> {
        let loaded = self.inner.read_state().pages.len();
        if page_index < loaded {
            return Ok(false);
        }
        if page_index > loaded {
            return Err(Error::InvalidState(format!(
                "page {page_index} requested before page {loaded}"
            )));
        }
        self.inner.load_next().await
    }

    /// Visible rows: loaded entries plus one placeholder while more exist
    pub fn row_count(&self) -> usize {
        let state = self.inner.read_state();
        state.loaded_count + usize::from(state.has_more)
    }

    pub fn loaded_count(&self) -> usize {
        self.inner.read_state().loaded_count
    }

    pub fn page_count(&self) -> usize {
        self.inner.read_state().pages.len()
    }

    pub fn has_more(&self) -> bool {
        self.inner.read_state().has_more
    }

    /// Continuation token a loaded page was requested with
    pub fn page_token(&self, page_index: usize) -> Option<String> {
        self.inner
            .read_state()
            .tokens
            .get(page_index)
            .cloned()
            .flatten()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::Acquire)
    }

    /// Wait for the background load sequence, if any
    pub async fn settle(&self) {
        loop {
            let pending = self.inner.lock_pending().take();
            match pending {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => return,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Stop loading; called when the session is replaced
    pub fn close(&self) {
        self.inner.token.cancel();
        if let Some(handle) = self.inner.lock_pending().take() {
            handle.abort();
        }
    }

    fn trigger_load(&self, target: usize) {
        if self.inner.token.is_cancelled() {
            return;
        }
        if self
            .inner
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.inner.loading.store(false, Ordering::Release);
                tracing::warn!("No async runtime available for page loading");
                return;
            }
        };

        tracing::debug!(
            bucket = %self.inner.bucket,
            prefix = %self.inner.prefix,
            page = target,
            "Scheduling page load"
        );

        // Held across the spawn so a later trigger cannot be overwritten
        let mut pending = self.inner.lock_pending();
        let provider = self.clone();
        let handle = runtime.spawn(async move {
            if let Err(e) = provider.ensure_page_loaded(target).await
                && !e.is_cancelled()
            {
                tracing::warn!(
                    bucket = %provider.inner.bucket,
                    prefix = %provider.inner.prefix,
                    page = target,
                    error = %e,
                    "Page load failed"
                );
            }
            provider.inner.loading.store(false, Ordering::Release);
        });

        *pending = Some(handle);
    }
}

impl Inner {
    fn read_state(&self) -> RwLockReadGuard<'_, PageState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PageState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch and commit the next page under the load lock.
    ///
    /// State is untouched when the fetch fails.
    async fn load_next(&self) -> Result<bool> {
        let _guard = self.load_lock.lock().await;

        let (page_index, token) = {
            let state = self.read_state();
            if !state.has_more {
                return Ok(false);
            }
            (state.pages.len(), state.next_token.clone())
        };

        let Some(store) = self.store.as_ref() else {
            return Ok(false);
        };

        let request = ListRequest::new(&self.bucket, &self.prefix)
            .delimiter(&self.delimiter)
            .max_keys(i32::try_from(self.page_size).unwrap_or(i32::MAX))
            .continuation_token(token.clone());

        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Error::Cancelled),
            result = store.list_objects(request) => result?,
        };

        let page = ListingPage::from_result(result, &self.prefix, &self.delimiter);
        let (loaded_count, has_more) = {
            let mut state = self.write_state();
            state.commit(token, page);
            (state.loaded_count, state.has_more)
        };

        tracing::debug!(
            bucket = %self.bucket,
            prefix = %self.prefix,
            page = page_index,
            loaded_count,
            has_more,
            "Loaded listing page"
        );

        if let Some(events) = &self.events {
            events.emit(CoreEvent::PageLoaded {
                bucket: self.bucket.clone(),
                prefix: self.prefix.clone(),
                page: page_index,
                loaded_count,
                has_more,
            });
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ListResult, MockObjectStore, ObjectInfo};

    fn listing(n: usize) -> FullListing {
        FullListing {
            folders: vec!["p/dir/".into()],
            files: (1..n)
                .map(|i| ObjectInfo::file(format!("p/{i:04}.txt"), i as i64))
                .collect(),
        }
    }

    #[test]
    fn test_mode_threshold() {
        assert_eq!(PageMode::for_listing(150, 100), PageMode::Eager);
        assert_eq!(PageMode::for_listing(200, 100), PageMode::Eager);
        assert_eq!(PageMode::for_listing(201, 100), PageMode::Virtualized);
        assert_eq!(PageMode::for_listing(1, 0), PageMode::Eager);
        assert_eq!(PageMode::for_listing(2, 0), PageMode::Virtualized);
    }

    #[tokio::test]
    async fn test_eager_pages_make_no_remote_calls() {
        let full = listing(150);
        let pager = VirtualPageProvider::from_listing(&full, "b", "p/", PagerSettings::new(100, "/"));

        assert_eq!(pager.mode(), PageMode::Eager);
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.row_count(), 150);
        assert!(!pager.has_more());

        let first = pager.get_item_at(0);
        assert_eq!(first.entry().map(|e| e.display_name.as_str()), Some("dir"));
        let last = pager.get_item_at(149);
        assert_eq!(last.entry().map(|e| e.display_name.as_str()), Some("0149.txt"));
        assert!(pager.get_item_at(150).is_placeholder());
        assert!(!pager.is_loading());
    }

    #[tokio::test]
    async fn test_initialize_propagates_and_keeps_state() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_objects()
            .times(1)
            .returning(|_| Err(Error::Network("timeout".into())));

        let pager = VirtualPageProvider::remote(Arc::new(store), "b", "", PagerSettings::new(10, "/"));
        assert!(pager.initialize().await.is_err());
        assert_eq!(pager.loaded_count(), 0);
        assert!(pager.has_more());
        assert_eq!(pager.row_count(), 1);
    }

    #[tokio::test]
    async fn test_load_page_out_of_sequence() {
        let mut store = MockObjectStore::new();
        store.expect_list_objects().times(1).returning(|_| {
            Ok(ListResult {
                objects: vec![ObjectInfo::file("a", 1)],
                truncated: true,
                continuation_token: Some("t1".into()),
                ..Default::default()
            })
        });

        let pager = VirtualPageProvider::remote(Arc::new(store), "b", "", PagerSettings::new(1, "/"));
        assert!(matches!(pager.load_page(1).await, Err(Error::InvalidState(_))));
        assert!(pager.load_page(0).await.unwrap());
        assert!(!pager.load_page(0).await.unwrap());
        assert_eq!(pager.row_count(), 2);
        assert_eq!(pager.page_token(0), None);
    }

    #[tokio::test]
    async fn test_page_loaded_event() {
        let mut store = MockObjectStore::new();
        store.expect_list_objects().times(1).returning(|req| {
            assert_eq!(req.max_keys, Some(25));
            assert!(req.continuation_token.is_none());
            Ok(ListResult {
                common_prefixes: vec!["x/".into()],
                objects: vec![ObjectInfo::file("f", 1)],
                ..Default::default()
            })
        });

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let pager = VirtualPageProvider::remote(
            Arc::new(store),
            "b",
            "",
            PagerSettings::new(25, "/").with_events(events),
        );
        pager.initialize().await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::PageLoaded {
                bucket: "b".into(),
                prefix: "".into(),
                page: 0,
                loaded_count: 2,
                has_more: false,
            }
        );
        assert_eq!(pager.row_count(), 2);
    }
}
