//! Bucket and prefix browsing
//!
//! `Browser` owns the listing cache, the prefetch scheduler, the cache
//! sweeper and the current listing session. Opening a prefix serves a
//! small cached listing from memory; anything else shows the first remote
//! page at once and, on a cache miss, fetches the complete listing in the
//! background so the next visit is served from the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::cache::ListingCache;
use crate::config::{BrowserConfig, Config};
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::listing::{Row, fetch_full_listing, parent_prefix};
use crate::pager::{PageMode, PagerSettings, VirtualPageProvider};
use crate::prefetch::PrefetchScheduler;
use crate::traits::ObjectStore;

pub struct Browser {
    store: Arc<dyn ObjectStore>,
    cache: Arc<ListingCache>,
    prefetch: PrefetchScheduler,
    settings: BrowserConfig,
    events: EventBus,
    session: RwLock<Option<VirtualPageProvider>>,
    /// Bumped by every `open_prefix`; only the latest open installs its session
    opens: AtomicU64,
    root_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<JoinSet<()>>,
}

impl Browser {
    /// Build a browser and start its cache sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn ObjectStore>, config: &Config, events: EventBus) -> Self {
        let cache = Arc::new(ListingCache::new(config.cache.ttl()));
        let root_token = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(config.cache.sweep_interval(), root_token.child_token());
        let prefetch = PrefetchScheduler::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            &config.prefetch,
            config.browser.delimiter.clone(),
        );

        Self {
            store,
            cache,
            prefetch,
            settings: config.browser.clone(),
            events,
            session: RwLock::new(None),
            opens: AtomicU64::new(0),
            root_token,
            sweeper: Mutex::new(Some(sweeper)),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ListingCache> {
        &self.cache
    }

    pub fn prefetch(&self) -> &PrefetchScheduler {
        &self.prefetch
    }

    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        self.store.list_buckets().await
    }

    /// Start warming `bucket` and open its root
    pub async fn select_bucket(&self, bucket: &str) -> Result<VirtualPageProvider> {
        tracing::info!(bucket = %bucket, "Bucket selected");
        self.prefetch.select_bucket(bucket);
        self.open_prefix(bucket, "").await
    }

    /// Replace the current session with one for `(bucket, prefix)`.
    ///
    /// Fails only when the first remote page cannot be loaded; the previous
    /// session is kept in that case. An open overtaken by a newer one
    /// returns its session already closed and leaves the current one alone.
    pub async fn open_prefix(&self, bucket: &str, prefix: &str) -> Result<VirtualPageProvider> {
        if self.root_token.is_cancelled() {
            return Err(Error::InvalidState("browser is shut down".into()));
        }
        let generation = self.opens.fetch_add(1, Ordering::SeqCst) + 1;

        let settings = PagerSettings::new(self.settings.page_size, self.settings.delimiter.clone())
            .with_events(self.events.clone());
        let cached = self.cache.get(bucket, prefix);

        let session = match &cached {
            Some(listing)
                if PageMode::for_listing(listing.len(), self.settings.page_size)
                    == PageMode::Eager =>
            {
                tracing::debug!(bucket = %bucket, prefix = %prefix, "Serving listing from cache");
                VirtualPageProvider::from_listing(listing, bucket, prefix, settings)
            }
            _ => {
                let session =
                    VirtualPageProvider::remote(Arc::clone(&self.store), bucket, prefix, settings);
                session.initialize().await?;
                // The prefetch already pages through the root it is warming
                let warming = prefix.is_empty() && self.prefetch.is_warming(bucket);
                if cached.is_none() && !warming && !self.cache.contains(bucket, prefix) {
                    self.spawn_full_fetch(bucket, prefix);
                }
                session
            }
        };

        let previous = {
            let mut current = self
                .session
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.opens.load(Ordering::SeqCst) != generation {
                drop(current);
                tracing::debug!(bucket = %bucket, prefix = %prefix, "Discarding superseded open");
                session.close();
                return Ok(session);
            }
            current.replace(session.clone())
        };
        if let Some(previous) = previous {
            previous.close();
        }

        tracing::info!(
            bucket = %bucket,
            prefix = %prefix,
            mode = ?session.mode(),
            rows = session.row_count(),
            "Opened prefix"
        );
        self.events.emit(CoreEvent::PrefixOpened {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            mode: session.mode(),
        });

        Ok(session)
    }

    /// Open a folder of the current bucket
    pub async fn activate_folder(&self, key: &str) -> Result<VirtualPageProvider> {
        let bucket = self
            .current()
            .map(|s| s.bucket().to_string())
            .ok_or_else(|| Error::InvalidState("no bucket selected".into()))?;
        self.open_prefix(&bucket, key).await
    }

    /// Open the parent prefix; `None` when already at the bucket root
    pub async fn navigate_up(&self) -> Result<Option<VirtualPageProvider>> {
        let Some(current) = self.current() else {
            return Err(Error::InvalidState("no bucket selected".into()));
        };
        if current.prefix().is_empty() {
            return Ok(None);
        }

        let parent = parent_prefix(current.prefix(), &self.settings.delimiter);
        self.open_prefix(current.bucket(), &parent).await.map(Some)
    }

    /// Drop the cached listing of the current prefix and reopen it
    pub async fn refresh(&self) -> Result<VirtualPageProvider> {
        let Some(current) = self.current() else {
            return Err(Error::InvalidState("no bucket selected".into()));
        };
        self.cache.invalidate(current.bucket(), current.prefix());
        self.open_prefix(current.bucket(), current.prefix()).await
    }

    pub fn current(&self) -> Option<VirtualPageProvider> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Row for the host to draw; placeholder when nothing is open
    pub fn row(&self, index: usize) -> Row {
        self.current()
            .map(|s| s.get_item_at(index))
            .unwrap_or(Row::Placeholder)
    }

    pub fn row_count(&self) -> usize {
        self.current().map(|s| s.row_count()).unwrap_or(0)
    }

    /// Rename an object (copy, then delete the source)
    pub async fn rename(&self, bucket: &str, from: &str, to: &str) -> Result<()> {
        if to.is_empty() || to.ends_with(&self.settings.delimiter) {
            return Err(Error::InvalidPath(format!("Invalid object key: {to}")));
        }

        self.store.rename_object(bucket, from, to).await?;
        tracing::info!(bucket = %bucket, from = %from, to = %to, "Renamed object");

        self.invalidate_parent(bucket, from);
        self.invalidate_parent(bucket, to);
        Ok(())
    }

    /// Delete keys, returning the ones the store reports as deleted
    pub async fn delete(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let parents: Vec<String> = keys
            .iter()
            .map(|k| parent_prefix(k, &self.settings.delimiter))
            .collect();
        let deleted = self.store.delete_objects(bucket, keys).await?;
        tracing::info!(bucket = %bucket, count = deleted.len(), "Deleted objects");

        for parent in parents {
            self.cache.invalidate(bucket, &parent);
        }
        Ok(deleted)
    }

    /// Wait for background full-listing fetches to finish
    pub async fn settle_background(&self) {
        let mut tasks = std::mem::take(&mut *self.lock_background());
        while tasks.join_next().await.is_some() {}
    }

    /// Cancel prefetch, sweeper and background fetches and join them
    pub async fn shutdown(&self) {
        self.root_token.cancel();
        self.prefetch.shutdown().await;

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        if let Some(session) = self.current() {
            session.close();
        }
        self.settle_background().await;
        tracing::debug!("Browser shut down");
    }

    fn invalidate_parent(&self, bucket: &str, key: &str) {
        self.cache
            .invalidate(bucket, &parent_prefix(key, &self.settings.delimiter));
    }

    fn lock_background(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch the complete listing and cache it; the first page shown to
    /// the host is never cached on its own
    fn spawn_full_fetch(&self, bucket: &str, prefix: &str) {
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let delimiter = self.settings.delimiter.clone();
        let token = self.root_token.child_token();
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();

        let mut tasks = self.lock_background();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = fetch_full_listing(store.as_ref(), &bucket, &prefix, &delimiter) => result,
            };
            match result {
                Ok(listing) => {
                    cache.put(&bucket, &prefix, listing);
                }
                Err(e) => {
                    tracing::warn!(
                        bucket = %bucket,
                        prefix = %prefix,
                        error = %e,
                        "Background listing failed"
                    );
                }
            }
        });
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.root_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::FullListing;
    use crate::traits::{ListResult, MockObjectStore, ObjectInfo};

    fn small_listing() -> FullListing {
        FullListing {
            folders: vec!["docs/".into()],
            files: vec![ObjectInfo::file("readme.md", 10)],
        }
    }

    #[tokio::test]
    async fn test_cached_small_listing_is_eager() {
        let mut store = MockObjectStore::new();
        store.expect_list_objects().never();

        let browser = Browser::new(Arc::new(store), &Config::default(), EventBus::default());
        browser.cache().put("b", "", small_listing());

        let session = browser.open_prefix("b", "").await.unwrap();
        assert_eq!(session.mode(), PageMode::Eager);
        assert_eq!(browser.row_count(), 2);
        assert_eq!(
            browser.row(0).entry().map(|e| e.display_name.clone()),
            Some("docs".to_string())
        );
        browser.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_open_keeps_previous_session() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_objects()
            .returning(|_| Err(Error::Auth("denied".into())));

        let browser = Browser::new(Arc::new(store), &Config::default(), EventBus::default());
        browser.cache().put("b", "", small_listing());
        browser.open_prefix("b", "").await.unwrap();

        let err = browser.open_prefix("b", "private/").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(browser.current().unwrap().prefix(), "");
        browser.shutdown().await;
    }

    #[tokio::test]
    async fn test_navigate_up_at_root() {
        let mut store = MockObjectStore::new();
        store.expect_list_objects().returning(|_| Ok(ListResult::default()));

        let browser = Browser::new(Arc::new(store), &Config::default(), EventBus::default());
        assert!(matches!(
            browser.navigate_up().await,
            Err(Error::InvalidState(_))
        ));

        browser.open_prefix("b", "a/b/").await.unwrap();
        let up = browser.navigate_up().await.unwrap().unwrap();
        assert_eq!(up.prefix(), "a/");
        browser.settle_background().await;

        browser.open_prefix("b", "").await.unwrap();
        assert!(browser.navigate_up().await.unwrap().is_none());
        browser.shutdown().await;
    }

    #[tokio::test]
    async fn test_rename_rejects_folder_target() {
        let store = MockObjectStore::new();
        let browser = Browser::new(Arc::new(store), &Config::default(), EventBus::default());
        let err = browser.rename("b", "a.txt", "dir/").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
        browser.shutdown().await;
    }
}
