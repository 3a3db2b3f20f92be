//! Bucket prefetch
//!
//! Warms the listing cache when a bucket is selected: the root listing
//! first, then a handful of its child prefixes under a small concurrency
//! limit. Everything here is best-effort. Failures are logged and
//! dropped and never reach the foreground.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::cache::ListingCache;
use crate::config::PrefetchConfig;
use crate::listing::{FullListing, fetch_full_listing};
use crate::traits::ObjectStore;

struct Running {
    bucket: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Tasks {
    current: Option<Running>,
    superseded: Vec<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    cache: Arc<ListingCache>,
    semaphore: Arc<Semaphore>,
    max_children: usize,
    delimiter: String,
}

/// Cancellable, bounded cache warm-up per selected bucket
pub struct PrefetchScheduler {
    inner: Arc<Inner>,
    root_token: CancellationToken,
    tasks: Mutex<Tasks>,
}

impl PrefetchScheduler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<ListingCache>,
        config: &PrefetchConfig,
        delimiter: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
                max_children: config.max_children,
                delimiter: delimiter.into(),
            }),
            root_token: CancellationToken::new(),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Cancel whatever is running and start warming `bucket`
    pub fn select_bucket(&self, bucket: &str) {
        if self.root_token.is_cancelled() {
            tracing::debug!(bucket = %bucket, "Prefetch scheduler is shut down, ignoring selection");
            return;
        }

        let token = self.root_token.child_token();
        let inner = Arc::clone(&self.inner);
        let owned_bucket = bucket.to_string();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            inner.run(&owned_bucket, &task_token).await;
        });

        let mut tasks = self.lock_tasks();
        tasks.superseded.retain(|h| !h.is_finished());
        if let Some(previous) = tasks.current.take() {
            tracing::debug!(bucket = %previous.bucket, "Cancelling previous prefetch");
            previous.token.cancel();
            tasks.superseded.push(previous.handle);
        }
        tasks.current = Some(Running {
            bucket: bucket.to_string(),
            token,
            handle,
        });
    }

    /// Warm `bucket` on the caller's task, observing `token`
    pub async fn prefetch_bucket(&self, bucket: &str, token: &CancellationToken) {
        self.inner.run(bucket, token).await;
    }

    /// Whether a prefetch of `bucket` is still running
    pub fn is_warming(&self, bucket: &str) -> bool {
        self.lock_tasks()
            .current
            .as_ref()
            .is_some_and(|r| r.bucket == bucket && !r.handle.is_finished())
    }

    /// Wait for the current prefetch to finish
    pub async fn wait(&self) {
        let running = self.lock_tasks().current.take();
        if let Some(running) = running
            && let Err(e) = running.handle.await
        {
            tracing::warn!(bucket = %running.bucket, error = %e, "Prefetch task panicked");
        }
    }

    /// Cancel every prefetch and join the tasks
    pub async fn shutdown(&self) {
        self.root_token.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.lock_tasks();
            let mut handles = std::mem::take(&mut tasks.superseded);
            handles.extend(tasks.current.take().map(|r| r.handle));
            handles
        };

        for handle in handles {
            let _ = handle.await;
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.root_token.cancel();
    }
}

impl Inner {
    async fn run(self: &Arc<Self>, bucket: &str, token: &CancellationToken) {
        let Some(root) = self.warm(bucket, "", token).await else {
            return;
        };

        let mut children = JoinSet::new();
        for prefix in root.folders.iter().take(self.max_children) {
            let inner = Arc::clone(self);
            let bucket = bucket.to_string();
            let prefix = prefix.clone();
            let token = token.clone();
            children.spawn(async move {
                inner.warm(&bucket, &prefix, &token).await;
            });
        }

        while let Some(joined) = children.join_next().await {
            if let Err(e) = joined {
                tracing::debug!(bucket = %bucket, error = %e, "Prefetch child task failed");
            }
        }

        tracing::debug!(bucket = %bucket, cancelled = token.is_cancelled(), "Prefetch finished");
    }

    /// Fetch and cache one prefix unless it is already cached.
    ///
    /// Returns the listing (cached or fresh), or `None` when cancelled or
    /// when the fetch failed.
    async fn warm(
        &self,
        bucket: &str,
        prefix: &str,
        token: &CancellationToken,
    ) -> Option<Arc<FullListing>> {
        if token.is_cancelled() {
            return None;
        }
        if let Some(cached) = self.cache.get(bucket, prefix) {
            return Some(cached);
        }

        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok()?,
        };

        // Checked again: the slot may have taken a while
        if token.is_cancelled() {
            return None;
        }

        match fetch_full_listing(self.store.as_ref(), bucket, prefix, &self.delimiter).await {
            Ok(listing) => Some(self.cache.put(bucket, prefix, listing)),
            Err(e) => {
                tracing::debug!(
                    bucket = %bucket,
                    prefix = %prefix,
                    error = %e,
                    "Prefetch listing failed"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::Error;
    use crate::traits::{ListResult, MockObjectStore, ObjectInfo};

    fn config() -> PrefetchConfig {
        PrefetchConfig {
            max_children: 2,
            concurrency: 1,
        }
    }

    #[tokio::test]
    async fn test_warms_root_and_first_children() {
        let mut store = MockObjectStore::new();
        store.expect_list_objects().returning(|req| {
            if req.prefix.is_empty() {
                Ok(ListResult {
                    common_prefixes: vec!["a/".into(), "b/".into(), "c/".into()],
                    objects: vec![ObjectInfo::file("root.txt", 1)],
                    ..Default::default()
                })
            } else {
                Ok(ListResult {
                    objects: vec![ObjectInfo::file(format!("{}f.txt", req.prefix), 1)],
                    ..Default::default()
                })
            }
        });

        let cache = Arc::new(ListingCache::default());
        let scheduler = PrefetchScheduler::new(Arc::new(store), Arc::clone(&cache), &config(), "/");
        scheduler.select_bucket("media");
        scheduler.wait().await;

        assert!(cache.contains("media", ""));
        assert!(cache.contains("media", "a/"));
        assert!(cache.contains("media", "b/"));
        assert!(!cache.contains("media", "c/"));
    }

    #[tokio::test]
    async fn test_skips_cached_children() {
        let cached_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&cached_hits);
        let mut store = MockObjectStore::new();
        store.expect_list_objects().returning(move |req| {
            if req.prefix == "a/" {
                hits.fetch_add(1, Ordering::SeqCst);
            }
            Ok(if req.prefix.is_empty() {
                ListResult {
                    common_prefixes: vec!["a/".into(), "b/".into()],
                    ..Default::default()
                }
            } else {
                ListResult::default()
            })
        });

        let cache = Arc::new(ListingCache::default());
        cache.put("media", "a/", FullListing::default());

        let scheduler = PrefetchScheduler::new(Arc::new(store), Arc::clone(&cache), &config(), "/");
        scheduler.prefetch_bucket("media", &CancellationToken::new()).await;
        assert!(cache.contains("media", "b/"));
        assert_eq!(cached_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_errors_are_swallowed() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_objects()
            .returning(|_| Err(Error::Network("unreachable".into())));

        let cache = Arc::new(ListingCache::default());
        let scheduler = PrefetchScheduler::new(Arc::new(store), Arc::clone(&cache), &config(), "/");
        scheduler.select_bucket("media");
        scheduler.wait().await;

        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_makes_no_calls() {
        let mut store = MockObjectStore::new();
        store.expect_list_objects().never();

        let cache = Arc::new(ListingCache::default());
        let scheduler = PrefetchScheduler::new(Arc::new(store), cache, &config(), "/");
        let token = CancellationToken::new();
        token.cancel();
        scheduler.prefetch_bucket("media", &token).await;
    }

    #[tokio::test]
    async fn test_select_after_shutdown_is_ignored() {
        let mut store = MockObjectStore::new();
        store.expect_list_objects().never();

        let scheduler = PrefetchScheduler::new(
            Arc::new(store),
            Arc::new(ListingCache::default()),
            &config(),
            "/",
        );
        scheduler.shutdown().await;
        scheduler.select_bucket("media");
        scheduler.wait().await;
    }
}
