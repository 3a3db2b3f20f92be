//! Listing cache
//!
//! A TTL memo of exhaustive listings keyed by `(bucket, prefix)`. Only
//! complete listings are stored here; partial pages never are.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::listing::FullListing;

/// Time-to-live applied when none is configured
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Period of the background sweep when none is configured
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type CacheKey = (String, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    listing: Arc<FullListing>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Concurrent TTL cache of full listings
#[derive(Debug)]
pub struct ListingCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a listing, evicting it if it has expired
    pub fn get(&self, bucket: &str, prefix: &str) -> Option<Arc<FullListing>> {
        let key = cache_key(bucket, prefix);
        let now = Instant::now();

        // Clone out before touching the map again; a live read guard
        // would deadlock the removal below.
        let entry = self.entries.get(&key).map(|e| e.value().clone())?;
        if entry.is_valid_at(now) {
            return Some(entry.listing);
        }

        self.entries.remove_if(&key, |_, e| !e.is_valid_at(now));
        tracing::debug!(bucket = %bucket, prefix = %prefix, "Evicted expired listing on read");
        None
    }

    /// Store a complete listing; last write wins
    pub fn put(&self, bucket: &str, prefix: &str, listing: FullListing) -> Arc<FullListing> {
        let listing = Arc::new(listing);
        self.put_shared(bucket, prefix, Arc::clone(&listing));
        listing
    }

    pub fn put_shared(&self, bucket: &str, prefix: &str, listing: Arc<FullListing>) {
        let expires_at = Instant::now() + self.ttl;
        tracing::debug!(
            bucket = %bucket,
            prefix = %prefix,
            items = listing.len(),
            "Cached listing"
        );
        self.entries
            .insert(cache_key(bucket, prefix), CacheEntry { listing, expires_at });
    }

    /// Whether a valid entry exists; expired entries are evicted
    pub fn contains(&self, bucket: &str, prefix: &str) -> bool {
        self.get(bucket, prefix).is_some()
    }

    pub fn invalidate(&self, bucket: &str, prefix: &str) {
        if self.entries.remove(&cache_key(bucket, prefix)).is_some() {
            tracing::debug!(bucket = %bucket, prefix = %prefix, "Invalidated listing");
        }
    }

    /// Drop every prefix cached for a bucket
    pub fn invalidate_bucket(&self, bucket: &str) {
        self.entries.retain(|(b, _), _| b != bucket);
    }

    /// Number of stored entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry with `expires_at <= now`, returning how many went.
    ///
    /// Keys are collected first and each removal re-checks the expiry, so
    /// an entry refreshed in between survives.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_valid_at(now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self
                .entries
                .remove_if(&key, |_, e| !e.is_valid_at(now))
                .is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "Swept listing cache");
        }
        removed
    }

    /// Run `sweep` every `interval` until `token` is cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    tick = ticker.tick() => {
                        cache.sweep(tick);
                    }
                }
            }
            tracing::debug!("Listing cache sweeper stopped");
        })
    }
}

fn cache_key(bucket: &str, prefix: &str) -> CacheKey {
    (bucket.to_string(), prefix.to_string())
}
