//! In-memory object store shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use sm_core::{
    Error, ListRequest, ListResult, ObjectBody, ObjectInfo, ObjectStore, ProgressFn, Result,
    TransferQueue, TransferSnapshot, TransferState, UploadBody,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Once,
    Always,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, BTreeMap<String, Bytes>>,
    content_types: HashMap<(String, String), String>,
    failures: HashMap<String, Failure>,
    failing_prefixes: BTreeSet<String>,
    prefix_delays: HashMap<String, Duration>,
    unsized_keys: BTreeSet<String>,
    gates: HashMap<String, Arc<Semaphore>>,
    list_log: Vec<ListRequest>,
}

/// Object store keeping everything in memory.
///
/// Listings follow S3 delimiter semantics and page by `max_keys`, with the
/// last returned name as continuation token. Bodies are streamed in
/// `chunk_size` pieces; a gated key waits for one permit per chunk.
pub struct MemoryStore {
    state: Mutex<State>,
    chunk_size: usize,
    list_delay: Option<Duration>,
    list_calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: &Arc<AtomicUsize>, max: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self {
            current: Arc::clone(current),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            chunk_size: 4,
            list_delay: None,
            list_calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.lock()
            .objects
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    /// `count` objects named `{prefix}obj-00000` and up, 8 bytes each
    pub fn insert_many(&self, bucket: &str, prefix: &str, count: usize) {
        for i in 0..count {
            self.insert(bucket, &format!("{prefix}obj-{i:05}"), &b"contents"[..]);
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock().objects.get(bucket)?.get(key).cloned()
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.lock()
            .content_types
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn fail(&self, key: &str, failure: Failure) {
        self.lock().failures.insert(key.to_string(), failure);
    }

    pub fn fail_listing(&self, prefix: &str) {
        self.lock().failing_prefixes.insert(prefix.to_string());
    }

    /// Delay listings of exactly `prefix`
    pub fn delay_listing(&self, prefix: &str, delay: Duration) {
        self.lock().prefix_delays.insert(prefix.to_string(), delay);
    }

    /// Serve `key` without a content length
    pub fn hide_length(&self, key: &str) {
        self.lock().unsized_keys.insert(key.to_string());
    }

    /// Hold back every chunk of `key` until a permit is added
    pub fn gate(&self, key: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().gates.insert(key.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn list_log(&self) -> Vec<ListRequest> {
        self.lock().list_log.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn check_failure(&self, key: &str) -> Result<()> {
        let mut state = self.lock();
        match state.failures.get(key).copied() {
            Some(Failure::Once) => {
                state.failures.remove(key);
                Err(Error::Network(format!("injected failure for {key}")))
            }
            Some(Failure::Always) => Err(Error::Network(format!("injected failure for {key}"))),
            None => Ok(()),
        }
    }

    fn gate_for(&self, key: &str) -> Option<Arc<Semaphore>> {
        self.lock().gates.get(key).cloned()
    }
}

/// Acquire and consume one gate permit
async fn pass(gate: &Option<Arc<Semaphore>>) {
    if let Some(gate) = gate
        && let Ok(permit) = gate.acquire().await
    {
        permit.forget();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_buckets(&self) -> Result<Vec<String>> {
        Ok(self.lock().objects.keys().cloned().collect())
    }

    async fn list_objects(&self, request: ListRequest) -> Result<ListResult> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let prefix_delay = {
            let mut state = self.lock();
            state.list_log.push(request.clone());
            state.prefix_delays.get(&request.prefix).copied()
        };

        if let Some(delay) = prefix_delay.or(self.list_delay) {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if state.failing_prefixes.contains(&request.prefix) {
            return Err(Error::Network(format!(
                "injected listing failure for {}",
                request.prefix
            )));
        }
        let Some(bucket) = state.objects.get(&request.bucket) else {
            return Err(Error::NotFound(request.bucket.clone()));
        };

        // Names in key order: objects and rolled-up common prefixes
        let mut names: BTreeMap<String, Option<ObjectInfo>> = BTreeMap::new();
        for (key, data) in bucket.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            let rest = &key[request.prefix.len()..];
            match request.delimiter.as_deref().and_then(|d| rest.find(d).map(|i| (d, i))) {
                Some((delimiter, i)) => {
                    let common = format!("{}{}{}", request.prefix, &rest[..i], delimiter);
                    names.entry(common).or_insert(None);
                }
                None => {
                    names.insert(key.clone(), Some(ObjectInfo::file(key, data.len() as i64)));
                }
            }
        }

        let start_after = request.continuation_token.clone().unwrap_or_default();
        let max = request
            .max_keys
            .and_then(|m| usize::try_from(m).ok())
            .unwrap_or(1000)
            .max(1);

        let mut remaining = names
            .into_iter()
            .filter(|(name, _)| start_after.is_empty() || name.as_str() > start_after.as_str());

        let mut result = ListResult::default();
        let mut last = None;
        for (name, object) in remaining.by_ref().take(max) {
            match object {
                Some(info) => result.objects.push(info),
                None => result.common_prefixes.push(name.clone()),
            }
            last = Some(name);
        }

        if remaining.next().is_some() {
            result.truncated = true;
            result.continuation_token = last;
        }
        Ok(result)
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        _cancel: &CancellationToken,
    ) -> Result<ObjectBody> {
        self.check_failure(key)?;
        let data = self
            .object(bucket, key)
            .ok_or_else(|| Error::NotFound(format!("{bucket}/{key}")))?;

        let guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        let gate = self.gate_for(key);
        let chunks: Vec<Bytes> = data
            .chunks(self.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        let content_length = if self.lock().unsized_keys.contains(key) {
            None
        } else {
            Some(data.len() as u64)
        };

        let stream = futures::stream::unfold(
            (chunks.into_iter(), gate, guard),
            |(mut chunks, gate, guard)| async move {
                let chunk = chunks.next()?;
                pass(&gate).await;
                Some((Ok::<_, Error>(chunk), (chunks, gate, guard)))
            },
        )
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
        self.check_failure(key)?;
        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        let gate = self.gate_for(key);

        let total = body.content_length;
        let mut stream = body.stream;
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            pass(&gate).await;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            data.extend_from_slice(&chunk?);
            progress(data.len() as u64, total);
        }

        let mut state = self.lock();
        state
            .objects
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), Bytes::from(data));
        state
            .content_types
            .insert((bucket.to_string(), key.to_string()), content_type.to_string());
        Ok(())
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        let data = self
            .object(src_bucket, src_key)
            .ok_or_else(|| Error::NotFound(format!("{src_bucket}/{src_key}")))?;
        self.insert(dst_bucket, dst_key, data);
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<String>> {
        let mut state = self.lock();
        let Some(objects) = state.objects.get_mut(bucket) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .into_iter()
            .filter(|key| objects.remove(key).is_some())
            .collect())
    }
}

/// Poll the queue until `id` satisfies `done`, failing after five seconds
pub async fn wait_for(
    queue: &TransferQueue,
    id: sm_core::TransferId,
    done: impl Fn(&TransferSnapshot) -> bool,
) -> TransferSnapshot {
    let poll = async {
        loop {
            if let Some(snapshot) = queue.get(id)
                && done(&snapshot)
            {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("transfer did not reach the expected state")
}

pub fn is_state(state: TransferState) -> impl Fn(&TransferSnapshot) -> bool {
    move |snapshot| snapshot.state == state
}
