//! Bounded-concurrency download coordinator: turns a scheduler's task list
//! into fetches against the transport, verifies each leaf against the
//! reference hashes, and de-duplicates in-flight fetches for the same node.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::cache_file::CacheFile;
use crate::errors::{CacheError, CacheResult};
use crate::geometry::{NodeIndex, TreeGeometry};
use crate::scheduler::Scheduler;
use crate::state::State;
use crate::transport::Transport;

type SharedFetch = Shared<BoxFuture<'static, Arc<CacheResult<()>>>>;

/// Registry of in-flight node fetches. Never held across an `.await`.
struct InflightRegistry {
    inner: Mutex<HashMap<NodeIndex, SharedFetch>>,
}

impl InflightRegistry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Return the existing in-flight future for `node`, or register and
    /// return a freshly-spawned one built from `make`.
    fn get_or_insert(
        &self,
        node: NodeIndex,
        make: impl FnOnce() -> BoxFuture<'static, Arc<CacheResult<()>>>,
    ) -> SharedFetch {
        let mut guard = self.inner.lock();
        if let Some(existing) = guard.get(&node) {
            return existing.clone();
        }
        let shared = make().shared();
        guard.insert(node, shared.clone());
        shared
    }

    fn remove(&self, node: NodeIndex) {
        self.inner.lock().remove(&node);
    }
}

/// Coordinates fetching and verifying whatever nodes a `Scheduler` plans
/// for a requested byte range, writing verified bytes into the cache file.
pub struct DownloadCoordinator {
    transport: Arc<Transport>,
    cache_file: Arc<CacheFile>,
    state: Arc<Mutex<State>>,
    geometry: TreeGeometry,
    scheduler: Scheduler,
    semaphore: Arc<Semaphore>,
    inflight: Arc<InflightRegistry>,
    integrity_failures: Arc<AtomicU64>,
}

impl DownloadCoordinator {
    pub fn new(
        transport: Arc<Transport>,
        cache_file: Arc<CacheFile>,
        state: Arc<Mutex<State>>,
        geometry: TreeGeometry,
        scheduler: Scheduler,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            transport,
            cache_file,
            state,
            geometry,
            scheduler,
            semaphore: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
            inflight: Arc::new(InflightRegistry::new()),
            integrity_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of leaf-level integrity failures observed so far (§4.6/§7:
    /// verification failures are counted, not just surfaced as an error).
    pub fn integrity_failure_count(&self) -> u64 {
        self.integrity_failures.load(Ordering::Relaxed)
    }

    /// Ensure every leaf covering `[offset, offset+len)` is valid, fetching
    /// and verifying whatever is missing. Returns once the whole range is
    /// valid or a fetch/verification error occurs.
    pub async fn ensure_covering(&self, offset: u64, len: u64) -> CacheResult<()> {
        if len == 0 {
            return Ok(());
        }

        // Bound retries against pathological plan/fetch races (two
        // differently-coalesced tasks both covering one leaf): each pass
        // should shrink the missing set, so this is not expected to loop.
        for _ in 0..4 {
            let tasks = {
                let state = self.state.lock();
                self.scheduler.plan(offset, len, &self.geometry, &state)?
            };
            if tasks.is_empty() {
                return Ok(());
            }

            let futures: Vec<SharedFetch> = tasks
                .into_iter()
                .map(|task| self.fetch_or_join(task.node))
                .collect();

            for result in futures_util::future::join_all(futures).await {
                if let Err(err) = result.as_ref() {
                    return Err(clone_error(err));
                }
            }
        }

        let state = self.state.lock();
        let leaves = self.geometry.leaves_for_byte_range(offset, len)?;
        if leaves.iter().all(|&l| state.is_valid(l)) {
            Ok(())
        } else {
            Err(CacheError::Exhausted(
                "range did not become fully valid after repeated scheduling passes".to_string(),
            ))
        }
    }

    fn fetch_or_join(&self, node: NodeIndex) -> SharedFetch {
        let transport = self.transport.clone();
        let cache_file = self.cache_file.clone();
        let state = self.state.clone();
        let geometry = self.geometry;
        let semaphore = self.semaphore.clone();
        let inflight = self.inflight.clone();
        let scheduler = self.scheduler.clone();
        let integrity_failures = self.integrity_failures.clone();

        self.inflight.get_or_insert(node, move || {
            fetch_and_verify_node(
                transport,
                cache_file,
                state,
                geometry,
                semaphore,
                inflight,
                scheduler,
                integrity_failures,
                node,
            )
            .boxed()
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn fetch_and_verify_node(
    transport: Arc<Transport>,
    cache_file: Arc<CacheFile>,
    state: Arc<Mutex<State>>,
    geometry: TreeGeometry,
    semaphore: Arc<Semaphore>,
    inflight: Arc<InflightRegistry>,
    scheduler: Scheduler,
    integrity_failures: Arc<AtomicU64>,
    node: NodeIndex,
) -> Pin<Box<dyn Future<Output = Arc<CacheResult<()>>> + Send>> {
    Box::pin(async move {
        let result = fetch_and_verify_node_inner(
            &transport,
            &cache_file,
            &state,
            &geometry,
            &semaphore,
            &scheduler,
            &integrity_failures,
            node,
        )
        .await;
        inflight.remove(node);
        Arc::new(result)
    })
}

#[allow(clippy::too_many_arguments)]
async fn fetch_and_verify_node_inner(
    transport: &Transport,
    cache_file: &CacheFile,
    state: &Mutex<State>,
    geometry: &TreeGeometry,
    semaphore: &Semaphore,
    scheduler: &Scheduler,
    integrity_failures: &AtomicU64,
    node: NodeIndex,
) -> CacheResult<()> {
    let leaves = geometry.leaf_range_for_node(node);
    if leaves.is_empty() {
        return Ok(());
    }

    let byte_range = geometry.byte_range_for_node(node);
    let permit = semaphore
        .acquire()
        .await
        .map_err(|_| CacheError::Cancelled)?;
    let started = Instant::now();
    let bytes = transport
        .fetch_range(byte_range.start, byte_range.end - byte_range.start)
        .await?;
    scheduler.record_throughput(bytes.len() as u64, started.elapsed());
    drop(permit);

    // Verify every still-missing leaf in this task before committing any of
    // them: a single bad leaf must not leave earlier leaves in the same
    // task marked valid (§4.6, "does not mutate State" on integrity
    // failure).
    let mut pending = Vec::new();
    {
        let state = state.lock();
        for leaf in leaves {
            if state.is_valid(leaf) {
                continue;
            }
            let leaf_start = geometry.chunk_start(leaf);
            let leaf_end = geometry.chunk_end(leaf);
            let local_start = (leaf_start - byte_range.start) as usize;
            let local_end = (leaf_end - byte_range.start) as usize;
            let slice = &bytes[local_start..local_end];
            if let Err(err) = state.verify_leaf(leaf, slice) {
                if matches!(err, CacheError::Integrity { .. }) {
                    integrity_failures.fetch_add(1, Ordering::Relaxed);
                }
                return Err(err);
            }
            pending.push((leaf, leaf_start, local_start, local_end));
        }
    }

    let mut state = state.lock();
    for (leaf, leaf_start, local_start, local_end) in pending {
        let slice = &bytes[local_start..local_end];
        state.save_if_valid(leaf, slice, || cache_file.write_at(leaf_start, slice))?;
    }

    Ok(())
}

fn clone_error(err: &CacheError) -> CacheError {
    match err {
        CacheError::InvalidArgument(m) => CacheError::InvalidArgument(m.clone()),
        CacheError::InvalidState(m) => CacheError::InvalidState(m.clone()),
        CacheError::Corrupt(m) => CacheError::Corrupt(m.clone()),
        CacheError::Io(e) => CacheError::Io(std::io::Error::new(e.kind(), e.to_string())),
        CacheError::Protocol(m) => CacheError::Protocol(m.clone()),
        CacheError::Integrity { leaf_index } => CacheError::Integrity {
            leaf_index: *leaf_index,
        },
        CacheError::Cancelled => CacheError::Cancelled,
        CacheError::Timeout => CacheError::Timeout,
        CacheError::Exhausted(m) => CacheError::Exhausted(m.clone()),
    }
}
