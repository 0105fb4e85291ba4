//! Translates a requested byte range into a minimal set of node-download
//! tasks against the current validity state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::CacheResult;
use crate::geometry::{NodeIndex, TreeGeometry};
use crate::state::State;

/// One unit of work for the download coordinator: fetch and verify the
/// subtree rooted at `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDownloadTask {
    pub node: NodeIndex,
}

/// Lower/upper bounds and starting point for the `Adaptive` scheduler's
/// coalescing threshold.
const ADAPTIVE_MIN_THRESHOLD: u64 = 1;
const ADAPTIVE_MAX_THRESHOLD: u64 = 16;
const ADAPTIVE_START_THRESHOLD: u64 = 4;

/// Shared, mutable throughput observation feeding the `Adaptive` scheduler.
///
/// The download coordinator calls [`record`](Self::record) once per
/// completed fetch task with the bytes transferred and how long it took.
/// `Scheduler::plan` reads [`current_threshold`](Self::current_threshold)
/// when it needs one. A task's throughput is compared against an
/// exponential moving average of prior tasks on this same tracker: a
/// sample well below the average shrinks the threshold (favor
/// leaf-granular fetches, so one slow task doesn't stall a whole coalesced
/// range), a sample well above it grows the threshold back toward the
/// fewer, larger fetches that coalescing is for.
#[derive(Debug)]
pub struct ThroughputTracker {
    moving_avg_bps: Mutex<Option<f64>>,
    threshold: AtomicU64,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self {
            moving_avg_bps: Mutex::new(None),
            threshold: AtomicU64::new(ADAPTIVE_START_THRESHOLD),
        }
    }

    /// Record one completed task's throughput and adjust the threshold.
    pub fn record(&self, bytes: u64, elapsed: Duration) {
        let sample_bps = bytes as f64 / elapsed.as_secs_f64().max(0.001);
        let mut avg_guard = self.moving_avg_bps.lock();

        match *avg_guard {
            Some(avg) => {
                if sample_bps < avg * 0.7 {
                    self.shrink();
                } else if sample_bps > avg * 1.2 {
                    self.grow();
                }
                *avg_guard = Some(avg * 0.8 + sample_bps * 0.2);
            }
            None => *avg_guard = Some(sample_bps),
        }
    }

    fn shrink(&self) {
        let _ = self.threshold.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
            Some(std::cmp::max(ADAPTIVE_MIN_THRESHOLD, t / 2))
        });
    }

    fn grow(&self) {
        let _ = self.threshold.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
            Some(std::cmp::min(ADAPTIVE_MAX_THRESHOLD, t * 2))
        });
    }

    pub fn current_threshold(&self) -> u64 {
        self.threshold.load(Ordering::SeqCst)
    }
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Planning strategies for turning a byte range into node tasks.
#[derive(Debug, Clone)]
pub enum Scheduler {
    /// One task per missing leaf; simplest, most fetches.
    LeafOnly,
    /// Coalesce runs of `>= threshold` consecutive missing leaves into a
    /// single internal-node task when geometry allows it.
    Coalescing { threshold: u64 },
    /// Coalesce like `Coalescing`, but read the threshold from a shared
    /// [`ThroughputTracker`] that the coordinator updates after every
    /// completed fetch, so the threshold shrinks when observed per-task
    /// throughput degrades and grows again once it recovers.
    Adaptive(Arc<ThroughputTracker>),
}

impl Scheduler {
    /// Construct an `Adaptive` scheduler with a fresh throughput tracker.
    pub fn adaptive() -> Self {
        Scheduler::Adaptive(Arc::new(ThroughputTracker::new()))
    }

    /// Plan the minimal set of tasks needed to cover `[offset, offset+len)`
    /// given the current `state`. Already-valid leaves are skipped.
    pub fn plan(
        &self,
        offset: u64,
        len: u64,
        geometry: &TreeGeometry,
        state: &State,
    ) -> CacheResult<Vec<NodeDownloadTask>> {
        let leaves = geometry.leaves_for_byte_range(offset, len)?;
        let missing: Vec<u64> = leaves.into_iter().filter(|&l| !state.is_valid(l)).collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let threshold = match self {
            Scheduler::LeafOnly => return Ok(leaf_tasks(geometry, &missing)),
            Scheduler::Coalescing { threshold } => *threshold,
            Scheduler::Adaptive(tracker) => tracker.current_threshold(),
        };

        Ok(coalesce_tasks(geometry, &missing, threshold))
    }

    /// Feed back one completed task's throughput. A no-op for `LeafOnly`
    /// and `Coalescing`, which carry no throughput state.
    pub fn record_throughput(&self, bytes: u64, elapsed: Duration) {
        if let Scheduler::Adaptive(tracker) = self {
            tracker.record(bytes, elapsed);
        }
    }
}

fn leaf_tasks(geometry: &TreeGeometry, missing: &[u64]) -> Vec<NodeDownloadTask> {
    missing
        .iter()
        .map(|&leaf| NodeDownloadTask {
            node: geometry.node_for_leaf(leaf),
        })
        .collect()
}

/// Group `missing` into maximal contiguous runs, and for each run either
/// emit one task per internal node that exactly covers a `>= threshold`
/// sub-run (walking up from leaves while the node's full leaf range stays
/// inside the run and still needs fetching), or fall back to per-leaf
/// tasks for runs shorter than `threshold`.
fn coalesce_tasks(geometry: &TreeGeometry, missing: &[u64], threshold: u64) -> Vec<NodeDownloadTask> {
    let mut tasks = Vec::new();
    let mut i = 0;
    while i < missing.len() {
        let run_start = i;
        while i + 1 < missing.len() && missing[i + 1] == missing[i] + 1 {
            i += 1;
        }
        let run = &missing[run_start..=i];
        i += 1;

        if (run.len() as u64) < threshold {
            tasks.extend(run.iter().map(|&leaf| NodeDownloadTask {
                node: geometry.node_for_leaf(leaf),
            }));
            continue;
        }

        tasks.extend(best_covering_nodes(geometry, run[0], *run.last().unwrap()));
    }
    tasks
}

/// Largest internal nodes whose leaf range is fully contained in
/// `[first, last]` (inclusive), covering the run with the fewest tasks.
fn best_covering_nodes(geometry: &TreeGeometry, first: u64, last: u64) -> Vec<NodeDownloadTask> {
    let mut tasks = Vec::new();
    let mut cursor = first;
    while cursor <= last {
        let mut node = geometry.node_for_leaf(cursor);
        loop {
            let parent = match geometry.parent(node) {
                Some(p) => p,
                None => break,
            };
            let range = geometry.leaf_range_for_node(parent);
            if range.start < cursor || range.end == 0 || range.end - 1 > last {
                break;
            }
            node = parent;
        }
        let range = geometry.leaf_range_for_node(node);
        tasks.push(NodeDownloadTask { node });
        cursor = range.end;
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::reference::ReferenceTree;
    use std::io::Cursor;

    fn fresh_state(total_size: u64, chunk_size: u64) -> (TreeGeometry, State, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![1u8; total_size as usize];
        let reference = ReferenceTree::build(Cursor::new(content), total_size, chunk_size).unwrap();
        let geometry = *reference.geometry();
        let state = State::create(&reference, &dir.path().join("x.mrkl")).unwrap();
        (geometry, state, dir)
    }

    #[test]
    fn leaf_only_emits_one_task_per_missing_leaf() {
        let (geometry, state, _dir) = fresh_state(4096 * 4, 4096);
        let tasks = Scheduler::LeafOnly.plan(0, 4096 * 4, &geometry, &state).unwrap();
        assert_eq!(tasks.len(), 4);
    }

    #[test]
    fn already_valid_leaves_are_skipped() {
        let (geometry, mut state, _dir) = fresh_state(4096 * 4, 4096);
        state.save_if_valid(0, &[1u8; 4096], || Ok(())).unwrap();
        let tasks = Scheduler::LeafOnly.plan(0, 4096 * 4, &geometry, &state).unwrap();
        assert_eq!(tasks.len(), 3);
    }

    #[test]
    fn coalescing_collapses_a_full_run_into_fewer_tasks() {
        let (geometry, state, _dir) = fresh_state(4096 * 8, 4096);
        let tasks = Scheduler::Coalescing { threshold: 2 }
            .plan(0, 4096 * 8, &geometry, &state)
            .unwrap();
        assert!(tasks.len() < 8);
    }

    #[test]
    fn empty_plan_when_range_fully_valid() {
        let (geometry, mut state, _dir) = fresh_state(4096, 4096);
        state.save_if_valid(0, &[1u8; 4096], || Ok(())).unwrap();
        let tasks = Scheduler::LeafOnly.plan(0, 4096, &geometry, &state).unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn throughput_tracker_starts_at_the_default_threshold() {
        let tracker = ThroughputTracker::new();
        assert_eq!(tracker.current_threshold(), ADAPTIVE_START_THRESHOLD);
    }

    #[test]
    fn throughput_tracker_shrinks_after_a_degraded_sample() {
        let tracker = ThroughputTracker::new();
        tracker.record(10_000_000, Duration::from_secs(1)); // establishes the average
        tracker.record(1_000_000, Duration::from_secs(1)); // well below average
        assert!(tracker.current_threshold() < ADAPTIVE_START_THRESHOLD);
    }

    #[test]
    fn throughput_tracker_grows_after_recovering() {
        let tracker = ThroughputTracker::new();
        tracker.record(10_000_000, Duration::from_secs(1));
        tracker.record(1_000_000, Duration::from_secs(1)); // shrinks
        let shrunk = tracker.current_threshold();
        tracker.record(50_000_000, Duration::from_secs(1)); // well above average
        assert!(tracker.current_threshold() > shrunk);
    }

    #[test]
    fn throughput_tracker_never_leaves_its_bounds() {
        let tracker = ThroughputTracker::new();
        for _ in 0..20 {
            tracker.record(1, Duration::from_secs(1));
        }
        assert!(tracker.current_threshold() >= ADAPTIVE_MIN_THRESHOLD);

        let tracker = ThroughputTracker::new();
        tracker.record(1_000_000, Duration::from_secs(1));
        for _ in 0..20 {
            tracker.record(1_000_000_000, Duration::from_secs(1));
        }
        assert!(tracker.current_threshold() <= ADAPTIVE_MAX_THRESHOLD);
    }

    #[test]
    fn adaptive_scheduler_task_count_tracks_a_degrading_tracker() {
        let (geometry, state, _dir) = fresh_state(4096 * 16, 4096);
        let tracker = Arc::new(ThroughputTracker::new());
        let scheduler = Scheduler::Adaptive(tracker.clone());

        let tasks_at_default = scheduler.plan(0, 4096 * 16, &geometry, &state).unwrap();

        tracker.record(10_000_000, Duration::from_secs(1));
        tracker.record(1_000_000, Duration::from_secs(1)); // shrinks the shared threshold
        let tasks_after_degradation = scheduler.plan(0, 4096 * 16, &geometry, &state).unwrap();

        // A smaller threshold coalesces less aggressively, so the same
        // 16-leaf run now costs at least as many tasks as it did at the
        // starting threshold -- proof that `plan` is actually reading the
        // tracker rather than a hardcoded constant.
        assert!(tasks_after_degradation.len() >= tasks_at_default.len());
    }

    #[test]
    fn record_throughput_is_a_no_op_for_non_adaptive_schedulers() {
        Scheduler::LeafOnly.record_throughput(1_000, Duration::from_secs(1));
        Scheduler::Coalescing { threshold: 4 }.record_throughput(1_000, Duration::from_secs(1));
    }
}
