use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::Scheduler;

/// Top-level configuration for a verified mirror cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the `.bin` cache file, `.mrkl` state file, and
    /// `.mref` reference tree for each mirrored content descriptor.
    pub data_dir: PathBuf,
    /// Chunk size in bytes; must be a power of two `>= MIN_CHUNK_SIZE`.
    pub chunk_size: u64,
    /// Upper bound on concurrently in-flight node fetches.
    pub max_concurrent_fetches: usize,
    /// Minimum run of missing leaves the `Coalescing` scheduler will fold
    /// into a single internal-node task.
    pub coalesce_threshold: u64,
    /// Which scheduling strategy plans download tasks for a read.
    pub scheduler: Scheduler,
    /// Remote transport configuration.
    pub remote: RemoteConfig,
    /// Whether to enable debug-level logging of scheduling decisions.
    pub debug: bool,
    /// Whether `open` should HEAD-probe an already-cached reference tree
    /// against the remote and re-download it on a size/digest mismatch
    /// (spec §4.8 step 4). Off by default: the common case is an immutable
    /// remote file where the cached `.mref` never goes stale, and the
    /// check costs an extra round trip on every open.
    pub verify_freshness: bool,
}

impl CacheConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P, remote: RemoteConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            chunk_size: 4 * 1024 * 1024,
            max_concurrent_fetches: 8,
            coalesce_threshold: 4,
            scheduler: Scheduler::Coalescing { threshold: 4 },
            remote,
            debug: false,
            verify_freshness: false,
        }
    }

    /// Configuration optimized for speed: large chunks, high concurrency,
    /// aggressive coalescing, short retry patience.
    pub fn fast<P: Into<PathBuf>>(data_dir: P, remote: RemoteConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            chunk_size: 16 * 1024 * 1024,
            max_concurrent_fetches: 32,
            coalesce_threshold: 2,
            scheduler: Scheduler::Coalescing { threshold: 2 },
            remote: remote.with_retry(RetryPolicy::aggressive()),
            debug: false,
            verify_freshness: false,
        }
    }

    /// Configuration optimized for reliability over a slow or flaky
    /// remote: small chunks, modest concurrency, patient retries, and
    /// leaf-granular scheduling so a single bad leaf never drags down a
    /// large sibling range.
    pub fn reliable<P: Into<PathBuf>>(data_dir: P, remote: RemoteConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            chunk_size: 1024 * 1024,
            max_concurrent_fetches: 4,
            coalesce_threshold: 8,
            scheduler: Scheduler::LeafOnly,
            remote: remote.with_retry(RetryPolicy::patient()),
            debug: true,
            verify_freshness: true,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_verify_freshness(mut self, verify_freshness: bool) -> Self {
        self.verify_freshness = verify_freshness;
        self
    }

    pub fn with_max_concurrent_fetches(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = max;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Remote endpoint and retry behavior for range-fetch requests.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub bearer_token: Option<String>,
    pub retry: RetryPolicy,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Read the bearer token from `HF_TOKEN`, matching how hosts like
    /// Hugging Face's CDN gate large immutable file downloads.
    pub fn from_env(url: impl Into<String>) -> Self {
        let token = std::env::var("HF_TOKEN").ok();
        Self {
            url: url.into(),
            bearer_token: token,
            retry: RetryPolicy::default(),
        }
    }
}

/// Retry/backoff behavior for a single logical fetch.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, per_attempt_timeout: Duration, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            per_attempt_timeout,
            base_backoff,
        }
    }

    /// Minimal retrying, short timeouts; for fixture servers in tests.
    pub fn fast_fail() -> Self {
        Self {
            max_attempts: 2,
            per_attempt_timeout: Duration::from_secs(2),
            base_backoff: Duration::from_millis(10),
        }
    }

    /// More attempts with a shorter delay between them, for a remote
    /// known to be reachable but occasionally flaky.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 8,
            per_attempt_timeout: Duration::from_secs(15),
            base_backoff: Duration::from_millis(50),
        }
    }

    /// Generous retrying for flaky or rate-limited remotes.
    pub fn patient() -> Self {
        Self {
            max_attempts: 6,
            per_attempt_timeout: Duration::from_secs(60),
            base_backoff: Duration::from_millis(250),
        }
    }

    /// Exponential backoff with a 10s cap, 1-indexed by attempt number.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(8).saturating_sub(1);
        std::cmp::min(self.base_backoff * factor, Duration::from_secs(10))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            per_attempt_timeout: Duration::from_secs(30),
            base_backoff: Duration::from_millis(100),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new("./verimirror_data", RemoteConfig::new(""))
    }
}
