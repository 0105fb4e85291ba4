//! Public random-access read API: suspends readers until the bytes they
//! asked for are present and hash-verified, then serves them from the
//! cache file.

use std::sync::Arc;

use parking_lot::Mutex;
use url::Url;

use crate::cache_file::CacheFile;
use crate::config::CacheConfig;
use crate::coordinator::DownloadCoordinator;
use crate::errors::{CacheError, CacheResult};
use crate::initializer::{self, OpenPaths};
use crate::progress::{NullProgressSink, ProgressSink};
use crate::state::State;
use crate::transport::Transport;
use crate::tree::reference::ReferenceTree;

/// A verified, randomly-readable view over a remote file's local mirror.
pub struct VerifiedChannel {
    reference: ReferenceTree,
    state: Arc<Mutex<State>>,
    cache_file: Arc<CacheFile>,
    coordinator: DownloadCoordinator,
    progress: Box<dyn ProgressSink>,
}

impl VerifiedChannel {
    pub fn new(
        reference: ReferenceTree,
        state: Arc<Mutex<State>>,
        cache_file: Arc<CacheFile>,
        coordinator: DownloadCoordinator,
    ) -> Self {
        Self {
            reference,
            state,
            cache_file,
            coordinator,
            progress: Box::new(NullProgressSink),
        }
    }

    pub fn with_progress_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Open (or create) the on-disk mirror for `content_name` under
    /// `config.data_dir`, wiring together the initializer, transport, and
    /// download coordinator the way a caller otherwise would by hand.
    ///
    /// `content_name` is both the cache/state file stem and the path
    /// segment appended to `config.remote.url` to form the remote URL.
    pub async fn open(config: &CacheConfig, content_name: &str) -> CacheResult<Self> {
        let cache_path = config.data_dir.join(format!("{content_name}.bin"));
        let state_path = config.data_dir.join(format!("{content_name}.mrkl"));
        let paths = OpenPaths::new(cache_path, state_path);

        let base = Url::parse(&config.remote.url)
            .map_err(|e| CacheError::InvalidArgument(format!("bad remote url: {e}")))?;
        let remote_url = base
            .join(content_name)
            .map_err(|e| CacheError::InvalidArgument(format!("bad remote url: {e}")))?;

        let transport = Arc::new(Transport::new(
            remote_url.clone(),
            config.remote.bearer_token.clone(),
            config.remote.retry,
        )?);

        let opened = initializer::open(&paths, &remote_url, &transport, config.verify_freshness).await?;
        let geometry = *opened.reference.geometry();

        let coordinator = DownloadCoordinator::new(
            transport,
            opened.cache_file.clone(),
            opened.state.clone(),
            geometry,
            config.scheduler,
            config.max_concurrent_fetches,
        );

        Ok(Self::new(
            opened.reference,
            opened.state,
            opened.cache_file,
            coordinator,
        ))
    }

    /// Logical size of the mirrored content, independent of how much of
    /// the sparse cache file has actually been materialized.
    pub fn size(&self) -> u64 {
        self.reference.geometry().total_size()
    }

    /// Read `len` bytes at `off`, fetching and verifying whatever is
    /// missing first. `off + len` is clamped to `size()`.
    pub async fn read_at(&self, off: u64, len: u64) -> CacheResult<Vec<u8>> {
        let total_size = self.size();
        if off > total_size {
            return Err(CacheError::InvalidArgument(format!(
                "offset {off} beyond content size {total_size}"
            )));
        }
        let clamped_len = std::cmp::min(len, total_size - off);
        if clamped_len == 0 {
            return Ok(Vec::new());
        }

        self.progress.started(off, clamped_len);
        self.coordinator.ensure_covering(off, clamped_len).await?;
        self.progress.completed(off, clamped_len);

        Ok(self.cache_file.read_at(off, clamped_len))
    }

    /// Copy into `buf`, returning the number of bytes copied (may be less
    /// than `buf.len()` only when it runs past `size()`).
    pub async fn read(&self, off: u64, buf: &mut [u8]) -> CacheResult<usize> {
        let bytes = self.read_at(off, buf.len() as u64).await?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Flush validity state to disk. In-flight fetches are not cancelled.
    pub fn close(&self) -> CacheResult<()> {
        self.state.lock().flush()
    }
}
