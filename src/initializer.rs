//! Enforces the three legal on-disk states for a mirrored content
//! descriptor at open time, and materializes a fresh one when neither the
//! cache nor the state file exists yet.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use url::Url;

use crate::cache_file::CacheFile;
use crate::errors::{CacheError, CacheResult};
use crate::state::State;
use crate::transport::Transport;
use crate::tree::footer::{Footer, FOOTER_LEN};
use crate::tree::reference::ReferenceTree;

/// Paths this crate manages for one mirrored content descriptor.
pub struct OpenPaths {
    pub cache_path: PathBuf,
    pub state_path: PathBuf,
    pub ref_path: PathBuf,
}

impl OpenPaths {
    pub fn new(cache_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        let cache_path = cache_path.into();
        let mut state_path = state_path.into();
        if state_path.extension().and_then(|e| e.to_str()) != Some("mrkl") {
            state_path.set_extension("mrkl");
        }
        let ref_path = {
            let mut p = cache_path.clone().into_os_string();
            p.push(".mref");
            PathBuf::from(p)
        };
        Self {
            cache_path,
            state_path,
            ref_path,
        }
    }
}

/// Result of a successful open: the three live components a
/// `VerifiedChannel` wraps.
pub struct OpenedContent {
    pub reference: ReferenceTree,
    pub state: Arc<Mutex<State>>,
    pub cache_file: Arc<CacheFile>,
}

/// Open (or create) the on-disk state for `remote_url`'s content, enforcing
/// the legal-state case table.
pub async fn open(
    paths: &OpenPaths,
    remote_url: &Url,
    transport: &Transport,
    verify_freshness: bool,
) -> CacheResult<OpenedContent> {
    let cache_exists = paths.cache_path.exists();
    let state_exists = paths.state_path.exists();

    match (cache_exists, state_exists) {
        (true, true) => {
            info!("initializer: cache and state both present, opening as-is");
            let mut reference = ReferenceTree::load(&paths.ref_path)?;
            let mut state = State::load(&reference, &paths.state_path)?;

            // A mismatch here means the remote's reference tree changed
            // underneath us. Only safe to silently re-shape the bitmap
            // when no partial progress would be lost: either nothing has
            // been verified yet, or everything has (in which case the old
            // bytes are suspect anyway and are refetched under the new
            // hashes).
            let safe_to_refresh = state.valid_chunks().is_empty() || state.all_valid();
            if verify_freshness && safe_to_refresh {
                if let Some(refreshed) =
                    check_reference_freshness(paths, remote_url, transport, &reference).await?
                {
                    state = State::create(&refreshed, &paths.state_path)?;
                    reference = refreshed;
                }
            }

            let cache_file = CacheFile::open(&paths.cache_path, reference.geometry().total_size())?;
            Ok(OpenedContent {
                reference,
                state: Arc::new(Mutex::new(state)),
                cache_file: Arc::new(cache_file),
            })
        }
        (false, false) => {
            info!("initializer: neither cache nor state present, materializing fresh");
            create_fresh(paths, remote_url, transport).await
        }
        (true, false) | (false, true) => Err(CacheError::InvalidState(format!(
            "exactly one of cache ({cache_exists}) and state ({state_exists}) exists for {}",
            paths.cache_path.display()
        ))),
    }
}

async fn create_fresh(
    paths: &OpenPaths,
    remote_url: &Url,
    transport: &Transport,
) -> CacheResult<OpenedContent> {
    let ref_url = append_suffix(remote_url, ".mrkl")?;
    info!("initializer: downloading reference tree from {ref_url}");
    let ref_bytes = transport.fetch_whole(&ref_url).await?;
    write_atomic(&paths.ref_path, &ref_bytes)?;

    let reference = ReferenceTree::load(&paths.ref_path)?;
    info!("initializer: creating empty state for {} leaves", reference.geometry().n_leaves());
    let state = State::create(&reference, &paths.state_path)?;
    let cache_file = CacheFile::open(&paths.cache_path, reference.geometry().total_size())?;

    Ok(OpenedContent {
        reference,
        state: Arc::new(Mutex::new(state)),
        cache_file: Arc::new(cache_file),
    })
}

/// HEAD-probe the remote reference file and compare sizes and the footer's
/// `fileDigest` against what's cached locally; on mismatch, re-download to a
/// temp path and atomically replace, returning the refreshed tree. Returns
/// `Ok(None)` when the local copy is already current.
///
/// A size change alone is conclusive (different leaf count). When the size
/// matches, the footer's `file_digest` is the authoritative check: it covers
/// every leaf hash, so two trees over equal-length content with different
/// bytes still diverge there even though the file's byte length doesn't
/// change. That footer is fetched with a single ranged GET rather than
/// downloading the whole (potentially huge) reference file just to compare.
async fn check_reference_freshness(
    paths: &OpenPaths,
    remote_url: &Url,
    transport: &Transport,
    local: &ReferenceTree,
) -> CacheResult<Option<ReferenceTree>> {
    let ref_url = append_suffix(remote_url, ".mrkl")?;
    let remote_len = transport.probe_url(&ref_url).await?;
    let local_len = std::fs::metadata(&paths.ref_path)?.len();

    if remote_len == local_len {
        if remote_len < FOOTER_LEN as u64 {
            return Ok(None);
        }
        let footer_bytes = transport
            .fetch_range(remote_len - FOOTER_LEN as u64, FOOTER_LEN as u64)
            .await?;
        let remote_footer = Footer::from_bytes(&footer_bytes)?;
        if remote_footer.file_digest == local.file_digest() {
            return Ok(None);
        }
    }

    warn!("initializer: remote reference tree changed, re-downloading {ref_url}");
    let ref_bytes = transport.fetch_whole(&ref_url).await?;
    write_atomic(&paths.ref_path, &ref_bytes)?;
    let refreshed = ReferenceTree::load(&paths.ref_path)?;
    Ok(Some(refreshed))
}

fn append_suffix(url: &Url, suffix: &str) -> CacheResult<Url> {
    let mut out = url.clone();
    let mut path = out.path().to_string();
    path.push_str(suffix);
    out.set_path(&path);
    Ok(out)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CacheError::InvalidArgument("path has no parent directory".to_string()))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.persist(path).map_err(|e| CacheError::Io(e.error))?;
    Ok(())
}
