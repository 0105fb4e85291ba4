//! Optional progress reporting sink for long-running fetches.

/// Receives coarse progress notifications from a `VerifiedChannel`. All
/// methods default to no-ops so callers only implement what they need.
pub trait ProgressSink: Send + Sync {
    fn started(&self, _offset: u64, _len: u64) {}
    fn progress(&self, _leaves_fetched: u64, _leaves_total: u64) {}
    fn completed(&self, _offset: u64, _len: u64) {}
}

/// A sink that does nothing, used when no caller-supplied sink is given.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {}
