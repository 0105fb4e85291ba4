use std::fmt;

/// Error taxonomy for the verified mirror cache
#[derive(Debug)]
pub enum CacheError {
    /// Offsets/lengths out of range, non-power-of-two chunk size, mismatched hash length
    InvalidArgument(String),
    /// Exactly one of {cache file, state file} exists at open time
    InvalidState(String),
    /// Footer version unsupported, digest mismatch on load, incomplete file
    Corrupt(String),
    /// Underlying file/socket error
    Io(std::io::Error),
    /// Non-206 on ranged GET, wrong Content-Length, malformed Content-Range
    Protocol(String),
    /// Fetched bytes failed hash verification against the reference leaf hash
    Integrity { leaf_index: u64 },
    /// Operation cancelled by caller
    Cancelled,
    /// Per-attempt timeout budget exhausted
    Timeout,
    /// Retry budget exhausted after transient failures
    Exhausted(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            CacheError::InvalidState(msg) => write!(f, "invalid on-disk state: {msg}"),
            CacheError::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            CacheError::Io(err) => write!(f, "io error: {err}"),
            CacheError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            CacheError::Integrity { leaf_index } => {
                write!(f, "integrity check failed for leaf {leaf_index}")
            }
            CacheError::Cancelled => write!(f, "operation cancelled"),
            CacheError::Timeout => write!(f, "operation timed out"),
            CacheError::Exhausted(msg) => write!(f, "retry budget exhausted: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CacheError::Timeout
        } else if err.is_status() || err.is_decode() {
            CacheError::Protocol(err.to_string())
        } else {
            CacheError::Exhausted(err.to_string())
        }
    }
}

impl From<url::ParseError> for CacheError {
    fn from(err: url::ParseError) -> Self {
        CacheError::InvalidArgument(format!("bad url: {err}"))
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
