//! verimirror - virtualized, on-demand, integrity-verified local mirror of
//! a large immutable remote file, exposed through a random-access byte
//! interface.
//!
//! A reader asks for bytes by `(offset, length)`; every byte returned has
//! been cryptographically verified against a precomputed Merkle tree
//! before being observed. Bytes not yet cached are fetched over HTTP range
//! requests in fixed-size chunks, validated, written into a sparse cache
//! file, and remembered as valid in a persistent bitmap so later reads are
//! served locally.
//!
//! The public entry point is [`VerifiedChannel::open`], which wires the
//! [`initializer`], [`transport`], [`coordinator`], and [`state`] modules
//! together for one mirrored content descriptor.

pub mod cache_file;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod geometry;
pub mod initializer;
pub mod progress;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod tree;
pub mod utils;

pub use cache_file::CacheFile;
pub use channel::VerifiedChannel;
pub use config::{CacheConfig, RemoteConfig, RetryPolicy};
pub use coordinator::DownloadCoordinator;
pub use errors::{CacheError, CacheResult};
pub use geometry::{NodeIndex, TreeGeometry};
pub use progress::{NullProgressSink, ProgressSink};
pub use scheduler::{NodeDownloadTask, Scheduler};
pub use state::State;
pub use transport::Transport;
pub use tree::ReferenceTree;
pub use utils::Hash;
