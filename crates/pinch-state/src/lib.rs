//! pinch-state: shared session state
//!
//! The two process-wide registries every HTTP handler and every transform
//! supervisor touches, plus the TTL garbage collector:
//!
//! - [`WriterRegistry`]: at-most-one open write descriptor per handle
//! - [`ResultStore`]: terminal pipeline results with blocking waiters
//! - [`gc`]: per-handle TTL sweep with a session re-use guard
//!
//! Both registries are concurrent maps; callers never hold a map reference
//! across a suspension point.

pub mod gc;
pub mod results;
pub mod writers;

pub use results::{Checksums, PipelineResult, Reclaim, ResultStore};
pub use writers::{WriterRegistry, WriterSlot};

use std::sync::atomic::{AtomicU64, Ordering};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Mint the next session nonce.
///
/// The nonce is the garbage collector's re-use guard key: two sessions that
/// happen to share a handle token can never share a nonce, which is what a
/// start timestamp cannot guarantee.
pub fn next_session() -> u64 {
    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
}
