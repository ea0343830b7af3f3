//! Error types surfaced by the engine.
//!
//! Per the failure taxonomy this crate implements: allocation failures and
//! codec mismatches are recoverable and local, so they are returned as
//! `Result`s without partial mutation of the affected structure. Collective
//! communication failures are job-fatal in spirit, but are still represented
//! as a variant (rather than a panic) so that tests can observe them.

use thiserror::Error;

/// Errors produced by map, distributed-map, and MapReduce operations.
#[derive(Debug, Error)]
pub enum HpmapError {
    /// A `reserve` or rehash could not allocate the new bucket array.
    ///
    /// The map is left exactly as it was before the operation: either the
    /// pre-rehash or the post-rehash array, never a partial mix of the two.
    #[error("allocation failed while resizing the table")]
    Allocation,

    /// A value or key failed to decode from its wire representation.
    ///
    /// This is local and recoverable at the level of the collective
    /// exchange as a whole: one peer's buffer failing to decode aborts
    /// processing of the *rest of that buffer* (the pair framing is lost
    /// once a decode fails partway through), but every other peer's buffer
    /// still applies, and outboxes are still cleared before this error is
    /// returned to the caller.
    #[error("failed to decode value: {0}")]
    CodecDecode(String),

    /// A collective operation (`barrier`, `all_to_all`, `all_reduce_sum`)
    /// could not complete.
    ///
    /// Conceptually this is fatal at the job level -- callers that want
    /// abort-on-failure semantics should simply propagate this with `?`
    /// rather than handle it.
    #[error("collective communication failed: {0}")]
    Collective(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HpmapError>;
