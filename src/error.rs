//! Error types shared by every primitive in the crate.
//!
//! Blocking and protocol operations return [`Result`]; the variants map the
//! failure classes the primitives can report. Programmer errors that have no
//! sensible recovery (a zero queue capacity, a hold count pushed past its
//! field width) panic instead, and are documented on the operations that can
//! raise them.

use thiserror::Error;

/// Errors reported by locks, conditions, and the concurrent collections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// A parameter was rejected, such as a condition passed to a lock it
    /// does not belong to.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A lock protocol violation: unlocking a lock the calling thread does
    /// not hold, waiting on a condition without its lock, or releasing more
    /// read holds than were taken.
    #[error("monitor state violation: {0}")]
    MonitorState(&'static str),

    /// The calling thread was interrupted before or while blocking.
    #[error("interrupted while waiting")]
    Interrupted,

    /// A deadline-bounded wait reached its deadline.
    #[error("wait timed out")]
    Timeout,

    /// An element was requested from an empty container.
    #[error("no such element: {0}")]
    NoSuchElement(&'static str),

    /// The operation cannot proceed in the container's current state, such
    /// as a non-blocking add on a full queue.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// A positional operation addressed an index outside the sequence.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// The sequence length at the time of the call.
        len: usize,
    },

    /// A sub-list observed that its parent's backing array was replaced.
    #[error("concurrent modification of the backing array")]
    ConcurrentModification,
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
