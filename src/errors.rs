/*!
 * Error types for recording onto and differentiating a [Tape](crate::tape::Tape).
 *
 * None of these errors are recoverable for the evaluation that raised them. A caller may
 * report them, and should [abandon](crate::tape::Tape::abandon) the frame that was being
 * recorded, but must not retry against the same tape state expecting a different answer.
 */

use crate::tape::Location;

use std::thread::ThreadId;

/**
 * An error raised by the forward or backward pass.
 */
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TapeError {
    /**
     * A primitive function was called on the tape without a registered derivative.
     */
    #[error("elemental `{name}` has no registered derivative")]
    UnregisteredElemental { name: &'static str },
    /**
     * An elemental was registered under a name that is already taken.
     */
    #[error("elemental `{name}` is already registered")]
    DuplicateElemental { name: &'static str },
    /**
     * `gradient` or `abandon` was called, or an operation recorded, with no open frame.
     */
    #[error("no open frame, every enter must be matched by exactly one gradient")]
    FrameStackUnderflow,
    /**
     * `gradient` was called twice for the same `enter`.
     */
    #[error("gradient called twice without a new evaluation in between")]
    DoublePop,
    /**
     * A tape with an open frame was accessed from a thread other than the one that opened it.
     */
    #[error("tape opened on thread {owner:?} was accessed from thread {accessor:?}")]
    ConcurrentTapeMutation { owner: ThreadId, accessor: ThreadId },
    /**
     * A parameter was registered with `variable` after other operations had already been
     * recorded in the frame.
     */
    #[error("variable {location} registered after the frame started recording")]
    LateVariable { location: Location },
    /**
     * `gradient` was called on a frame that never marked its result with `ret`.
     */
    #[error("frame has no result to differentiate, call ret before gradient")]
    MissingResult,
    /**
     * A location does not refer to a live cell, usually because the frame it was
     * allocated in has already been popped.
     */
    #[error("location {location} does not refer to a live cell")]
    InvalidLocation { location: Location },
    /**
     * A nested frame differentiated with `gradient` wrote to a cell that outlives it. The
     * enclosing frame cannot see through a popped frame, so its own gradient would be wrong.
     * Use `leave` to return from a nested call whose result the caller differentiates.
     */
    #[error("nested frame wrote to {location}, which belongs to an enclosing frame")]
    EscapingWrite { location: Location },
    /**
     * A previous backward pass panicked part way through, leaving the tape half replayed.
     * The tape must be reset before it is used again.
     */
    #[error("a backward pass on this tape was interrupted, reset it before further use")]
    InterruptedReplay,
    /**
     * An operation was given the wrong number of operands.
     */
    #[error("{operation} expects {expected} arguments but was given {found}")]
    Arity {
        operation: &'static str,
        expected: usize,
        found: usize,
    },
}
