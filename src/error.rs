//! Types for working with ring and recv-buffer operation errors.

use std::fmt;

/// A specialized `Result` type for ring and recv-buffer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A list specifying general categories of recv-buffer errors.
///
/// This list is intended to grow over time and it is not recommended to
/// exhaustively match against it.
///
/// It is used with the [`Error`] type.
///
/// [`Error`]: struct.Error.html
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The underlying allocator could not satisfy a grow request.
    ///
    /// Engine state is left unchanged.
    AllocFail,
    /// A write would extend the stream past the advertised virtual length.
    ///
    /// The `needed` field carries the virtual length that would have been
    /// required to admit the write.
    ExceedsVirtual {
        /// The virtual length that would admit the rejected write.
        needed: u64,
    },
    /// A write exceeds the caller-supplied flow-control quota.
    ///
    /// The `needed` field carries the number of new bytes the write would
    /// have consumed, so the caller can decide how much credit to extend.
    FlowControl {
        /// The quota that would have been required to admit the write.
        needed: u64,
    },
    /// A read was attempted with no data ready, or with a previous read
    /// still checked out under a mode that permits only one outstanding
    /// read at a time.
    ///
    /// This is transient: the same call may succeed later.
    Unavailable,
    /// The caller violated a documented precondition (e.g. draining more
    /// than is checked out, shrinking the ring, a non-power-of-two size, or
    /// presenting a stale/out-of-order read token).
    ///
    /// This always indicates a caller bug.
    PreconditionViolation(&'static str),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ErrorKind::AllocFail => write!(fmt, "allocator could not satisfy the request"),
            ErrorKind::ExceedsVirtual { needed } => {
                write!(fmt, "write exceeds virtual length (would need {})", needed)
            }
            ErrorKind::FlowControl { needed } => {
                write!(fmt, "write exceeds flow-control quota (would need {})", needed)
            }
            ErrorKind::Unavailable => write!(fmt, "no data ready or a prior read is still pending"),
            ErrorKind::PreconditionViolation(msg) => write!(fmt, "precondition violated: {}", msg),
        }
    }
}

/// A list specifying which operation produced an [`Error`].
///
/// [`Error`]: struct.Error.html
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum Operation {
    /// The ring or recv-buffer could not be initialized.
    Initialize,
    /// A write into the recv-buffer failed.
    Write,
    /// A read from the recv-buffer failed.
    Read,
    /// A drain of previously read bytes failed.
    Drain,
    /// A resize (grow) of the ring's physical allocation failed.
    Resize,
    /// Raising the virtual length ceiling failed.
    GrowVirtual,
}

impl Operation {
    /// Returns a display message fragment describing the `Operation`.
    pub fn as_str(&self) -> &'static str {
        match *self {
            Operation::Initialize => "initialize",
            Operation::Write => "write",
            Operation::Read => "read",
            Operation::Drain => "drain",
            Operation::Resize => "resize",
            Operation::GrowVirtual => "grow virtual length",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// An error produced by a [`Ring`](crate::Ring) or
/// [`RecvBuffer`](crate::RecvBuffer) operation.
#[non_exhaustive]
pub struct Error {
    kind: ErrorKind,
    op: Operation,
}

impl Error {
    /// Constructs an error from its kind and the operation that produced it.
    pub fn new(op: Operation, kind: ErrorKind) -> Self {
        Self { kind, op }
    }

    /// Returns the category of failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the operation that produced this error.
    pub fn operation(&self) -> Operation {
        self.op
    }
}

impl std::error::Error for Error {}

impl fmt::Debug for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Error")
            .field("op", &self.op)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "failed to {}: {}", self.op, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_operation_and_kind() {
        let err = Error::new(Operation::Write, ErrorKind::FlowControl { needed: 100 });
        let msg = err.to_string();
        assert!(msg.contains("write"));
        assert!(msg.contains("100"));
    }
}
