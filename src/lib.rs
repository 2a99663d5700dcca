//! A verified circular-buffer primitive and the out-of-order stream
//! receive-buffer built on top of it.
//!
//! This crate absorbs byte ranges arriving out of order from a reliable
//! byte-stream transport (QUIC-style), reassembles them into a contiguous
//! prefix, and exposes that prefix for zero-copy consumer reads. Two layers:
//!
//! - [`Ring`] — a power-of-two circular byte store with a moving read head.
//!   Mechanical only: it knows nothing about stream offsets or gaps.
//! - [`RecvBuffer`] — wraps a `Ring` with absolute stream offsets, an
//!   out-of-order gap tracker, flow-control quota accounting, and a
//!   read/drain protocol selected by [`ReadMode`].

#![deny(missing_docs)]

pub mod error;
mod gap;
mod recv;
mod ring;

pub use crate::error::{Error, ErrorKind, Operation, Result};
pub use crate::recv::{Inspect, ReadMode, ReadSpans, ReadToken, RecvBuffer, RecvBufferConfig, WriteOutcome};
pub use crate::ring::Ring;
