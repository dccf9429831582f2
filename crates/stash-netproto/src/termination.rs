//! Exchange termination rules.
//!
//! A session carries one login exchange followed by one transfer exchange
//! (backup, list or fetch). Each sender numbers the frames of an exchange from
//! zero. The predicates below decide, per operation and direction, when an
//! exchange or the whole session has finished.

use crate::{
    frame::Frame,
    op::{Operation, Status},
};

/// Outcome of observing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// More frames belong to the current exchange.
    Continue,
    /// The current exchange finished; the session goes on.
    ExchangeDone,
    /// Nothing more will travel in this direction.
    SessionDone,
}

impl Verdict {
    pub fn ends_exchange(self) -> bool {
        !matches!(self, Verdict::Continue)
    }
}

/// Which way a frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Client to server.
    Request,
    /// Server to client.
    Reply,
}

/// Termination rule for client-to-server frames.
///
/// Only the end-of-file write-chunk ends the request side; list and fetch are
/// single-shot requests that finish when the server says so.
pub fn request_verdict(op: Operation, status: u8, in_sequence: bool) -> Verdict {
    match op {
        Operation::WriteChunk if status == Status::Final as u8 && in_sequence => {
            Verdict::SessionDone
        }
        _ => Verdict::Continue,
    }
}

/// Termination rule for server-to-client frames.
pub fn reply_verdict(op: Operation, status: u8, in_sequence: bool) -> Verdict {
    let failed = Status::is_error_code(status);
    let last = status == Status::Final as u8 && in_sequence;

    match op {
        // The port negotiation reply is the only frame on that connection.
        Operation::PortRequest => Verdict::SessionDone,
        // Single-frame replies; failures are fatal for the session.
        Operation::Login | Operation::StartBackup => {
            if failed {
                Verdict::SessionDone
            } else {
                Verdict::ExchangeDone
            }
        }
        Operation::WriteChunk => {
            if failed || last {
                Verdict::SessionDone
            } else {
                Verdict::Continue
            }
        }
        // A failed list/fetch may be retried on the same connection.
        Operation::ListBackups | Operation::FetchBackup => {
            if failed {
                Verdict::ExchangeDone
            } else if last {
                Verdict::SessionDone
            } else {
                Verdict::Continue
            }
        }
    }
}

/// Result of [`ExchangeTracker::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub verdict: Verdict,
    /// Sequence number the tracker expected for this frame.
    pub expected: u32,
    pub in_sequence: bool,
}

/// Running per-direction sequence counter plus the termination predicate for
/// that direction.
///
/// The counter restarts at zero whenever the operation code changes or an
/// exchange finishes.
#[derive(Debug, Clone)]
pub struct ExchangeTracker {
    side: Side,
    current_op: Option<u8>,
    next_sequence: u32,
}

impl ExchangeTracker {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            current_op: None,
            next_sequence: 0,
        }
    }

    pub fn requests() -> Self {
        Self::new(Side::Request)
    }

    pub fn replies() -> Self {
        Self::new(Side::Reply)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn observe(&mut self, frame: &Frame) -> Observation {
        if self.current_op != Some(frame.operation) {
            self.current_op = Some(frame.operation);
            self.next_sequence = 0;
        }

        let expected = self.next_sequence;
        let in_sequence = frame.sequence == expected;
        self.next_sequence = expected.wrapping_add(1);

        let verdict = match frame.op() {
            Some(op) => match self.side {
                Side::Request => request_verdict(op, frame.status, in_sequence),
                Side::Reply => reply_verdict(op, frame.status, in_sequence),
            },
            None => Verdict::Continue,
        };

        if verdict.ends_exchange() {
            self.current_op = None;
            self.next_sequence = 0;
        }

        Observation {
            verdict,
            expected,
            in_sequence,
        }
    }
}
