//! Assembler: rebuild one payload from an incoming container sequence.
//!
//! A single assembler instance tracks at most one in-flight payload per
//! channel. Interleaving two payloads on one channel is a protocol violation
//! and resets the state machine. CONTROL containers never enter the
//! assembler; callers route them before feeding.
//!
//! State machine:
//! - Idle → FIRST: start reassembly (or complete immediately for a
//!   single-container payload)
//! - Active → SUBSEQUENT with matching tid and sequence: append
//! - anything else: typed error, state reset

use bytes::{Bytes, BytesMut};

use super::container::{Container, ContainerKind};
use crate::error::{BlerpcError, Result};

/// Default cap on a reassembled payload, matching the firmware's assembler
/// buffer size.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

/// Outcome of feeding one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResult {
    /// More containers are needed.
    Incomplete,
    /// The payload is complete; the assembler is idle again.
    Complete(Bytes),
}

/// Single-stream payload reassembler. See the module docs for the state
/// machine.
#[derive(Debug)]
pub struct Assembler {
    active: bool,
    expected_tid: u8,
    expected_seq: u8,
    total_length: usize,
    buffer: BytesMut,
    max_payload: usize,
}

impl Assembler {
    /// Create an assembler that accepts payloads up to `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            active: false,
            expected_tid: 0,
            expected_seq: 0,
            total_length: 0,
            buffer: BytesMut::new(),
            max_payload,
        }
    }

    /// Whether a reassembly is in flight.
    #[inline]
    pub fn active(&self) -> bool {
        self.active
    }

    /// Drop any in-flight reassembly and return to idle.
    pub fn reset(&mut self) {
        self.active = false;
        self.buffer.clear();
    }

    /// Feed one FIRST or SUBSEQUENT container.
    ///
    /// Returns `Complete` with the payload when the announced total length
    /// has been received, `Incomplete` otherwise. Any violation (gap, tid
    /// mismatch, overflow, out-of-place container) returns the typed error
    /// and resets the assembler.
    pub fn feed(&mut self, container: &Container<'_>) -> Result<FeedResult> {
        match container.kind {
            ContainerKind::Control(_) => {
                Err(BlerpcError::MalformedFrame("control container fed to assembler"))
            }
            ContainerKind::First { total_length } => self.feed_first(container, total_length),
            ContainerKind::Subsequent => self.feed_subsequent(container),
        }
    }

    fn feed_first(&mut self, container: &Container<'_>, total_length: u16) -> Result<FeedResult> {
        if self.active {
            self.reset();
            return Err(BlerpcError::UnexpectedFirst);
        }

        let total_length = total_length as usize;
        if total_length > self.max_payload {
            return Err(BlerpcError::Overflow {
                got: total_length,
                limit: self.max_payload,
            });
        }
        if container.payload.len() > total_length {
            return Err(BlerpcError::Overflow {
                got: container.payload.len(),
                limit: total_length,
            });
        }

        self.buffer.clear();
        self.buffer.reserve(total_length);
        self.buffer.extend_from_slice(container.payload);

        if container.payload.len() == total_length {
            return Ok(FeedResult::Complete(self.buffer.split().freeze()));
        }

        self.active = true;
        self.expected_tid = container.transaction_id;
        self.expected_seq = container.sequence_number.wrapping_add(1);
        self.total_length = total_length;
        Ok(FeedResult::Incomplete)
    }

    fn feed_subsequent(&mut self, container: &Container<'_>) -> Result<FeedResult> {
        if !self.active {
            return Err(BlerpcError::UnexpectedSubsequent);
        }

        if container.transaction_id != self.expected_tid {
            let expected = self.expected_tid;
            self.reset();
            return Err(BlerpcError::TidMismatch {
                expected,
                got: container.transaction_id,
            });
        }
        if container.sequence_number != self.expected_seq {
            let expected = self.expected_seq;
            self.reset();
            return Err(BlerpcError::SequenceGap {
                expected,
                got: container.sequence_number,
            });
        }

        if self.buffer.len() + container.payload.len() > self.total_length {
            let got = self.buffer.len() + container.payload.len();
            let limit = self.total_length;
            self.reset();
            return Err(BlerpcError::Overflow { got, limit });
        }

        self.buffer.extend_from_slice(container.payload);
        self.expected_seq = self.expected_seq.wrapping_add(1);

        if self.buffer.len() == self.total_length {
            self.active = false;
            return Ok(FeedResult::Complete(self.buffer.split().freeze()));
        }
        Ok(FeedResult::Incomplete)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}
