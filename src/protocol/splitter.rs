//! Splitter: cut a payload into a sequence of containers sized to the MTU.
//!
//! A payload of any length (up to the u16 total-length field) becomes one
//! FIRST container followed by zero or more SUBSEQUENT containers. Sequence
//! numbers count 0, 1, 2, … with u8 wraparound; the receiver tracks them with
//! the same arithmetic.
//!
//! # Example
//!
//! ```
//! use blerpc::protocol::{split, ContainerKind};
//!
//! let payload = [0xAB; 100];
//! let containers: Vec<_> = split(&payload, 1, 27).collect();
//! assert!(containers.len() >= 2);
//! assert_eq!(containers[0].kind, ContainerKind::First { total_length: 100 });
//! let total: usize = containers.iter().map(|c| c.payload.len()).sum();
//! assert_eq!(total, 100);
//! ```

use super::container::{
    Container, ContainerKind, ATT_OVERHEAD, FIRST_HEADER_SIZE, SHORT_HEADER_SIZE,
};

/// Minimum ATT MTU; anything smaller is clamped up to this.
pub const MIN_MTU: u16 = 23;

/// Payload capacity of a FIRST container at the given MTU.
#[inline]
pub fn first_capacity(mtu: u16) -> usize {
    capacity(mtu, FIRST_HEADER_SIZE)
}

/// Payload capacity of a SUBSEQUENT container at the given MTU.
#[inline]
pub fn subsequent_capacity(mtu: u16) -> usize {
    capacity(mtu, SHORT_HEADER_SIZE)
}

fn capacity(mtu: u16, header: usize) -> usize {
    let effective = mtu.max(MIN_MTU) as usize - ATT_OVERHEAD - header;
    // payload_len is a single byte on the wire
    effective.min(u8::MAX as usize)
}

/// Split `payload` into containers sized to `mtu`, all carrying `tid`.
///
/// A zero-length payload yields exactly one FIRST container with
/// `payload_len = 0`. The iterator borrows `payload`; nothing is copied
/// until serialization.
pub fn split(payload: &[u8], tid: u8, mtu: u16) -> Split<'_> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    Split {
        payload,
        tid,
        mtu,
        offset: 0,
        seq: 0,
        done: false,
    }
}

/// Iterator over the containers of one payload. See [`split`].
pub struct Split<'a> {
    payload: &'a [u8],
    tid: u8,
    mtu: u16,
    offset: usize,
    seq: u8,
    done: bool,
}

impl<'a> Iterator for Split<'a> {
    type Item = Container<'a>;

    fn next(&mut self) -> Option<Container<'a>> {
        if self.done {
            return None;
        }

        let first = self.offset == 0 && self.seq == 0;
        let cap = if first {
            first_capacity(self.mtu)
        } else {
            subsequent_capacity(self.mtu)
        };
        let len = cap.min(self.payload.len() - self.offset);
        let chunk = &self.payload[self.offset..self.offset + len];
        self.offset += len;
        if self.offset >= self.payload.len() {
            self.done = true;
        }

        let kind = if first {
            ContainerKind::First {
                total_length: self.payload.len() as u16,
            }
        } else {
            ContainerKind::Subsequent
        };
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        Some(Container {
            transaction_id: self.tid,
            sequence_number: seq,
            kind,
            payload: chunk,
        })
    }
}

/// Stateful splitter owning the transaction-id counter and the channel MTU.
#[derive(Debug)]
pub struct Splitter {
    mtu: u16,
    next_tid: u8,
}

impl Splitter {
    /// Create a splitter for a channel with the given MTU.
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu: mtu.max(MIN_MTU),
            next_tid: 0,
        }
    }

    /// The channel MTU this splitter was sized for.
    #[inline]
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Return the next transaction id and post-increment the counter.
    ///
    /// Wraps at 256; the id is not a uniqueness key.
    pub fn next_transaction_id(&mut self) -> u8 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    /// Split `payload` under the splitter's MTU. See [`split`].
    pub fn split<'a>(&self, payload: &'a [u8], tid: u8) -> Split<'a> {
        split(payload, tid, self.mtu)
    }
}
