//! Transport module - the duplex channel contract the core consumes.
//!
//! The core is transport-neutral: any channel that delivers complete frames
//! in order, in both directions, satisfies [`Channel`]. The reference BLE
//! wiring is a GATT characteristic with write-without-response + notify
//! (UUIDs below), but the in-memory implementation in [`mem`] is every bit
//! as valid and is what the tests and demos run on.

pub mod mem;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{BlerpcError, Result};

/// GATT service UUID used by the reference BLE channel wiring.
pub const SERVICE_UUID: &str = "12340001-0000-1000-8000-00805f9b34fb";

/// GATT characteristic UUID (write-without-response + notify).
pub const CHARACTERISTIC_UUID: &str = "12340002-0000-1000-8000-00805f9b34fb";

/// A device discovered during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    /// Transport address (BLE MAC or platform identifier).
    pub address: String,
    /// Advertised name, when present.
    pub name: Option<String>,
    /// Signal strength at scan time, when known.
    pub rssi: Option<i16>,
}

/// A connected duplex frame channel.
///
/// Implementations must uphold:
/// - `write` delivers one complete container frame, preserving order with
///   other writes; a full outbound queue fails with the transient
///   [`BlerpcError::WriteBufferFull`].
/// - `recv` yields complete inbound frames in arrival order from a
///   single-consumer queue.
pub trait Channel: Send {
    /// Current effective ATT MTU.
    fn mtu(&self) -> u16;

    /// Write one frame (write-without-response).
    fn write(&mut self, frame: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next inbound notification.
    fn recv(&mut self) -> impl Future<Output = Result<Bytes>> + Send;

    /// Wait for the next inbound notification, failing with
    /// [`BlerpcError::Timeout`] if none arrives in time.
    fn recv_timeout(&mut self, timeout: Duration) -> impl Future<Output = Result<Bytes>> + Send {
        async move {
            tokio::time::timeout(timeout, self.recv())
                .await
                .map_err(|_| BlerpcError::Timeout)?
        }
    }

    /// Tear the link down. Further operations fail with
    /// [`BlerpcError::NotConnected`], as does the peer's `recv`.
    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Scanning and connecting, the operations that exist before a channel does.
pub trait Connector {
    /// Channel type produced by [`Connector::connect`].
    type Chan: Channel;

    /// Scan for devices, optionally filtered by advertised service UUID.
    fn scan(
        &mut self,
        timeout: Duration,
        service_filter: Option<&str>,
    ) -> impl Future<Output = Result<Vec<ScannedDevice>>> + Send;

    /// Open a channel to a previously scanned device.
    fn connect(
        &mut self,
        device: &ScannedDevice,
    ) -> impl Future<Output = Result<Self::Chan>> + Send;
}
