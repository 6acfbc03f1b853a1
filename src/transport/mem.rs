//! In-memory duplex channel.
//!
//! Two bounded tokio mpsc queues wired head-to-tail. Frames preserve order,
//! a full outbound queue surfaces the transient buffer-full error (the same
//! shape a BLE stack reports when its notification queue is exhausted), and
//! dropping or disconnecting one end wakes the peer's reader.
//!
//! # Example
//!
//! ```
//! use blerpc::transport::{mem, Channel};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let (mut a, mut b) = mem::duplex(247);
//! a.write(b"ping").await.unwrap();
//! assert_eq!(b.recv().await.unwrap().as_ref(), b"ping");
//! # });
//! ```

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Channel, Connector, ScannedDevice};
use crate::error::{BlerpcError, Result};

/// Default queue capacity (frames) per direction.
pub const DEFAULT_CAPACITY: usize = 256;

/// One end of an in-memory duplex channel. See [`duplex`].
#[derive(Debug)]
pub struct MemoryChannel {
    mtu: u16,
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
}

/// Create a connected pair of channels with the default queue capacity.
pub fn duplex(mtu: u16) -> (MemoryChannel, MemoryChannel) {
    duplex_with_capacity(mtu, DEFAULT_CAPACITY)
}

/// Create a connected pair with an explicit per-direction queue capacity.
///
/// Small capacities are useful in tests to provoke the transient
/// buffer-full write error.
pub fn duplex_with_capacity(mtu: u16, capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MemoryChannel {
            mtu,
            tx: Some(a_tx),
            rx: a_rx,
        },
        MemoryChannel {
            mtu,
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

impl Channel for MemoryChannel {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(BlerpcError::NotConnected)?;
        match tx.try_send(Bytes::copy_from_slice(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BlerpcError::WriteBufferFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BlerpcError::NotConnected),
        }
    }

    async fn recv(&mut self) -> Result<Bytes> {
        self.rx.recv().await.ok_or(BlerpcError::NotConnected)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

/// Connector over a fixed set of pre-wired in-memory channels.
///
/// Register each "device" with [`MemoryConnector::add_device`]; the other
/// end of its channel goes to whatever drives the peripheral side.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    devices: Vec<(ScannedDevice, Option<MemoryChannel>)>,
}

impl MemoryConnector {
    /// Empty connector; `scan` finds nothing until devices are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device reachable through `channel`.
    pub fn add_device(&mut self, address: &str, name: &str, channel: MemoryChannel) {
        self.devices.push((
            ScannedDevice {
                address: address.to_string(),
                name: Some(name.to_string()),
                rssi: None,
            },
            Some(channel),
        ));
    }
}

impl Connector for MemoryConnector {
    type Chan = MemoryChannel;

    async fn scan(
        &mut self,
        _timeout: Duration,
        _service_filter: Option<&str>,
    ) -> Result<Vec<ScannedDevice>> {
        Ok(self.devices.iter().map(|(d, _)| d.clone()).collect())
    }

    async fn connect(&mut self, device: &ScannedDevice) -> Result<MemoryChannel> {
        self.devices
            .iter_mut()
            .find(|(d, chan)| d.address == device.address && chan.is_some())
            .and_then(|(_, chan)| chan.take())
            .ok_or(BlerpcError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_roundtrip_both_directions() {
        let (mut a, mut b) = duplex(247);
        a.write(b"to-b").await.unwrap();
        b.write(b"to-a").await.unwrap();
        assert_eq!(b.recv().await.unwrap().as_ref(), b"to-b");
        assert_eq!(a.recv().await.unwrap().as_ref(), b"to-a");
    }

    #[tokio::test]
    async fn test_frames_preserve_order() {
        let (mut a, mut b) = duplex(247);
        for i in 0..10u8 {
            a.write(&[i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b.recv().await.unwrap().as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn test_full_queue_is_transient_buffer_full() {
        let (mut a, _b) = duplex_with_capacity(247, 2);
        a.write(b"1").await.unwrap();
        a.write(b"2").await.unwrap();
        assert!(matches!(
            a.write(b"3").await,
            Err(BlerpcError::WriteBufferFull)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_wakes_peer() {
        let (mut a, mut b) = duplex(247);
        a.disconnect().await.unwrap();
        assert!(matches!(b.recv().await, Err(BlerpcError::NotConnected)));
        assert!(matches!(
            b.write(b"x").await,
            Err(BlerpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (_a, mut b) = duplex(247);
        let err = b.recv_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, BlerpcError::Timeout));
    }

    #[tokio::test]
    async fn test_connector_scan_and_connect() {
        let (chan, _peer) = duplex(247);
        let mut connector = MemoryConnector::new();
        connector.add_device("AA:BB", "demo", chan);

        let devices = connector.scan(Duration::from_secs(1), None).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "AA:BB");

        let _channel = connector.connect(&devices[0]).await.unwrap();
        // A second connect to the same device fails: the channel is taken
        assert!(connector.connect(&devices[0]).await.is_err());
    }
}
