//! # blerpc
//!
//! Transport-neutral, MTU-aware request/response framework layered over a
//! single bidirectional frame channel: a BLE GATT characteristic with
//! notify + write-without-response, or anything else that delivers frames
//! in order.
//!
//! ## Architecture
//!
//! - **Protocol layer** ([`protocol`]): container framing, fragmentation,
//!   reassembly, and the typed command packet wrapping opaque user bytes.
//! - **Crypto session** ([`crypto`]): X25519/Ed25519 key exchange with TOFU
//!   identity pinning, AES-128-GCM payload encryption, replay protection.
//! - **Session drivers**: [`Central`] (client role) and
//!   [`peripheral::Peripheral`] (server role) over the [`transport::Channel`]
//!   contract.
//!
//! ## Example
//!
//! ```
//! use blerpc::peripheral::{Peripheral, PeripheralConfig, Registry};
//! use blerpc::transport::mem::{self, MemoryConnector};
//! use blerpc::{Central, CentralConfig};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let (central_chan, peripheral_chan) = mem::duplex(247);
//!
//! let registry = Registry::new().handle("echo", |req| Ok(req.to_vec()));
//! let mut peripheral =
//!     Peripheral::new(peripheral_chan, registry, PeripheralConfig::default()).unwrap();
//! tokio::spawn(async move { peripheral.run().await });
//!
//! let config = CentralConfig { require_encryption: false, ..CentralConfig::default() };
//! let mut central = Central::new(MemoryConnector::new(), config);
//! central.attach(central_chan, "demo").await.unwrap();
//!
//! let reply = central.call("echo", b"hello").await.unwrap();
//! assert_eq!(reply.as_ref(), b"hello");
//! # });
//! ```

pub mod crypto;
pub mod error;
pub mod peripheral;
pub mod protocol;
pub mod transport;

mod central;

pub use central::{Central, CentralConfig, DEFAULT_READ_TIMEOUT};
pub use error::{BlerpcError, Result};
