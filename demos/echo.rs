//! Echo demo - one unary RPC over the in-memory transport.
//!
//! This example demonstrates:
//! - Registering a unary handler on the peripheral
//! - Session init (timeout + capabilities negotiation) from the central
//! - A single `call` carrying opaque request bytes
//!
//! Run with:
//!
//! ```sh
//! cargo run --example echo
//! ```

use blerpc::peripheral::{Peripheral, PeripheralConfig, Registry};
use blerpc::transport::mem::{self, MemoryConnector};
use blerpc::{Central, CentralConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let (central_chan, peripheral_chan) = mem::duplex(247);

    // Peripheral side: an echo handler, served from its own task
    let registry = Registry::new().handle("echo", |req| Ok(req.to_vec()));
    let mut peripheral =
        Peripheral::new(peripheral_chan, registry, PeripheralConfig::default())?;
    tokio::spawn(async move { peripheral.run().await });

    // Central side: plaintext session (the demo peripheral has no identity key)
    let config = CentralConfig {
        require_encryption: false,
        ..CentralConfig::default()
    };
    let mut central = Central::new(MemoryConnector::new(), config);
    central.attach(central_chan, "demo-device").await?;

    let reply = central.call("echo", b"hello blerpc").await?;
    println!("echo reply: {:?}", std::str::from_utf8(&reply)?);

    central.disconnect().await?;
    Ok(())
}
