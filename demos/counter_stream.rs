//! Counter stream demo - a P→C streaming RPC over an encrypted session.
//!
//! This example demonstrates:
//! - Enabling encryption on the peripheral with an identity seed
//! - The key-exchange handshake running automatically during `attach`
//! - `stream_receive` collecting responses until the stream-end control
//!
//! Run with:
//!
//! ```sh
//! cargo run --example counter_stream
//! ```

use blerpc::peripheral::{Peripheral, PeripheralConfig, Registry};
use blerpc::transport::mem::{self, MemoryConnector};
use blerpc::{Central, CentralConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let (central_chan, peripheral_chan) = mem::duplex(247);

    // Demo identity key; a real device provisions this at manufacture
    let registry = Registry::new().handle_stream("counter_stream", |req, sink| {
        let count = u32::from_le_bytes([req[0], req[1], req[2], req[3]]);
        for seq in 0..count {
            let mut msg = seq.to_le_bytes().to_vec();
            msg.extend((seq * 10).to_le_bytes());
            sink.send(&msg)?;
        }
        Ok(())
    });
    let config = PeripheralConfig {
        identity_seed: Some([0x42; 32]),
        ..PeripheralConfig::default()
    };
    let mut peripheral = Peripheral::new(peripheral_chan, registry, config)?;
    tokio::spawn(async move { peripheral.run().await });

    let mut central = Central::new(MemoryConnector::new(), CentralConfig::default());
    central.attach(central_chan, "demo-device").await?;
    println!("encrypted: {}", central.is_encrypted());

    let results = central
        .stream_receive("counter_stream", &5u32.to_le_bytes())
        .await?;
    for item in &results {
        let seq = u32::from_le_bytes([item[0], item[1], item[2], item[3]]);
        let value = u32::from_le_bytes([item[4], item[5], item[6], item[7]]);
        println!("seq={seq} value={value}");
    }

    central.disconnect().await?;
    Ok(())
}
