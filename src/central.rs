//! Central session: the client-side RPC driver.
//!
//! Lifecycle:
//! 1. `scan` / `connect` (or [`Central::attach`] for an already-open channel)
//! 2. session init: TIMEOUT negotiation, CAPABILITIES exchange, key exchange
//!    when the peripheral advertises encryption
//! 3. any number of `call` / `stream_receive` / `stream_send`, strictly one
//!    at a time
//! 4. `disconnect`, which wipes the crypto session
//!
//! Missing TIMEOUT or CAPABILITIES replies are tolerated with defaults; an
//! unexpected reply is logged and ignored. Crypto failures are fatal to the
//! session and tear the link down.

use std::time::Duration;

use bytes::Bytes;

use crate::crypto::{CentralHandshake, CryptoSession, KnownKeys};
use crate::error::{BlerpcError, Result};
use crate::protocol::{
    encode_request, make_capabilities_request, make_key_exchange, make_stream_end_c2p,
    make_timeout_request, Assembler, Capabilities, CommandPacket, CommandType, Container,
    ContainerKind, ControlCmd, FeedResult, Splitter, DEFAULT_MAX_PAYLOAD, ERROR_BUSY,
    ERROR_RESPONSE_TOO_LARGE,
};
use crate::transport::{Channel, Connector, ScannedDevice};

/// Read timeout before the peripheral announces one.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Floor applied to the first read after a request is transmitted, absorbing
/// peripheral processing latency without stalling stuck streams.
const FIRST_READ_FLOOR: Duration = Duration::from_millis(2000);

/// How long session init waits for TIMEOUT and CAPABILITIES replies.
const INIT_REPLY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Key-exchange replies involve public-key work on the peripheral.
const KEY_EXCHANGE_REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Central-side policy knobs.
#[derive(Debug)]
pub struct CentralConfig {
    /// Refuse to complete `connect` without an encrypted session. Defaults
    /// to on; talking to pre-encryption peripherals needs an explicit
    /// opt-out.
    pub require_encryption: bool,
    /// Cap on a reassembled response payload.
    pub max_payload_size: usize,
    /// TOFU identity-key store. `None` skips identity pinning.
    pub known_keys: Option<KnownKeys>,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            require_encryption: true,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            known_keys: None,
        }
    }
}

/// State attached to one open channel.
struct Link<C> {
    channel: C,
    address: String,
    splitter: Splitter,
    assembler: Assembler,
    read_timeout: Duration,
    capabilities: Option<Capabilities>,
    session: Option<CryptoSession>,
}

/// Client-side session driver. One in-flight RPC at a time; streaming RPCs
/// hold the session for their full duration.
pub struct Central<T: Connector> {
    connector: T,
    config: CentralConfig,
    link: Option<Link<T::Chan>>,
}

impl<T: Connector> Central<T> {
    /// Create a driver over `connector` with the given policy.
    pub fn new(connector: T, config: CentralConfig) -> Self {
        Self {
            connector,
            config,
            link: None,
        }
    }

    /// Scan for peripherals; delegated to the connector.
    pub async fn scan(
        &mut self,
        timeout: Duration,
        service_filter: Option<&str>,
    ) -> Result<Vec<ScannedDevice>> {
        self.connector.scan(timeout, service_filter).await
    }

    /// Open a channel to `device` and run session init.
    pub async fn connect(&mut self, device: &ScannedDevice) -> Result<()> {
        let channel = self.connector.connect(device).await?;
        self.attach(channel, &device.address).await
    }

    /// Run session init over an already-open channel.
    ///
    /// `address` keys the TOFU store; pass the transport address.
    pub async fn attach(&mut self, channel: T::Chan, address: &str) -> Result<()> {
        let mtu = channel.mtu();
        let mut link = Link {
            channel,
            address: address.to_string(),
            splitter: Splitter::new(mtu),
            assembler: Assembler::new(self.config.max_payload_size),
            read_timeout: DEFAULT_READ_TIMEOUT,
            capabilities: None,
            session: None,
        };

        match init_session(&mut link, &self.config).await {
            Ok(()) => {
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                let _ = link.channel.disconnect().await;
                Err(e)
            }
        }
    }

    /// Whether a channel is open.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Whether an encrypted session is live.
    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.session.is_some())
    }

    /// Capability record cached from session init.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.link.as_ref().and_then(|l| l.capabilities)
    }

    /// Per-read timeout negotiated with the peripheral.
    pub fn negotiated_timeout(&self) -> Option<Duration> {
        self.link.as_ref().map(|l| l.read_timeout)
    }

    /// One-shot RPC: send `request` under `cmd_name`, return the response
    /// data bytes.
    pub async fn call(&mut self, cmd_name: &str, request: &[u8]) -> Result<Bytes> {
        let result = self.call_inner(cmd_name, request).await;
        self.teardown_on_fatal(&result).await;
        result
    }

    async fn call_inner(&mut self, cmd_name: &str, request: &[u8]) -> Result<Bytes> {
        let link = self.link.as_mut().ok_or(BlerpcError::NotConnected)?;
        transmit_request(link, &self.config, cmd_name, request).await?;
        let payload = receive_payload(link).await?;
        decode_response(link, &payload, cmd_name)
    }

    /// P→C stream: send one request, collect response data until
    /// CONTROL/STREAM_END_P2C.
    ///
    /// A mid-stream error discards the partial results.
    pub async fn stream_receive(&mut self, cmd_name: &str, request: &[u8]) -> Result<Vec<Bytes>> {
        let result = self.stream_receive_inner(cmd_name, request).await;
        self.teardown_on_fatal(&result).await;
        result
    }

    async fn stream_receive_inner(
        &mut self,
        cmd_name: &str,
        request: &[u8],
    ) -> Result<Vec<Bytes>> {
        let link = self.link.as_mut().ok_or(BlerpcError::NotConnected)?;
        transmit_request(link, &self.config, cmd_name, request).await?;

        let mut results = Vec::new();
        let mut first_read = true;
        link.assembler.reset();
        loop {
            let data = read_one(link, first_read).await?;
            first_read = false;
            let container = Container::parse(&data)?;
            match container.kind {
                ContainerKind::Control(ControlCmd::StreamEndP2c) => break,
                ContainerKind::Control(ControlCmd::Error) => {
                    return Err(translate_error(container.payload))
                }
                ContainerKind::Control(cmd) => {
                    tracing::debug!(?cmd, "ignoring control container during stream");
                }
                _ => {
                    if let FeedResult::Complete(payload) = link.assembler.feed(&container)? {
                        let plain = open_payload(link, &payload)?;
                        let packet = CommandPacket::parse(&plain)?;
                        if packet.cmd_type != CommandType::Response {
                            return Err(BlerpcError::UnexpectedResponseType);
                        }
                        results.push(Bytes::copy_from_slice(packet.data));
                    }
                }
            }
        }
        Ok(results)
    }

    /// C→P stream: send every message under `cmd_name`, then
    /// CONTROL/STREAM_END_C2P, then read one response named
    /// `final_cmd_name`.
    pub async fn stream_send(
        &mut self,
        cmd_name: &str,
        messages: &[Vec<u8>],
        final_cmd_name: &str,
    ) -> Result<Bytes> {
        let result = self.stream_send_inner(cmd_name, messages, final_cmd_name).await;
        self.teardown_on_fatal(&result).await;
        result
    }

    async fn stream_send_inner(
        &mut self,
        cmd_name: &str,
        messages: &[Vec<u8>],
        final_cmd_name: &str,
    ) -> Result<Bytes> {
        let link = self.link.as_mut().ok_or(BlerpcError::NotConnected)?;

        for message in messages {
            transmit_request(link, &self.config, cmd_name, message).await?;
        }

        let tid = link.splitter.next_transaction_id();
        link.channel.write(&make_stream_end_c2p(tid)).await?;

        let payload = receive_payload(link).await?;
        decode_response(link, &payload, final_cmd_name)
    }

    /// Release the channel and destroy the crypto session.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut link) = self.link.take() {
            let _ = link.channel.disconnect().await;
            // link.session drops here; key material is zeroized
        }
        Ok(())
    }

    async fn teardown_on_fatal<R>(&mut self, result: &Result<R>) {
        if let Err(e) = result {
            if is_fatal_crypto(e) {
                tracing::warn!(error = %e, "crypto failure, tearing session down");
                let _ = self.disconnect().await;
            }
        }
    }
}

fn is_fatal_crypto(e: &BlerpcError) -> bool {
    matches!(
        e,
        BlerpcError::DecryptionFailed
            | BlerpcError::ReplayDetected(_)
            | BlerpcError::NonceExhausted
            | BlerpcError::KeyExchangeProtocolViolation(_)
            | BlerpcError::IdentityMismatch
    )
}

/// Translate a CONTROL/ERROR payload into the typed error.
fn translate_error(payload: &[u8]) -> BlerpcError {
    match payload.first() {
        Some(&ERROR_RESPONSE_TOO_LARGE) => BlerpcError::ResponseTooLarge,
        Some(&ERROR_BUSY) => BlerpcError::Busy,
        Some(&code) => BlerpcError::Peripheral(code),
        None => BlerpcError::MalformedFrame("empty error payload"),
    }
}

// ── Session init ─────────────────────────────────────────────────────────

async fn init_session<C: Channel>(link: &mut Link<C>, config: &CentralConfig) -> Result<()> {
    match request_timeout_value(link).await {
        Ok(()) => {}
        Err(BlerpcError::Timeout) => {
            tracing::debug!("peripheral did not answer timeout request, using default");
        }
        Err(e) => return Err(e),
    }

    match request_capabilities(link).await {
        Ok(()) => {}
        Err(BlerpcError::Timeout) => {
            tracing::debug!("peripheral did not answer capabilities request");
        }
        Err(e) => return Err(e),
    }

    let encryption_supported = link
        .capabilities
        .is_some_and(|caps| caps.encryption_supported());

    if encryption_supported {
        match key_exchange(link, config).await {
            Ok(session) => {
                link.session = Some(session);
                tracing::info!("end-to-end encryption established");
            }
            Err(e) if config.require_encryption => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "key exchange failed, continuing unencrypted");
            }
        }
    } else if config.require_encryption {
        return Err(BlerpcError::EncryptionRequired);
    }

    Ok(())
}

async fn request_timeout_value<C: Channel>(link: &mut Link<C>) -> Result<()> {
    let tid = link.splitter.next_transaction_id();
    link.channel.write(&make_timeout_request(tid)).await?;

    let data = link.channel.recv_timeout(INIT_REPLY_TIMEOUT).await?;
    let container = Container::parse(&data)?;
    match container.kind {
        ContainerKind::Control(ControlCmd::Timeout) if container.payload.len() == 2 => {
            let ms = u16::from_le_bytes([container.payload[0], container.payload[1]]);
            link.read_timeout = Duration::from_millis(ms as u64);
            tracing::info!(timeout_ms = ms, "peripheral timeout negotiated");
        }
        other => {
            tracing::warn!(?other, "unexpected timeout reply, keeping default");
        }
    }
    Ok(())
}

async fn request_capabilities<C: Channel>(link: &mut Link<C>) -> Result<()> {
    let tid = link.splitter.next_transaction_id();
    link.channel.write(&make_capabilities_request(tid)).await?;

    let data = link.channel.recv_timeout(INIT_REPLY_TIMEOUT).await?;
    let container = Container::parse(&data)?;
    match container.kind {
        ContainerKind::Control(ControlCmd::Capabilities) => {
            let caps = Capabilities::parse(container.payload)?;
            if caps.max_request_payload_size == 0 || caps.max_response_payload_size == 0 {
                tracing::warn!(?caps, "peripheral reported a zero capability");
            }
            tracing::info!(
                max_request = caps.max_request_payload_size,
                max_response = caps.max_response_payload_size,
                flags = caps.flags,
                "peripheral capabilities"
            );
            link.capabilities = Some(caps);
        }
        other => {
            tracing::warn!(?other, "unexpected capabilities reply, ignoring");
        }
    }
    Ok(())
}

async fn key_exchange<C: Channel>(
    link: &mut Link<C>,
    config: &CentralConfig,
) -> Result<CryptoSession> {
    let (mut handshake, msg1) = CentralHandshake::new()?;

    let tid = link.splitter.next_transaction_id();
    link.channel.write(&make_key_exchange(tid, &msg1)).await?;
    let msg2 = read_key_exchange_reply(link).await?;

    let known_keys = config.known_keys.as_ref();
    let address = link.address.as_str();
    let msg3 = handshake.respond(&msg2, |identity| match known_keys {
        Some(store) => store.check_or_store(address, identity),
        None => Ok(()),
    })?;

    let tid = link.splitter.next_transaction_id();
    link.channel.write(&make_key_exchange(tid, &msg3)).await?;
    let msg4 = read_key_exchange_reply(link).await?;

    handshake.finish(&msg4)
}

async fn read_key_exchange_reply<C: Channel>(link: &mut Link<C>) -> Result<Bytes> {
    let data = link.channel.recv_timeout(KEY_EXCHANGE_REPLY_TIMEOUT).await?;
    let container = Container::parse(&data)?;
    match container.kind {
        ContainerKind::Control(ControlCmd::KeyExchange) => {
            Ok(Bytes::copy_from_slice(container.payload))
        }
        _ => Err(BlerpcError::KeyExchangeProtocolViolation(
            "expected a KEY_EXCHANGE reply",
        )),
    }
}

// ── Request/response plumbing ────────────────────────────────────────────

/// Encode, size-check, encrypt, split, and write one request.
async fn transmit_request<C: Channel>(
    link: &mut Link<C>,
    config: &CentralConfig,
    cmd_name: &str,
    request: &[u8],
) -> Result<()> {
    let packet = encode_request(cmd_name, request)?;

    if let Some(caps) = link.capabilities {
        if packet.len() > caps.max_request_payload_size as usize {
            return Err(BlerpcError::PayloadTooLarge {
                actual: packet.len(),
                limit: caps.max_request_payload_size as usize,
            });
        }
    }

    let send_payload = match &mut link.session {
        Some(session) => session.encrypt(&packet)?,
        None if config.require_encryption => return Err(BlerpcError::EncryptionRequired),
        None => packet,
    };

    // The FIRST container's total_length field is a u16
    if send_payload.len() > u16::MAX as usize {
        return Err(BlerpcError::PayloadTooLarge {
            actual: send_payload.len(),
            limit: u16::MAX as usize,
        });
    }

    let tid = link.splitter.next_transaction_id();
    let mtu = link.splitter.mtu();
    for container in crate::protocol::split(&send_payload, tid, mtu) {
        link.channel.write(&container.to_vec()).await?;
    }
    Ok(())
}

async fn read_one<C: Channel>(link: &mut Link<C>, first_read: bool) -> Result<Bytes> {
    let timeout = if first_read {
        link.read_timeout.max(FIRST_READ_FLOOR)
    } else {
        link.read_timeout
    };
    link.channel.recv_timeout(timeout).await
}

/// Read containers until one assembled payload completes; translates
/// interleaved CONTROL/ERROR frames.
async fn receive_payload<C: Channel>(link: &mut Link<C>) -> Result<Bytes> {
    link.assembler.reset();
    let mut first_read = true;
    loop {
        let data = read_one(link, first_read).await?;
        first_read = false;
        let container = Container::parse(&data)?;
        match container.kind {
            ContainerKind::Control(ControlCmd::Error) => {
                return Err(translate_error(container.payload))
            }
            ContainerKind::Control(cmd) => {
                tracing::debug!(?cmd, "ignoring control container during call");
            }
            _ => {
                if let FeedResult::Complete(payload) = link.assembler.feed(&container)? {
                    return Ok(payload);
                }
            }
        }
    }
}

fn open_payload<C>(link: &mut Link<C>, payload: &[u8]) -> Result<Vec<u8>> {
    match &mut link.session {
        Some(session) => session.decrypt(payload),
        None => Ok(payload.to_vec()),
    }
}

fn decode_response<C>(link: &mut Link<C>, payload: &[u8], cmd_name: &str) -> Result<Bytes> {
    let plain = open_payload(link, payload)?;
    let packet = CommandPacket::parse(&plain)?;
    if packet.cmd_type != CommandType::Response {
        return Err(BlerpcError::UnexpectedResponseType);
    }
    if packet.cmd_name != cmd_name {
        return Err(BlerpcError::CommandNameMismatch {
            expected: cmd_name.to_string(),
            got: packet.cmd_name.to_string(),
        });
    }
    Ok(Bytes::copy_from_slice(packet.data))
}
