//! Handler registry for dispatching requests by command name.
//!
//! Handlers are tagged-variant descriptors over a uniform
//! bytes-in/bytes-out interface; generated per-RPC wrappers sit on top and
//! the core depends only on this interface. Lookup is a linear scan over
//! the registered names, matching the small static tables this protocol is
//! deployed with.
//!
//! # Example
//!
//! ```
//! use blerpc::peripheral::Registry;
//!
//! let registry = Registry::new()
//!     .handle("echo", |req| Ok(req.to_vec()))
//!     .handle_stream("count", |req, sink| {
//!         for i in 0..req.first().copied().unwrap_or(0) {
//!             sink.send(&[i])?;
//!         }
//!         Ok(())
//!     });
//! assert!(registry.contains("echo"));
//! ```

use crate::error::Result;

/// Sink a P→C stream handler emits response messages into. Each `send` is
/// one full response packet on the wire.
pub trait ResponseSink {
    /// Queue one response data payload.
    fn send(&mut self, data: &[u8]) -> Result<()>;
}

struct VecSink<'a>(&'a mut Vec<Vec<u8>>);

impl ResponseSink for VecSink<'_> {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.0.push(data.to_vec());
        Ok(())
    }
}

/// Stateful C→P stream handler. `on_message` fires per uploaded message,
/// `on_end` on CONTROL/STREAM_END_C2P and returns the final response data.
pub trait UploadHandler: Send {
    /// Accept one uploaded message.
    fn on_message(&mut self, data: &[u8]) -> Result<()>;
    /// Finish the stream and produce the final response data.
    fn on_end(&mut self) -> Result<Vec<u8>>;
}

type UnaryFn = Box<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;
type StreamFn = Box<dyn Fn(&[u8], &mut dyn ResponseSink) -> Result<()> + Send + Sync>;

enum HandlerKind {
    Unary(UnaryFn),
    StreamP2c(StreamFn),
    StreamC2p(Box<dyn UploadHandler>),
}

/// What the dispatcher decided; the session driver owns the emission.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// No handler registered under that name.
    Unknown,
    /// Unary handler produced one response.
    Respond(Vec<u8>),
    /// Stream handler produced zero or more responses followed by
    /// STREAM_END_P2C.
    StreamP2c(Vec<Vec<u8>>),
    /// Upload handler consumed the message; the stream stays open.
    UploadAccepted,
}

/// Registry mapping command names to handler descriptors.
pub struct Registry {
    entries: Vec<(String, HandlerKind)>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a unary handler: request data in, response data out.
    ///
    /// A handler error is logged by the session driver and produces no
    /// response on the wire.
    pub fn handle<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.entries
            .push((name.to_string(), HandlerKind::Unary(Box::new(handler))));
        self
    }

    /// Register a P→C stream handler. Everything sent into the sink becomes
    /// a response packet; the core appends CONTROL/STREAM_END_P2C after the
    /// handler returns Ok.
    pub fn handle_stream<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&[u8], &mut dyn ResponseSink) -> Result<()> + Send + Sync + 'static,
    {
        self.entries
            .push((name.to_string(), HandlerKind::StreamP2c(Box::new(handler))));
        self
    }

    /// Register a C→P upload handler.
    pub fn handle_upload<H>(mut self, name: &str, handler: H) -> Self
    where
        H: UploadHandler + 'static,
    {
        self.entries
            .push((name.to_string(), HandlerKind::StreamC2p(Box::new(handler))));
        self
    }

    /// Whether a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut HandlerKind> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, h)| h)
    }

    /// Invoke the handler for `name` with the request data.
    pub(crate) fn dispatch(&mut self, name: &str, data: &[u8]) -> Result<DispatchOutcome> {
        match self.find_mut(name) {
            None => Ok(DispatchOutcome::Unknown),
            Some(HandlerKind::Unary(f)) => Ok(DispatchOutcome::Respond(f(data)?)),
            Some(HandlerKind::StreamP2c(f)) => {
                let mut messages = Vec::new();
                f(data, &mut VecSink(&mut messages))?;
                Ok(DispatchOutcome::StreamP2c(messages))
            }
            Some(HandlerKind::StreamC2p(h)) => {
                h.on_message(data)?;
                Ok(DispatchOutcome::UploadAccepted)
            }
        }
    }

    /// Whether `name` names a C→P upload handler.
    pub fn is_upload(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(n, h)| n == name && matches!(h, HandlerKind::StreamC2p(_)))
    }

    /// Finish the named upload stream.
    pub(crate) fn upload_end(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.find_mut(name) {
            Some(HandlerKind::StreamC2p(h)) => h.on_end().map(Some),
            _ => Ok(None),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
