#![doc(html_root_url = "https://docs.rs/wiresocket/latest")]
//! Public API for the `wiresocket` library.
//!
//! This crate provides the core WebSocket connection driver that sits
//! between a byte-oriented duplex transport and a higher-level session: the
//! lifecycle state machine for the closing handshake, the suspension-aware
//! read pump, and the batching frame flusher, together with the collaborator
//! contracts they run against (endpoint, codec, extension chain, buffer
//! pool, executor).

pub mod buffer;
pub mod close;
pub mod codec;
pub mod endpoint;
pub mod executor;
pub mod extension;
pub mod frame;
pub mod io;
pub mod policy;
pub mod session;
#[doc(hidden)]
pub mod testing;

pub use buffer::{BufferPool, RecyclingBufferPool};
pub use close::CloseInfo;
pub use codec::{CodecError, Generator, MAX_HEADER_LENGTH, Parser};
pub use endpoint::{Endpoint, EndpointListener, Fill, tcp::TcpEndpoint};
pub use executor::{ExecuteError, Executor, TokioExecutor};
pub use extension::{ExtensionConfig, ExtensionStack, OutgoingSink, PassthroughExtensions};
pub use frame::{Frame, OpCode};
pub use io::{
    BatchMode, Connection, ConnectionState, FrameFlusher, IoState, SuspendToken, WriteCallback,
    WriteError,
};
pub use policy::{Behaviour, Policy, PolicyError};
pub use session::{FrameConsumed, Session};
