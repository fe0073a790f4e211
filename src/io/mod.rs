//! The connection driver core: lifecycle state machine, frame flusher, and
//! the driver itself with its read pump.

pub mod connection;
pub mod flusher;
pub mod state;

pub use connection::{Connection, SuspendToken};
pub use flusher::{BatchMode, FrameFlusher, WriteCallback, WriteError};
pub use state::{ConnectionState, IoState};
