//! Infrastructure Layer
//!
//! Task lifecycle shared by the transport, the retransmission queue and the
//! membership loops.

pub mod shutdown;

pub use shutdown::{shutdown_signal, ConnectionGuard, ShutdownController};
