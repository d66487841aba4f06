//! Connection handling shared by all three daemons: non-blocking accept,
//! per-socket buffered streams, per-direction cipher framing and the hub
//! envelope wire model.

pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod header;
pub mod session;
