//! Wire framing and transport abstraction for the AAE exchange protocol.

pub mod frame;
pub mod tags;
pub mod transport;

pub use frame::Frame;
pub use tags::MessageTag;
pub use transport::{Socket, TransportOptions};
