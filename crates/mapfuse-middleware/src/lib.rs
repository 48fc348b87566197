//! `mapfuse-middleware` – packet plumbing between the transport and the
//! sensor handlers.
//!
//! Routes decoded packets without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – [`PacketBus`]: per-connection inbound routing of packets by
//!   data name into bounded per-subscriber queues.
//! - [`hub`] – [`ClientHub`]: non-blocking outbound fan-out of a packet to
//!   every connected client except its origin.

pub mod bus;
pub mod hub;

pub use bus::{PacketBus, Subscription};
pub use hub::{ClientHub, ClientId, ClientOutbox};
