//! # Stage: Real-Time Gateway
//!
//! ## Responsibility
//! Accepts subscriber connections, routes their requests to the orchestrator
//! and delivers bus events to the connections subscribed to each topic.
//!
//! ## Guarantees
//! - A slow or dead subscriber never blocks delivery to the others
//! - Pushed adjustments go through the same clamping path as any other
//! - Connections silent for longer than the stale threshold are purged
//!
//! ## NOT Responsible For
//! - Accepting TCP sockets or HTTP routing (see `web`)
//! - Event ordering across subjects

pub mod connections;
pub mod heartbeat;
pub mod protocol;
pub mod session;

pub use connections::{ConnectionRegistry, ConnectionStatus, Outbound};
pub use heartbeat::Heartbeat;
pub use protocol::{ClientMessage, Envelope, ServerMessage};
pub use session::{GatewayConfig, GatewayService};
