//! Channel connectors (outbound side of each messaging platform).

pub mod manager;
pub mod stdout;
pub mod traits;

pub use manager::MessagingManager;
pub use stdout::StdoutAdapter;
pub use traits::{Messaging, MessagingDyn, OutboundContent, OutboundMessage};
