//! Event notifier: outbound state-change events and inbound agent reports.

mod inbound;
mod outbound;

pub use inbound::{InboundMessage, InboundRouter};
pub use outbound::Outbound;
