#[allow(clippy::module_inception)]
mod comms;
mod network;
mod router;

pub(crate) use comms::{Comms, CommsAccess};
pub use network::{DeliveryReceipt, MessageDelivery, NetworkCollaborator, PeerEnvelope, RawInbound};
