mod config;
mod context;
pub mod messages;
#[allow(clippy::module_inception)]
mod protocol;
mod tasks;

pub use config::{step_for, ProtocolStep, Trigger};
pub use context::{ProtocolServices, TradeContext};
pub use protocol::{TradeAccess, TradeNotif};
pub(crate) use protocol::TradeProtocol;
pub use tasks::TradeTask;
