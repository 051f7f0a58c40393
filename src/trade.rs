mod closed;
mod contract;
mod data;
mod offer;
mod process_model;
mod state;
#[allow(clippy::module_inception)]
mod trade;
mod trading_peer;

pub use closed::{ClosedTrades, CLOSED_TRADES_FILE_NAME};
pub use contract::{is_payment_method_compatible, Contract};
pub(crate) use data::{file_name_for, TradeData, FILE_PREFIX};
pub use offer::{Offer, OfferBuilder};
pub use process_model::{DeliveryStates, OutboundMessage, ProcessModel};
pub use state::{DisputeState, Phase, State};
pub use trade::Trade;
pub use trading_peer::TradingPeer;
