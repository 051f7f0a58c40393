mod network;
mod params;
mod wallet;

pub use network::{LoopbackHub, LoopbackNetwork};
pub use params::{SomeTestOfferParams, SomeTestPaymentAccountPayload, SomeTestTradeParams};
pub use wallet::{MockChain, MockWallet};
