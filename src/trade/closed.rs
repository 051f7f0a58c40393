use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trade::Trade;
use crate::common::error::EscrowError;
use crate::persistence::PersistableEnvelope;

pub const CLOSED_TRADES_FILE_NAME: &str = "ClosedTrades";

/// Archive of trades that reached a terminal state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrades {
    trades: Vec<Trade>,
}

impl ClosedTrades {
    /// Returns false when a trade with the same id is archived already.
    pub fn add(&mut self, trade: Trade) -> bool {
        if self.contains(&trade.id) {
            return false;
        }
        self.trades.push(trade);
        true
    }

    pub fn contains(&self, trade_id: &Uuid) -> bool {
        self.trades.iter().any(|trade| &trade.id == trade_id)
    }

    pub fn get(&self, trade_id: &Uuid) -> Option<&Trade> {
        self.trades.iter().find(|trade| &trade.id == trade_id)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }
}

impl PersistableEnvelope for ClosedTrades {
    fn validate(&self) -> Result<(), EscrowError> {
        for (index, trade) in self.trades.iter().enumerate() {
            if self.trades[..index].iter().any(|other| other.id == trade.id) {
                return Err(EscrowError::DataIntegrity(format!(
                    "Closed trade {} archived twice",
                    trade.id
                )));
            }
            if !trade.state().is_terminal() {
                return Err(EscrowError::DataIntegrity(format!(
                    "Closed trade {} in non-terminal state {}",
                    trade.id,
                    trade.state()
                )));
            }
        }
        Ok(())
    }
}
