use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use super::contract::Contract;
use super::offer::Offer;
use super::process_model::ProcessModel;
use super::state::{DisputeState, State};
use crate::common::{
    error::EscrowError,
    types::{Coin, Direction, NodeAddress, Role},
};
use crate::deposit::TxId;
use crate::persistence::PersistableEnvelope;

/// One side of a trade. Owned by its protocol actor, persisted as `PendingTrade_{id}` until it
/// reaches a terminal state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub role: Role,
    pub offer: Offer,
    pub amount: Coin,
    pub buyer_security_deposit: Coin,
    pub seller_security_deposit: Coin,
    pub tx_fee: Coin,
    state: State,
    pub dispute_state: DisputeState,
    contract: Option<Contract>,
    contract_hash: Option<[u8; 32]>,
    pub maker_contract_signature: Option<Vec<u8>>,
    pub taker_contract_signature: Option<Vec<u8>>,
    pub deposit_tx_id: Option<TxId>,
    pub payout_tx_id: Option<TxId>,
    pub trading_peer_node_address: Option<NodeAddress>,
    pub error_message: Option<String>,
    /// Unix millis
    pub take_offer_date: u64,
    pub process_model: ProcessModel,
}

impl Trade {
    pub fn new(
        offer: Offer,
        is_maker: bool,
        amount: Coin,
        process_model: ProcessModel,
    ) -> Result<Self, EscrowError> {
        if !offer.is_amount_in_range(amount) {
            return Err(EscrowError::Simple(format!(
                "Trade amount {} outside of offer range {} to {}",
                amount, offer.min_amount, offer.amount
            )));
        }

        // Offer direction is from the maker's view
        let is_buyer = (offer.direction == Direction::Buy) == is_maker;
        let take_offer_date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or_default();

        Ok(Self {
            id: offer.id,
            role: Role::from_parts(is_buyer, is_maker),
            amount,
            buyer_security_deposit: offer.buyer_security_deposit,
            seller_security_deposit: offer.seller_security_deposit,
            tx_fee: offer.tx_fee,
            offer,
            state: State::OfferTaken,
            dispute_state: DisputeState::NoDispute,
            contract: None,
            contract_hash: None,
            maker_contract_signature: None,
            taker_contract_signature: None,
            deposit_tx_id: None,
            payout_tx_id: None,
            trading_peer_node_address: None,
            error_message: None,
            take_offer_date,
            process_model,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn contract(&self) -> Option<&Contract> {
        self.contract.as_ref()
    }

    pub fn contract_hash(&self) -> Option<[u8; 32]> {
        self.contract_hash
    }

    /// Moves to `state` unless that would go back to an earlier phase or leave a terminal state.
    pub fn set_state(&mut self, state: State) -> Result<(), EscrowError> {
        if state == self.state {
            return Ok(());
        }
        if self.state.is_terminal() || state.phase() < self.state.phase() {
            return Err(EscrowError::InvalidStateTransition {
                from: self.state.to_string(),
                to: state.to_string(),
            });
        }
        self.state = state;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = State::Failed;
        }
        self.error_message = Some(message.into());
    }

    pub fn set_contract(&mut self, contract: Contract, hash: [u8; 32]) -> Result<(), EscrowError> {
        if let Some(existing) = self.contract_hash {
            if existing != hash {
                return Err(EscrowError::ContractHashMismatch {
                    expected: hex::encode(existing),
                    received: hex::encode(hash),
                });
            }
            return Ok(());
        }
        self.contract = Some(contract);
        self.contract_hash = Some(hash);
        Ok(())
    }

    pub fn check_contract_hash(&self, hash: &[u8; 32]) -> Result<(), EscrowError> {
        let Some(existing) = self.contract_hash.as_ref() else {
            return Err(EscrowError::DataIntegrity(format!(
                "Trade w/ TradeUUID {} has no contract yet",
                self.id
            )));
        };
        if existing != hash {
            return Err(EscrowError::ContractHashMismatch {
                expected: hex::encode(existing),
                received: hex::encode(hash),
            });
        }
        Ok(())
    }

    pub fn is_deposit_published(&self) -> bool {
        self.deposit_tx_id.is_some()
    }

    pub fn is_payout_published(&self) -> bool {
        self.payout_tx_id.is_some()
    }

    pub fn is_buyer(&self) -> bool {
        self.role.is_buyer()
    }

    pub fn is_maker(&self) -> bool {
        self.role.is_maker()
    }
}

impl PersistableEnvelope for Trade {
    fn validate(&self) -> Result<(), EscrowError> {
        if self.id != self.offer.id {
            return Err(EscrowError::DataIntegrity(format!(
                "Trade id {} differs from offer id {}",
                self.id, self.offer.id
            )));
        }
        if self.contract.is_some() != self.contract_hash.is_some() {
            return Err(EscrowError::DataIntegrity(format!(
                "Trade w/ TradeUUID {} has contract and hash out of step",
                self.id
            )));
        }
        if self.process_model.account_id.is_empty() {
            return Err(EscrowError::DataIntegrity(format!(
                "Trade w/ TradeUUID {} has no account id",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SomeTestOfferParams, SomeTestTradeParams};

    #[test]
    fn role_follows_offer_direction() {
        let offer = SomeTestOfferParams::default_builder()
            .direction(Direction::Sell)
            .build()
            .unwrap();
        let taker = Trade::new(
            offer.clone(),
            false,
            offer.amount,
            SomeTestTradeParams::taker_process_model(),
        )
        .unwrap();
        assert_eq!(taker.role, Role::BuyerAsTaker);

        let maker = Trade::new(
            offer.clone(),
            true,
            offer.amount,
            SomeTestTradeParams::maker_process_model(),
        )
        .unwrap();
        assert_eq!(maker.role, Role::SellerAsMaker);
    }

    #[test]
    fn amount_outside_offer_range_rejected() {
        let offer = SomeTestOfferParams::default_builder().build().unwrap();
        let amount = Coin::from_sat(offer.amount.sat() + 1);
        assert!(Trade::new(
            offer,
            false,
            amount,
            SomeTestTradeParams::taker_process_model()
        )
        .is_err());
    }

    #[test]
    fn state_never_moves_back_a_phase() {
        let (_, mut trade) = SomeTestTradeParams::matched_trades();
        trade.set_state(State::DepositTxPublished).unwrap();
        trade.set_state(State::DepositTxPublishedSendFailed).unwrap();
        trade.set_state(State::DepositTxPublishedArrived).unwrap();

        let error = trade.set_state(State::DepositTxSigned).unwrap_err();
        assert!(matches!(error, EscrowError::InvalidStateTransition { .. }));
        assert_eq!(trade.state(), State::DepositTxPublishedArrived);
    }

    #[test]
    fn terminal_state_is_final() {
        let (_, mut trade) = SomeTestTradeParams::matched_trades();
        trade.fail("no deposit");
        assert_eq!(trade.state(), State::Failed);
        assert!(trade.set_state(State::DepositTxPublished).is_err());
        assert_eq!(trade.error_message.as_deref(), Some("no deposit"));
    }

    #[test]
    fn contract_set_once() {
        let (maker_trade, mut trade) = SomeTestTradeParams::matched_trades();
        let contract = Contract::from_trade(
            &maker_trade,
            &SomeTestTradeParams::maker_node_address(),
            &SomeTestTradeParams::maker_key_ring().pub_key_ring(),
        )
        .unwrap();
        let hash = contract.hash().unwrap();

        trade.set_contract(contract.clone(), hash).unwrap();
        trade.set_contract(contract.clone(), hash).unwrap();
        trade.check_contract_hash(&hash).unwrap();

        let other_hash = [7u8; 32];
        let error = trade.set_contract(contract, other_hash).unwrap_err();
        assert!(matches!(error, EscrowError::ContractHashMismatch { .. }));
        assert!(trade.check_contract_hash(&other_hash).is_err());
        assert_eq!(trade.contract_hash(), Some(hash));
    }

    #[test]
    fn persisted_bytes_restore_equal() {
        let (trade, _) = SomeTestTradeParams::matched_trades();
        let bytes = trade.to_persistable_bytes().unwrap();
        let restored = Trade::from_persistable_bytes(&bytes).unwrap();
        assert_eq!(trade, restored);
    }
}
