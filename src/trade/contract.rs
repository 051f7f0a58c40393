use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trade::Trade;
use crate::common::{
    crypto,
    error::EscrowError,
    types::{Coin, Direction, KeyRing, NodeAddress, PubKeyRing},
};
use crate::deposit::TxId;

const SEPA: &str = "SEPA";
const SEPA_INSTANT: &str = "SEPA_INSTANT";

/// A SEPA maker also accepts SEPA instant takers, otherwise the methods must be equal.
pub fn is_payment_method_compatible(maker_method_id: &str, taker_method_id: &str) -> bool {
    maker_method_id == taker_method_id
        || (maker_method_id == SEPA && taker_method_id == SEPA_INSTANT)
}

/// Immutable agreement both peers sign. Its hash travels with every later message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub offer_id: Uuid,
    pub direction: Direction,
    pub trade_amount: Coin,
    pub price: u64,
    pub counter_currency_code: String,
    pub buyer_security_deposit: Coin,
    pub seller_security_deposit: Coin,
    pub tx_fee: Coin,
    pub taker_fee_tx_id: TxId,
    pub buyer_node_address: NodeAddress,
    pub seller_node_address: NodeAddress,
    pub is_buyer_maker_and_seller_taker: bool,
    pub maker_account_id: String,
    pub taker_account_id: String,
    pub maker_pub_key_ring: PubKeyRing,
    pub taker_pub_key_ring: PubKeyRing,
    pub maker_multisig_pub_key: PublicKey,
    pub taker_multisig_pub_key: PublicKey,
    pub maker_payout_address: String,
    pub taker_payout_address: String,
    pub maker_payment_account_payload_hash: [u8; 32],
    pub taker_payment_account_payload_hash: [u8; 32],
    pub maker_payment_method_id: String,
    pub taker_payment_method_id: String,
    pub lock_time: u32,
    pub protocol_version: u32,
}

struct Side {
    node_address: NodeAddress,
    pub_key_ring: PubKeyRing,
    account_id: String,
    multisig_pub_key: PublicKey,
    payout_address: String,
    payment_account_payload_hash: [u8; 32],
    payment_method_id: String,
}

fn missing(what: &str) -> EscrowError {
    EscrowError::DataIntegrity(format!("Contract cannot be built without {}", what))
}

impl Contract {
    /// Assembles the contract from the trade's own and peer data. Both sides arrive at the same
    /// contract when they agree on every term.
    pub fn from_trade(
        trade: &Trade,
        my_node_address: &NodeAddress,
        my_pub_key_ring: &PubKeyRing,
    ) -> Result<Contract, EscrowError> {
        let process_model = &trade.process_model;
        let peer = &process_model.trading_peer;

        let own = Side {
            node_address: my_node_address.clone(),
            pub_key_ring: *my_pub_key_ring,
            account_id: process_model.account_id.clone(),
            multisig_pub_key: process_model
                .my_multisig_pub_key
                .ok_or_else(|| missing("own multisig pub key"))?,
            payout_address: process_model
                .payout_address
                .clone()
                .ok_or_else(|| missing("own payout address"))?,
            payment_account_payload_hash: process_model.payment_account_payload_hash,
            payment_method_id: process_model.payment_method_id.clone(),
        };
        let other = Side {
            node_address: peer
                .node_address
                .clone()
                .ok_or_else(|| missing("peer node address"))?,
            pub_key_ring: peer
                .pub_key_ring
                .ok_or_else(|| missing("peer pub key ring"))?,
            account_id: peer
                .account_id
                .clone()
                .ok_or_else(|| missing("peer account id"))?,
            multisig_pub_key: peer
                .multisig_pub_key
                .ok_or_else(|| missing("peer multisig pub key"))?,
            payout_address: peer
                .payout_address
                .clone()
                .ok_or_else(|| missing("peer payout address"))?,
            payment_account_payload_hash: peer
                .payment_account_payload_hash
                .ok_or_else(|| missing("peer payment account payload hash"))?,
            payment_method_id: peer
                .payment_method_id
                .clone()
                .ok_or_else(|| missing("peer payment method id"))?,
        };

        let taker_fee_tx_id = process_model
            .taker_fee_tx_id
            .ok_or_else(|| missing("taker fee tx id"))?;
        let lock_time = process_model
            .lock_time
            .ok_or_else(|| missing("lock time"))?;

        let is_buyer = trade.is_buyer();
        let (maker, taker) = if trade.is_maker() {
            (own, other)
        } else {
            (other, own)
        };
        let (buyer_node_address, seller_node_address) = if is_buyer == trade.is_maker() {
            (maker.node_address.clone(), taker.node_address.clone())
        } else {
            (taker.node_address.clone(), maker.node_address.clone())
        };

        if !is_payment_method_compatible(&maker.payment_method_id, &taker.payment_method_id) {
            return Err(EscrowError::DataIntegrity(format!(
                "Payment methods {} and {} are not compatible",
                maker.payment_method_id, taker.payment_method_id
            )));
        }

        Ok(Contract {
            offer_id: trade.offer.id,
            direction: trade.offer.direction,
            trade_amount: trade.amount,
            price: trade.offer.price,
            counter_currency_code: trade.offer.counter_currency_code.clone(),
            buyer_security_deposit: trade.buyer_security_deposit,
            seller_security_deposit: trade.seller_security_deposit,
            tx_fee: trade.tx_fee,
            taker_fee_tx_id,
            buyer_node_address,
            seller_node_address,
            is_buyer_maker_and_seller_taker: trade.offer.direction == Direction::Buy,
            maker_account_id: maker.account_id,
            taker_account_id: taker.account_id,
            maker_pub_key_ring: maker.pub_key_ring,
            taker_pub_key_ring: taker.pub_key_ring,
            maker_multisig_pub_key: maker.multisig_pub_key,
            taker_multisig_pub_key: taker.multisig_pub_key,
            maker_payout_address: maker.payout_address,
            taker_payout_address: taker.payout_address,
            maker_payment_account_payload_hash: maker.payment_account_payload_hash,
            taker_payment_account_payload_hash: taker.payment_account_payload_hash,
            maker_payment_method_id: maker.payment_method_id,
            taker_payment_method_id: taker.payment_method_id,
            lock_time,
            protocol_version: trade.offer.protocol_version,
        })
    }

    /// SHA-256 over the canonical JSON encoding.
    pub fn hash(&self) -> Result<[u8; 32], EscrowError> {
        let json = serde_json::to_vec(self)?;
        Ok(crypto::sha256(&json))
    }

    pub fn sign(hash: &[u8; 32], key_ring: &KeyRing) -> Result<Vec<u8>, EscrowError> {
        key_ring.sign_hash(hash)
    }

    pub fn verify_signature(
        hash: &[u8; 32],
        signature: &[u8],
        pub_key_ring: &PubKeyRing,
    ) -> Result<(), EscrowError> {
        crypto::verify_hash_signature(&pub_key_ring.signature_pub_key, hash, signature)
    }

    pub fn buyer_multisig_pub_key(&self) -> PublicKey {
        if self.is_buyer_maker_and_seller_taker {
            self.maker_multisig_pub_key
        } else {
            self.taker_multisig_pub_key
        }
    }

    pub fn seller_multisig_pub_key(&self) -> PublicKey {
        if self.is_buyer_maker_and_seller_taker {
            self.taker_multisig_pub_key
        } else {
            self.maker_multisig_pub_key
        }
    }

    pub fn buyer_payout_address(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker {
            &self.maker_payout_address
        } else {
            &self.taker_payout_address
        }
    }

    pub fn seller_payout_address(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker {
            &self.taker_payout_address
        } else {
            &self.maker_payout_address
        }
    }

    pub fn multisig_amount(&self) -> Result<Coin, EscrowError> {
        crate::deposit::expected_multisig_amount(
            self.buyer_security_deposit,
            self.seller_security_deposit,
            self.trade_amount,
            self.tx_fee,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SomeTestTradeParams;

    #[test]
    fn payment_method_compatibility() {
        assert!(is_payment_method_compatible("SEPA", "SEPA"));
        assert!(is_payment_method_compatible("SEPA", "SEPA_INSTANT"));
        assert!(!is_payment_method_compatible("SEPA_INSTANT", "SEPA"));
        assert!(!is_payment_method_compatible("SEPA", "ZELLE"));
    }

    #[test]
    fn both_sides_build_the_same_contract() {
        let (maker_trade, taker_trade) = SomeTestTradeParams::matched_trades();
        let maker_contract = Contract::from_trade(
            &maker_trade,
            &SomeTestTradeParams::maker_node_address(),
            &SomeTestTradeParams::maker_key_ring().pub_key_ring(),
        )
        .unwrap();
        let taker_contract = Contract::from_trade(
            &taker_trade,
            &SomeTestTradeParams::taker_node_address(),
            &SomeTestTradeParams::taker_key_ring().pub_key_ring(),
        )
        .unwrap();

        assert_eq!(maker_contract, taker_contract);
        assert_eq!(maker_contract.hash().unwrap(), taker_contract.hash().unwrap());
        assert_eq!(
            maker_contract.buyer_payout_address(),
            SomeTestTradeParams::buyer_payout_address()
        );
    }

    #[test]
    fn differing_terms_change_the_hash() {
        let (maker_trade, mut taker_trade) = SomeTestTradeParams::matched_trades();
        taker_trade.amount = Coin::from_sat(taker_trade.amount.sat() - 1);
        let maker_contract = Contract::from_trade(
            &maker_trade,
            &SomeTestTradeParams::maker_node_address(),
            &SomeTestTradeParams::maker_key_ring().pub_key_ring(),
        )
        .unwrap();
        let taker_contract = Contract::from_trade(
            &taker_trade,
            &SomeTestTradeParams::taker_node_address(),
            &SomeTestTradeParams::taker_key_ring().pub_key_ring(),
        )
        .unwrap();
        assert_ne!(maker_contract.hash().unwrap(), taker_contract.hash().unwrap());
    }

    #[test]
    fn signature_verifies_against_signer_only() {
        let (maker_trade, _) = SomeTestTradeParams::matched_trades();
        let contract = Contract::from_trade(
            &maker_trade,
            &SomeTestTradeParams::maker_node_address(),
            &SomeTestTradeParams::maker_key_ring().pub_key_ring(),
        )
        .unwrap();
        let hash = contract.hash().unwrap();
        let signature = Contract::sign(&hash, &SomeTestTradeParams::maker_key_ring()).unwrap();

        Contract::verify_signature(
            &hash,
            &signature,
            &SomeTestTradeParams::maker_key_ring().pub_key_ring(),
        )
        .unwrap();
        assert!(Contract::verify_signature(
            &hash,
            &signature,
            &SomeTestTradeParams::taker_key_ring().pub_key_ring()
        )
        .is_err());
    }

    #[test]
    fn missing_peer_data_rejected() {
        let (mut maker_trade, _) = SomeTestTradeParams::matched_trades();
        maker_trade.process_model.trading_peer.multisig_pub_key = None;
        let error = Contract::from_trade(
            &maker_trade,
            &SomeTestTradeParams::maker_node_address(),
            &SomeTestTradeParams::maker_key_ring().pub_key_ring(),
        )
        .unwrap_err();
        assert!(error.is_integrity_violation());
    }
}
