use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{
    error::EscrowError,
    types::{Coin, Direction, NodeAddress, PubKeyRing},
};
use crate::protocol::messages::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

/// Terms published by a maker. `direction` is seen from the maker's side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub direction: Direction,
    pub amount: Coin,
    pub min_amount: Coin,
    /// Counter currency minor units per BTC.
    pub price: u64,
    pub counter_currency_code: String,
    pub payment_method_id: String,
    pub buyer_security_deposit: Coin,
    pub seller_security_deposit: Coin,
    pub tx_fee: Coin,
    pub taker_fee: Coin,
    pub maker_node_address: NodeAddress,
    pub maker_pub_key_ring: PubKeyRing,
    pub protocol_version: u32,
}

impl Offer {
    pub fn is_amount_in_range(&self, amount: Coin) -> bool {
        amount >= self.min_amount && amount <= self.amount
    }
}

pub struct OfferBuilder {
    id: Option<Uuid>,
    direction: Option<Direction>,
    amount: Option<Coin>,
    min_amount: Option<Coin>,
    price: Option<u64>,
    counter_currency_code: Option<String>,
    payment_method_id: Option<String>,
    buyer_security_deposit: Option<Coin>,
    seller_security_deposit: Option<Coin>,
    tx_fee: Option<Coin>,
    taker_fee: Option<Coin>,
    maker_node_address: Option<NodeAddress>,
    maker_pub_key_ring: Option<PubKeyRing>,
    protocol_version: u32,
}

impl Default for OfferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OfferBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            direction: None,
            amount: None,
            min_amount: None,
            price: None,
            counter_currency_code: None,
            payment_method_id: None,
            buyer_security_deposit: None,
            seller_security_deposit: None,
            tx_fee: None,
            taker_fee: None,
            maker_node_address: None,
            maker_pub_key_ring: None,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn id(&mut self, id: Uuid) -> &mut Self {
        self.id = Some(id);
        self
    }

    pub fn direction(&mut self, direction: Direction) -> &mut Self {
        self.direction = Some(direction);
        self
    }

    pub fn amount(&mut self, amount: Coin) -> &mut Self {
        self.amount = Some(amount);
        self
    }

    pub fn min_amount(&mut self, min_amount: Coin) -> &mut Self {
        self.min_amount = Some(min_amount);
        self
    }

    pub fn price(&mut self, price: u64) -> &mut Self {
        self.price = Some(price);
        self
    }

    pub fn counter_currency_code(&mut self, code: impl Into<String>) -> &mut Self {
        self.counter_currency_code = Some(code.into());
        self
    }

    pub fn payment_method_id(&mut self, payment_method_id: impl Into<String>) -> &mut Self {
        self.payment_method_id = Some(payment_method_id.into());
        self
    }

    pub fn buyer_security_deposit(&mut self, deposit: Coin) -> &mut Self {
        self.buyer_security_deposit = Some(deposit);
        self
    }

    pub fn seller_security_deposit(&mut self, deposit: Coin) -> &mut Self {
        self.seller_security_deposit = Some(deposit);
        self
    }

    pub fn tx_fee(&mut self, tx_fee: Coin) -> &mut Self {
        self.tx_fee = Some(tx_fee);
        self
    }

    pub fn taker_fee(&mut self, taker_fee: Coin) -> &mut Self {
        self.taker_fee = Some(taker_fee);
        self
    }

    pub fn maker_node_address(&mut self, address: NodeAddress) -> &mut Self {
        self.maker_node_address = Some(address);
        self
    }

    pub fn maker_pub_key_ring(&mut self, pub_key_ring: PubKeyRing) -> &mut Self {
        self.maker_pub_key_ring = Some(pub_key_ring);
        self
    }

    pub fn protocol_version(&mut self, protocol_version: u32) -> &mut Self {
        self.protocol_version = protocol_version;
        self
    }

    pub fn build(&self) -> Result<Offer, EscrowError> {
        let Some(direction) = self.direction else {
            return Err(EscrowError::Simple("No Offer direction defined".to_string()));
        };

        let Some(amount) = self.amount else {
            return Err(EscrowError::Simple("No Offer amount defined".to_string()));
        };

        let min_amount = self.min_amount.unwrap_or(amount);
        if min_amount > amount || amount.is_zero() {
            return Err(EscrowError::Simple(format!(
                "Offer amount range {} to {} invalid",
                min_amount, amount
            )));
        }

        let Some(price) = self.price else {
            return Err(EscrowError::Simple("No Offer price defined".to_string()));
        };

        let Some(counter_currency_code) = self.counter_currency_code.as_ref() else {
            return Err(EscrowError::Simple(
                "No Offer counter currency defined".to_string(),
            ));
        };

        let Some(payment_method_id) = self.payment_method_id.as_ref() else {
            return Err(EscrowError::Simple(
                "No Offer payment method defined".to_string(),
            ));
        };

        let (Some(buyer_security_deposit), Some(seller_security_deposit)) =
            (self.buyer_security_deposit, self.seller_security_deposit)
        else {
            return Err(EscrowError::Simple(
                "No Offer security deposits defined".to_string(),
            ));
        };

        let Some(tx_fee) = self.tx_fee else {
            return Err(EscrowError::Simple("No Offer tx fee defined".to_string()));
        };

        let Some(maker_node_address) = self.maker_node_address.as_ref() else {
            return Err(EscrowError::Simple(
                "No Offer maker node address defined".to_string(),
            ));
        };

        let Some(maker_pub_key_ring) = self.maker_pub_key_ring else {
            return Err(EscrowError::Simple(
                "No Offer maker pub key ring defined".to_string(),
            ));
        };

        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&self.protocol_version) {
            return Err(EscrowError::Simple(format!(
                "Offer protocol version {} not supported",
                self.protocol_version
            )));
        }

        Ok(Offer {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            direction,
            amount,
            min_amount,
            price,
            counter_currency_code: counter_currency_code.to_owned(),
            payment_method_id: payment_method_id.to_owned(),
            buyer_security_deposit,
            seller_security_deposit,
            tx_fee,
            taker_fee: self.taker_fee.unwrap_or(Coin::ZERO),
            maker_node_address: maker_node_address.to_owned(),
            maker_pub_key_ring,
            protocol_version: self.protocol_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SomeTestOfferParams;

    #[test]
    fn build_requires_direction() {
        let mut builder = SomeTestOfferParams::default_builder();
        builder.direction = None;
        assert!(builder.build().is_err());
    }

    #[test]
    fn build_rejects_inverted_range() {
        let mut builder = SomeTestOfferParams::default_builder();
        builder.min_amount(Coin::from_sat(2)).amount(Coin::from_sat(1));
        assert!(builder.build().is_err());
    }

    #[test]
    fn build_rejects_unknown_protocol_version() {
        let mut builder = SomeTestOfferParams::default_builder();
        builder.protocol_version(PROTOCOL_VERSION + 1);
        assert!(builder.build().is_err());
    }

    #[test]
    fn amount_range() {
        let offer = SomeTestOfferParams::default_builder().build().unwrap();
        assert!(offer.is_amount_in_range(offer.amount));
        assert!(offer.is_amount_in_range(offer.min_amount));
        assert!(!offer.is_amount_in_range(Coin::from_sat(offer.amount.sat() + 1)));
    }
}
