use std::any::Any;
use std::str::FromStr;

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{crypto, types::*};
use crate::deposit::{expected_multisig_amount, PayoutTx, SignedPayoutTx, TxId};
use crate::protocol::messages::PROTOCOL_VERSION;
use crate::trade::{OfferBuilder, ProcessModel, Trade};

pub struct SomeTestOfferParams {}

impl SomeTestOfferParams {
    pub fn some_uuid() -> Uuid {
        Uuid::from_str("20c38e4b-037b-4654-b99c-1d9f2beb755f").unwrap()
    }

    pub fn amount() -> Coin {
        Coin::from_sat(50_000_000)
    }

    pub fn security_deposit() -> Coin {
        Coin::from_sat(7_500_000)
    }

    pub fn tx_fee() -> Coin {
        Coin::from_sat(50_000)
    }

    /// Maker sells, so the taker ends up as buyer.
    pub fn default_builder() -> OfferBuilder {
        let mut builder = OfferBuilder::new();
        builder
            .id(Self::some_uuid())
            .direction(Direction::Sell)
            .amount(Self::amount())
            .min_amount(Coin::from_sat(25_000_000))
            .price(6_000_000) // 60,000.00 EUR / BTC
            .counter_currency_code("EUR")
            .payment_method_id("SEPA")
            .buyer_security_deposit(Self::security_deposit())
            .seller_security_deposit(Self::security_deposit())
            .tx_fee(Self::tx_fee())
            .taker_fee(Coin::from_sat(150_000))
            .maker_node_address(SomeTestTradeParams::maker_node_address())
            .maker_pub_key_ring(SomeTestTradeParams::maker_key_ring().pub_key_ring())
            .protocol_version(PROTOCOL_VERSION);
        builder
    }
}

pub struct SomeTestTradeParams {}

impl SomeTestTradeParams {
    fn secret_key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn public_key(secret_key: &SecretKey) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), secret_key)
    }

    pub fn maker_key_ring() -> KeyRing {
        KeyRing::new(Self::secret_key(0x01))
    }

    pub fn taker_key_ring() -> KeyRing {
        KeyRing::new(Self::secret_key(0x02))
    }

    pub fn maker_multisig_secret_key() -> SecretKey {
        Self::secret_key(0x03)
    }

    pub fn taker_multisig_secret_key() -> SecretKey {
        Self::secret_key(0x04)
    }

    pub fn maker_node_address() -> NodeAddress {
        NodeAddress::new("makerxxxxxxxxxxx.onion", 9999)
    }

    pub fn taker_node_address() -> NodeAddress {
        NodeAddress::new("takerxxxxxxxxxxx.onion", 9999)
    }

    pub fn maker_payment_account_payload() -> SomeTestPaymentAccountPayload {
        SomeTestPaymentAccountPayload {
            payment_method_id: "SEPA".to_string(),
            holder_name: "Maker Holder".to_string(),
            iban: "DE89370400440532013000".to_string(),
        }
    }

    pub fn taker_payment_account_payload() -> SomeTestPaymentAccountPayload {
        SomeTestPaymentAccountPayload {
            payment_method_id: "SEPA_INSTANT".to_string(),
            holder_name: "Taker Holder".to_string(),
            iban: "FR1420041010050500013M02606".to_string(),
        }
    }

    fn payload_hash(payload: SomeTestPaymentAccountPayload) -> [u8; 32] {
        let payload: Box<dyn PaymentAccountPayload> = Box::new(payload);
        payload.hash().unwrap()
    }

    pub fn maker_process_model() -> ProcessModel {
        ProcessModel::new(
            "maker-account",
            Self::payload_hash(Self::maker_payment_account_payload()),
            "SEPA",
        )
    }

    pub fn taker_process_model() -> ProcessModel {
        ProcessModel::new(
            "taker-account",
            Self::payload_hash(Self::taker_payment_account_payload()),
            "SEPA_INSTANT",
        )
    }

    pub fn buyer_payout_address() -> String {
        "taker-payout-address".to_string()
    }

    pub fn seller_payout_address() -> String {
        "maker-payout-address".to_string()
    }

    pub fn taker_fee_tx_id() -> TxId {
        TxId([0x09; 32])
    }

    pub fn lock_time() -> u32 {
        4320
    }

    /// Maker and taker side of the default offer after both exchanged their contract inputs.
    /// The taker is still in `OfferTaken`.
    pub fn matched_trades() -> (Trade, Trade) {
        let offer = SomeTestOfferParams::default_builder().build().unwrap();
        let maker_process_model = Self::maker_process_model();
        let taker_process_model = Self::taker_process_model();

        let mut maker_trade =
            Trade::new(offer.clone(), true, offer.amount, maker_process_model.clone()).unwrap();
        let mut taker_trade =
            Trade::new(offer.clone(), false, offer.amount, taker_process_model.clone()).unwrap();

        let maker_multisig_pub_key = Self::public_key(&Self::maker_multisig_secret_key());
        let taker_multisig_pub_key = Self::public_key(&Self::taker_multisig_secret_key());

        let model = &mut maker_trade.process_model;
        model.my_multisig_pub_key = Some(maker_multisig_pub_key);
        model.payout_address = Some(Self::seller_payout_address());
        model.taker_fee_tx_id = Some(Self::taker_fee_tx_id());
        model.lock_time = Some(Self::lock_time());
        let peer = &mut model.trading_peer;
        peer.node_address = Some(Self::taker_node_address());
        peer.pub_key_ring = Some(Self::taker_key_ring().pub_key_ring());
        peer.account_id = Some(taker_process_model.account_id.clone());
        peer.multisig_pub_key = Some(taker_multisig_pub_key);
        peer.payout_address = Some(Self::buyer_payout_address());
        peer.payment_account_payload_hash = Some(taker_process_model.payment_account_payload_hash);
        peer.payment_method_id = Some(taker_process_model.payment_method_id.clone());
        peer.taker_fee_tx_id = Some(Self::taker_fee_tx_id());
        maker_trade.trading_peer_node_address = Some(Self::taker_node_address());

        let model = &mut taker_trade.process_model;
        model.my_multisig_pub_key = Some(taker_multisig_pub_key);
        model.payout_address = Some(Self::buyer_payout_address());
        model.taker_fee_tx_id = Some(Self::taker_fee_tx_id());
        model.lock_time = Some(Self::lock_time());
        let peer = &mut model.trading_peer;
        peer.node_address = Some(Self::maker_node_address());
        peer.pub_key_ring = Some(Self::maker_key_ring().pub_key_ring());
        peer.account_id = Some(maker_process_model.account_id.clone());
        peer.multisig_pub_key = Some(maker_multisig_pub_key);
        peer.payout_address = Some(Self::seller_payout_address());
        peer.payment_account_payload_hash = Some(maker_process_model.payment_account_payload_hash);
        peer.payment_method_id = Some(maker_process_model.payment_method_id.clone());
        taker_trade.trading_peer_node_address = Some(Self::maker_node_address());

        (maker_trade, taker_trade)
    }

    /// Payout of the default offer, signed by both multisig keys.
    pub fn signed_payout_tx() -> SignedPayoutTx {
        let deposit = SomeTestOfferParams::security_deposit();
        let tx_fee = SomeTestOfferParams::tx_fee();
        let amount = SomeTestOfferParams::amount();
        let tx = PayoutTx::new(
            TxId([0x07; 32]),
            expected_multisig_amount(deposit, deposit, amount, tx_fee).unwrap(),
            Self::buyer_payout_address(),
            Self::seller_payout_address(),
            amount,
            deposit,
            deposit,
            tx_fee,
        )
        .unwrap();
        let sighash = tx.payout_sighash().unwrap();

        SignedPayoutTx {
            buyer_signature: crypto::sign_hash(&Self::taker_multisig_secret_key(), &sighash)
                .unwrap(),
            seller_signature: crypto::sign_hash(&Self::maker_multisig_secret_key(), &sighash)
                .unwrap(),
            tx,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SomeTestPaymentAccountPayload {
    pub payment_method_id: String,
    pub holder_name: String,
    pub iban: String,
}

#[typetag::serde(name = "some-test-payment-account")]
impl PaymentAccountPayload for SomeTestPaymentAccountPayload {
    fn payment_method_id(&self) -> &str {
        &self.payment_method_id
    }

    fn any_ref(&self) -> &dyn Any {
        self
    }
}
