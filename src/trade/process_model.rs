use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::state::State;
use super::trading_peer::TradingPeer;
use crate::common::types::{Coin, MessageState};
use crate::deposit::{
    ChangeOutput, DepositTx, InputSignature, PayoutTx, RawTransactionInput, SignedDepositTx,
    SignedPayoutTx, TxId,
};
use crate::protocol::messages::TradeMessage;

/// Trade states applied as delivery of an outbound message progresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStates {
    pub sent: Option<State>,
    pub arrived: Option<State>,
    pub stored_in_mailbox: Option<State>,
    pub send_failed: Option<State>,
}

/// Last message we sent, kept so it can be re-sent with the same uid after a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message: TradeMessage,
    pub state: MessageState,
    pub delivery_states: DeliveryStates,
}

/// Protocol working data persisted together with its trade.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    pub account_id: String,
    pub payment_account_payload_hash: [u8; 32],
    pub payment_method_id: String,

    pub my_multisig_pub_key: Option<PublicKey>,
    pub raw_transaction_inputs: Vec<RawTransactionInput>,
    pub change_output: Option<ChangeOutput>,
    pub funds_needed_for_trade: Coin,
    pub payout_address: Option<String>,
    pub taker_fee_tx_id: Option<TxId>,
    pub lock_time: Option<u32>,

    pub prepared_deposit_tx: Option<DepositTx>,
    pub deposit_input_signatures: Vec<InputSignature>,
    pub deposit_tx: Option<SignedDepositTx>,
    pub warning_tx_signature: Option<Vec<u8>>,
    pub redirect_tx_signature: Option<Vec<u8>>,

    pub payout_tx: Option<PayoutTx>,
    pub payout_tx_signature: Option<Vec<u8>>,
    pub signed_payout_tx: Option<SignedPayoutTx>,

    pub processed_message_uids: BTreeSet<String>,
    pub last_outbound: Option<OutboundMessage>,
    pub message_states: BTreeMap<String, MessageState>,

    pub trading_peer: TradingPeer,
}

impl ProcessModel {
    pub fn new(
        account_id: impl Into<String>,
        payment_account_payload_hash: [u8; 32],
        payment_method_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            payment_account_payload_hash,
            payment_method_id: payment_method_id.into(),
            my_multisig_pub_key: None,
            raw_transaction_inputs: Vec::new(),
            change_output: None,
            funds_needed_for_trade: Coin::ZERO,
            payout_address: None,
            taker_fee_tx_id: None,
            lock_time: None,
            prepared_deposit_tx: None,
            deposit_input_signatures: Vec::new(),
            deposit_tx: None,
            warning_tx_signature: None,
            redirect_tx_signature: None,
            payout_tx: None,
            payout_tx_signature: None,
            signed_payout_tx: None,
            processed_message_uids: BTreeSet::new(),
            last_outbound: None,
            message_states: BTreeMap::new(),
            trading_peer: TradingPeer::default(),
        }
    }

    pub fn is_message_processed(&self, uid: &str) -> bool {
        self.processed_message_uids.contains(uid)
    }

    pub fn mark_message_processed(&mut self, uid: impl Into<String>) {
        self.processed_message_uids.insert(uid.into());
    }

    pub fn set_message_state(&mut self, message_name: impl Into<String>, state: MessageState) {
        self.message_states.insert(message_name.into(), state);
    }

    pub fn message_state(&self, message_name: &str) -> MessageState {
        self.message_states
            .get(message_name)
            .copied()
            .unwrap_or_default()
    }
}
