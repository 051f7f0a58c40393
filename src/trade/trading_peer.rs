use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::common::types::{NodeAddress, PubKeyRing};
use crate::deposit::{ChangeOutput, InputSignature, RawTransactionInput, TxId};

/// What we learned about the counterparty. Nothing in here is trusted before it was checked
/// by the task that stored it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingPeer {
    pub node_address: Option<NodeAddress>,
    pub pub_key_ring: Option<PubKeyRing>,
    pub account_id: Option<String>,
    pub multisig_pub_key: Option<PublicKey>,
    pub raw_transaction_inputs: Vec<RawTransactionInput>,
    pub change_output: Option<ChangeOutput>,
    pub payout_address: Option<String>,
    pub payment_account_payload_hash: Option<[u8; 32]>,
    pub payment_method_id: Option<String>,
    pub taker_fee_tx_id: Option<TxId>,
    pub contract_signature: Option<Vec<u8>>,
    pub deposit_input_signatures: Vec<InputSignature>,
    pub payout_tx_signature: Option<Vec<u8>>,
    pub warning_tx_signature: Option<Vec<u8>>,
    pub redirect_tx_signature: Option<Vec<u8>>,
}
