use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, IntoStaticStr};
use uuid::Uuid;

use crate::common::{
    error::EscrowError,
    types::{Coin, NodeAddress, PubKeyRing},
};
use crate::deposit::{
    ChangeOutput, DepositTx, InputSignature, PayoutTx, RawTransactionInput, SignedDepositTx,
    SignedPayoutTx, TxId,
};

pub const PROTOCOL_VERSION: u32 = 5;
pub const MIN_PROTOCOL_VERSION: u32 = 4;
/// First version carrying warning and redirect tx signatures.
pub const WARNING_TX_VERSION: u32 = 5;

const MAX_MESSAGE_SIZE: usize = 512 * 1024;
const ENVELOPE_KEYS: [&str; 5] = [
    "uid",
    "trade_id",
    "sender_node_address",
    "protocol_version",
    "payload",
];
const PAYLOAD_TAGS: [&str; 8] = [
    "InputsForDepositTxRequest",
    "InputsForDepositTxResponse",
    "DepositTxSigningRequest",
    "DepositTxSignaturesResponse",
    "DepositTxPublished",
    "PaymentStarted",
    "PayoutTxPublished",
    "Ack",
];
const COMPRESSED_PUB_KEY_HEX_LEN: usize = 66;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputsForDepositTxRequest {
    pub taker_pub_key_ring: PubKeyRing,
    pub taker_account_id: String,
    pub taker_payment_account_payload_hash: [u8; 32],
    pub taker_payment_method_id: String,
    pub trade_amount: Coin,
    pub taker_fee_tx_id: TxId,
    pub raw_transaction_inputs: Vec<RawTransactionInput>,
    pub change_output: Option<ChangeOutput>,
    pub taker_multisig_pub_key: PublicKey,
    pub taker_payout_address: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputsForDepositTxResponse {
    pub maker_account_id: String,
    pub maker_payment_account_payload_hash: [u8; 32],
    pub maker_payment_method_id: String,
    pub raw_transaction_inputs: Vec<RawTransactionInput>,
    pub change_output: Option<ChangeOutput>,
    pub maker_multisig_pub_key: PublicKey,
    pub maker_payout_address: String,
    pub lock_time: u32,
    pub contract_hash: [u8; 32],
    pub maker_contract_signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepositTxSigningRequest {
    pub contract_hash: [u8; 32],
    pub taker_contract_signature: Vec<u8>,
    pub deposit_tx: DepositTx,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepositTxSignaturesResponse {
    pub contract_hash: [u8; 32],
    pub maker_input_signatures: Vec<InputSignature>,
    pub warning_tx_signature: Option<Vec<u8>>,
    pub redirect_tx_signature: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepositTxPublished {
    pub contract_hash: [u8; 32],
    pub deposit_tx: SignedDepositTx,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentStarted {
    pub contract_hash: [u8; 32],
    pub payout_tx: PayoutTx,
    pub buyer_payout_signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayoutTxPublished {
    pub contract_hash: [u8; 32],
    pub payout_tx: SignedPayoutTx,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ack {
    pub ref_uid: String,
    pub ref_payload: String,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Display, IntoStaticStr)]
pub enum TradePayload {
    InputsForDepositTxRequest(InputsForDepositTxRequest),
    InputsForDepositTxResponse(InputsForDepositTxResponse),
    DepositTxSigningRequest(DepositTxSigningRequest),
    DepositTxSignaturesResponse(DepositTxSignaturesResponse),
    DepositTxPublished(DepositTxPublished),
    PaymentStarted(PaymentStarted),
    PayoutTxPublished(PayoutTxPublished),
    Ack(Ack),
}

impl TradePayload {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn contract_hash(&self) -> Option<&[u8; 32]> {
        match self {
            TradePayload::InputsForDepositTxRequest(_) | TradePayload::Ack(_) => None,
            TradePayload::InputsForDepositTxResponse(payload) => Some(&payload.contract_hash),
            TradePayload::DepositTxSigningRequest(payload) => Some(&payload.contract_hash),
            TradePayload::DepositTxSignaturesResponse(payload) => Some(&payload.contract_hash),
            TradePayload::DepositTxPublished(payload) => Some(&payload.contract_hash),
            TradePayload::PaymentStarted(payload) => Some(&payload.contract_hash),
            TradePayload::PayoutTxPublished(payload) => Some(&payload.contract_hash),
        }
    }
}

/// Versioned envelope of every peer message of a trade.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradeMessage {
    pub uid: String,
    pub trade_id: Uuid,
    pub sender_node_address: NodeAddress,
    pub protocol_version: u32,
    pub payload: TradePayload,
}

fn disallowed(reason: impl Into<String>) -> EscrowError {
    EscrowError::DisallowedPayload(reason.into())
}

impl TradeMessage {
    pub fn new(
        trade_id: Uuid,
        sender_node_address: NodeAddress,
        protocol_version: u32,
        payload: TradePayload,
    ) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            trade_id,
            sender_node_address,
            protocol_version,
            payload,
        }
    }

    pub fn ack(
        trade_id: Uuid,
        sender_node_address: NodeAddress,
        protocol_version: u32,
        acked: &TradeMessage,
        error_message: Option<String>,
    ) -> Self {
        let payload = TradePayload::Ack(Ack {
            ref_uid: acked.uid.clone(),
            ref_payload: acked.payload.name().to_string(),
            success: error_message.is_none(),
            error_message,
        });
        Self::new(trade_id, sender_node_address, protocol_version, payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EscrowError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Checks the raw shape against the allow-list before materialising the typed message.
    pub fn decode(bytes: &[u8]) -> Result<Self, EscrowError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(disallowed(format!(
                "Message of {} bytes exceeds limit of {} bytes",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let value: Value = serde_json::from_slice(bytes)
            .map_err(|error| disallowed(format!("Message is not JSON - {}", error)))?;
        Self::check_shape(&value)?;

        let message: TradeMessage = serde_json::from_value(value)
            .map_err(|error| disallowed(format!("Message does not deserialize - {}", error)))?;
        message.validate()?;
        Ok(message)
    }

    fn check_shape(value: &Value) -> Result<(), EscrowError> {
        let Some(envelope) = value.as_object() else {
            return Err(disallowed("Message is not a JSON object"));
        };
        if envelope.len() != ENVELOPE_KEYS.len()
            || !ENVELOPE_KEYS.iter().all(|key| envelope.contains_key(*key))
        {
            let keys: Vec<&String> = envelope.keys().collect();
            return Err(disallowed(format!("Unexpected envelope keys {:?}", keys)));
        }

        let Some(payload) = envelope.get("payload").and_then(Value::as_object) else {
            return Err(disallowed("Payload is not a JSON object"));
        };
        if payload.len() != 1 {
            return Err(disallowed("Payload must carry exactly one tag"));
        }
        if let Some(tag) = payload.keys().next() {
            if !PAYLOAD_TAGS.contains(&tag.as_str()) {
                return Err(disallowed(format!("Payload tag {} not allowed", tag)));
            }
        }
        check_pub_keys(value)
    }

    /// Field presence rules that depend on the protocol version or that types can't express.
    pub fn validate(&self) -> Result<(), EscrowError> {
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&self.protocol_version) {
            return Err(disallowed(format!(
                "Protocol version {} not supported",
                self.protocol_version
            )));
        }
        if self.uid.is_empty() {
            return Err(disallowed("Message uid is empty"));
        }

        let has_warning_txs = self.protocol_version >= WARNING_TX_VERSION;
        match &self.payload {
            TradePayload::InputsForDepositTxRequest(request) => {
                if request.raw_transaction_inputs.is_empty() {
                    return Err(disallowed("Taker inputs are empty"));
                }
                if request.taker_account_id.is_empty() || request.taker_payout_address.is_empty() {
                    return Err(disallowed("Taker account id or payout address is empty"));
                }
            }
            TradePayload::InputsForDepositTxResponse(response) => {
                if response.raw_transaction_inputs.is_empty() {
                    return Err(disallowed("Maker inputs are empty"));
                }
                if response.maker_account_id.is_empty() || response.maker_payout_address.is_empty()
                {
                    return Err(disallowed("Maker account id or payout address is empty"));
                }
                if response.maker_contract_signature.is_empty() {
                    return Err(disallowed("Maker contract signature is empty"));
                }
            }
            TradePayload::DepositTxSigningRequest(request) => {
                if request.taker_contract_signature.is_empty() {
                    return Err(disallowed("Taker contract signature is empty"));
                }
                if request.deposit_tx.taker_inputs.is_empty()
                    || request.deposit_tx.maker_inputs.is_empty()
                {
                    return Err(disallowed("Deposit tx lacks inputs of one side"));
                }
            }
            TradePayload::DepositTxSignaturesResponse(response) => {
                if response.maker_input_signatures.is_empty() {
                    return Err(disallowed("Maker input signatures are empty"));
                }
                let present = (
                    response.warning_tx_signature.is_some(),
                    response.redirect_tx_signature.is_some(),
                );
                match (has_warning_txs, present) {
                    (true, (true, true)) | (false, (false, false)) => {}
                    (true, _) => {
                        return Err(disallowed(format!(
                            "Warning and redirect signatures required from version {}",
                            WARNING_TX_VERSION
                        )))
                    }
                    (false, _) => {
                        return Err(disallowed(format!(
                            "Warning and redirect signatures not allowed below version {}",
                            WARNING_TX_VERSION
                        )))
                    }
                }
            }
            TradePayload::DepositTxPublished(published) => {
                if published.deposit_tx.signatures.is_empty() {
                    return Err(disallowed("Published deposit tx carries no signatures"));
                }
            }
            TradePayload::PaymentStarted(started) => {
                if started.buyer_payout_signature.is_empty() {
                    return Err(disallowed("Buyer payout signature is empty"));
                }
            }
            TradePayload::PayoutTxPublished(_) => {}
            TradePayload::Ack(ack) => {
                if ack.ref_uid.is_empty() {
                    return Err(disallowed("Ack without referenced uid"));
                }
            }
        }
        Ok(())
    }
}

/// Every field named like a public key must hold a compressed 33 byte key.
fn check_pub_keys(value: &Value) -> Result<(), EscrowError> {
    match value {
        Value::Object(map) => {
            for (key, field) in map {
                if key.ends_with("pub_key") {
                    let length = field.as_str().map(str::len);
                    if length != Some(COMPRESSED_PUB_KEY_HEX_LEN) {
                        return Err(disallowed(format!("Field {} is not a compressed key", key)));
                    }
                } else {
                    check_pub_keys(field)?;
                }
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(check_pub_keys),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::KeyRing;

    fn ack_message(protocol_version: u32) -> TradeMessage {
        let acked = TradeMessage::new(
            Uuid::new_v4(),
            NodeAddress::new("peer.onion", 9999),
            protocol_version,
            TradePayload::PayoutTxPublished(PayoutTxPublished {
                contract_hash: [1u8; 32],
                payout_tx: crate::testing::SomeTestTradeParams::signed_payout_tx(),
            }),
        );
        TradeMessage::ack(
            acked.trade_id,
            NodeAddress::new("me.onion", 9999),
            protocol_version,
            &acked,
            None,
        )
    }

    fn signatures_response(protocol_version: u32, with_warning: bool) -> TradeMessage {
        let signature = vec![3u8; 70];
        TradeMessage::new(
            Uuid::new_v4(),
            NodeAddress::new("peer.onion", 9999),
            protocol_version,
            TradePayload::DepositTxSignaturesResponse(DepositTxSignaturesResponse {
                contract_hash: [2u8; 32],
                maker_input_signatures: vec![InputSignature {
                    input_index: 1,
                    signature: signature.clone(),
                }],
                warning_tx_signature: with_warning.then(|| signature.clone()),
                redirect_tx_signature: with_warning.then(|| signature.clone()),
            }),
        )
    }

    #[test]
    fn encoded_message_decodes_equal() {
        let message = ack_message(PROTOCOL_VERSION);
        let decoded = TradeMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn unknown_envelope_key_rejected() {
        let message = ack_message(PROTOCOL_VERSION);
        let mut value = serde_json::to_value(&message).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("class".to_string(), Value::String("java.lang.Runtime".to_string()));
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            TradeMessage::decode(&bytes),
            Err(EscrowError::DisallowedPayload(_))
        ));
    }

    #[test]
    fn unknown_payload_tag_rejected() {
        let message = ack_message(PROTOCOL_VERSION);
        let mut value = serde_json::to_value(&message).unwrap();
        value["payload"] = serde_json::json!({ "Gadget": { "command": "rm" } });
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            TradeMessage::decode(&bytes),
            Err(EscrowError::DisallowedPayload(_))
        ));
    }

    #[test]
    fn unknown_payload_field_rejected() {
        let message = ack_message(PROTOCOL_VERSION);
        let mut value = serde_json::to_value(&message).unwrap();
        value["payload"]["Ack"]["extra"] = Value::Bool(true);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            TradeMessage::decode(&bytes),
            Err(EscrowError::DisallowedPayload(_))
        ));
    }

    #[test]
    fn non_object_and_oversized_rejected() {
        assert!(TradeMessage::decode(b"[1,2,3]").is_err());
        assert!(TradeMessage::decode(b"not json").is_err());
        let oversized = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            TradeMessage::decode(&oversized),
            Err(EscrowError::DisallowedPayload(_))
        ));
    }

    #[test]
    fn warning_signatures_follow_version() {
        let message = signatures_response(PROTOCOL_VERSION, true);
        TradeMessage::decode(&message.encode().unwrap()).unwrap();

        let message = signatures_response(PROTOCOL_VERSION, false);
        assert!(TradeMessage::decode(&message.encode().unwrap()).is_err());

        let message = signatures_response(MIN_PROTOCOL_VERSION, true);
        assert!(TradeMessage::decode(&message.encode().unwrap()).is_err());

        let message = signatures_response(MIN_PROTOCOL_VERSION, false);
        TradeMessage::decode(&message.encode().unwrap()).unwrap();
    }

    #[test]
    fn unsupported_version_rejected() {
        let message = ack_message(PROTOCOL_VERSION + 1);
        assert!(TradeMessage::decode(&message.encode().unwrap()).is_err());
    }

    #[test]
    fn uncompressed_key_rejected() {
        let key_ring = KeyRing::generate();
        let uncompressed = hex::encode(
            key_ring
                .pub_key_ring()
                .signature_pub_key
                .serialize_uncompressed(),
        );
        let value = serde_json::json!({ "signature_pub_key": uncompressed });
        assert!(check_pub_keys(&value).is_err());

        let compressed = key_ring.pub_key_ring().signature_pub_key.to_string();
        let value = serde_json::json!({ "nested": [{ "owner_pub_key": compressed }] });
        check_pub_keys(&value).unwrap();
    }
}
