use async_trait::async_trait;
use secp256k1::PublicKey;
use uuid::Uuid;

use crate::common::{
    error::EscrowError,
    types::{Coin, FeeRate},
};
use crate::deposit::{DepositTx, InputSelection, InputSignature, RawTransactionInput, Transaction, TxId};

/// Everything the protocol needs from a wallet. Key derivation and coin selection stay behind
/// this boundary.
#[async_trait]
pub trait WalletCollaborator: Send + Sync {
    async fn new_multisig_pub_key(&self, trade_id: Uuid) -> Result<PublicKey, EscrowError>;

    async fn payout_address(&self, trade_id: Uuid) -> Result<String, EscrowError>;

    /// Reserves inputs worth at least `amount` and returns them with the change output.
    /// Fails with `EscrowError::InsufficientFunds` when the balance does not cover it.
    async fn select_inputs_and_change(
        &self,
        trade_id: Uuid,
        amount: Coin,
        fee_rate: FeeRate,
    ) -> Result<InputSelection, EscrowError>;

    async fn publish_taker_fee_tx(&self, trade_id: Uuid, fee: Coin) -> Result<TxId, EscrowError>;

    /// Signs the caller's own inputs of the deposit tx. Peer inputs are passed for
    /// verification only.
    async fn sign_multisig_inputs(
        &self,
        unsigned_tx: &DepositTx,
        own_inputs: &[RawTransactionInput],
        peer_inputs: &[RawTransactionInput],
        own_multisig_pub_key: &PublicKey,
        peer_multisig_pub_key: &PublicKey,
    ) -> Result<Vec<InputSignature>, EscrowError>;

    async fn sign_with_multisig_key(
        &self,
        multisig_pub_key: &PublicKey,
        sighash: &[u8; 32],
    ) -> Result<Vec<u8>, EscrowError>;

    async fn is_tx_known(&self, txid: &TxId) -> Result<bool, EscrowError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<TxId, EscrowError>;
}
