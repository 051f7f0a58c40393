use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secp256k1::{rand::rngs::OsRng, PublicKey, Secp256k1, SecretKey};
use tracing::debug;
use uuid::Uuid;

use crate::common::{
    crypto,
    error::EscrowError,
    types::{Coin, FeeRate},
};
use crate::deposit::{
    sighash, ChangeOutput, DepositTx, InputSelection, InputSignature, OutPoint,
    RawTransactionInput, Transaction, TxId,
};
use crate::wallet::WalletCollaborator;

/// Transactions seen by every wallet sharing the chain.
#[derive(Clone, Default)]
pub struct MockChain {
    txs: Arc<Mutex<HashMap<TxId, Transaction>>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.txs.lock().unwrap().contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.txs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Utxo {
    outpoint: OutPoint,
    value: Coin,
}

#[derive(Default)]
struct WalletState {
    multisig_keys: HashMap<Uuid, SecretKey>,
    reservations: HashMap<Uuid, Vec<OutPoint>>,
    fee_txs: HashMap<Uuid, TxId>,
    broadcasts: usize,
    fail_broadcasts: usize,
}

/// In-memory wallet with real keys. Every UTXO is owned by one key so signatures can be checked
/// by the peer.
pub struct MockWallet {
    name: String,
    secret_key: SecretKey,
    pub_key: PublicKey,
    utxos: Vec<Utxo>,
    chain: MockChain,
    state: Mutex<WalletState>,
}

impl MockWallet {
    pub fn new(name: impl Into<String>, chain: MockChain, utxo_values: &[u64]) -> Self {
        let name = name.into();
        let secp = Secp256k1::new();
        let (secret_key, pub_key) = secp.generate_keypair(&mut OsRng);
        let funding_txid = TxId(crypto::sha256(format!("{}-funding", name).as_bytes()));
        let utxos = utxo_values
            .iter()
            .enumerate()
            .map(|(vout, value)| Utxo {
                outpoint: OutPoint {
                    txid: funding_txid,
                    vout: vout as u32,
                },
                value: Coin::from_sat(*value),
            })
            .collect();

        Self {
            name,
            secret_key,
            pub_key,
            utxos,
            chain,
            state: Mutex::new(WalletState::default()),
        }
    }

    pub fn chain(&self) -> MockChain {
        self.chain.clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.state.lock().unwrap().broadcasts
    }

    /// The next `count` broadcasts fail without reaching the chain.
    pub fn fail_next_broadcasts(&self, count: usize) {
        self.state.lock().unwrap().fail_broadcasts = count;
    }

    pub fn reserved_inputs(&self, trade_id: &Uuid) -> usize {
        self.state
            .lock()
            .unwrap()
            .reservations
            .get(trade_id)
            .map(|outpoints| outpoints.len())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WalletCollaborator for MockWallet {
    async fn new_multisig_pub_key(&self, trade_id: Uuid) -> Result<PublicKey, EscrowError> {
        let secp = Secp256k1::new();
        let mut state = self.state.lock().unwrap();
        let secret_key = *state
            .multisig_keys
            .entry(trade_id)
            .or_insert_with(|| secp.generate_keypair(&mut OsRng).0);
        Ok(PublicKey::from_secret_key(&secp, &secret_key))
    }

    async fn payout_address(&self, trade_id: Uuid) -> Result<String, EscrowError> {
        Ok(format!("{}-payout-{}", self.name, trade_id.simple()))
    }

    async fn select_inputs_and_change(
        &self,
        trade_id: Uuid,
        amount: Coin,
        _fee_rate: FeeRate,
    ) -> Result<InputSelection, EscrowError> {
        let mut state = self.state.lock().unwrap();
        state.reservations.remove(&trade_id);
        let reserved: HashSet<OutPoint> = state.reservations.values().flatten().copied().collect();

        let mut inputs = Vec::new();
        let mut total = Coin::ZERO;
        for utxo in self.utxos.iter().filter(|utxo| !reserved.contains(&utxo.outpoint)) {
            if total >= amount {
                break;
            }
            total = total.checked_add(utxo.value).unwrap();
            inputs.push(RawTransactionInput {
                outpoint: utxo.outpoint,
                value: utxo.value,
                owner_pub_key: self.pub_key,
            });
        }
        if total < amount {
            return Err(EscrowError::InsufficientFunds {
                required: amount.sat(),
                available: total.sat(),
            });
        }

        let change = (total > amount).then(|| ChangeOutput {
            address: format!("{}-change", self.name),
            value: total.checked_sub(amount).unwrap(),
        });
        state.reservations.insert(
            trade_id,
            inputs.iter().map(|input| input.outpoint).collect(),
        );
        debug!(
            "MockWallet {} reserved {} inputs for TradeUUID {}",
            self.name,
            inputs.len(),
            trade_id
        );
        Ok(InputSelection { inputs, change })
    }

    async fn publish_taker_fee_tx(&self, trade_id: Uuid, fee: Coin) -> Result<TxId, EscrowError> {
        let mut state = self.state.lock().unwrap();
        let txid = *state.fee_txs.entry(trade_id).or_insert_with(|| {
            TxId(crypto::sha256(
                format!("{}-fee-{}-{}", self.name, trade_id, fee.sat()).as_bytes(),
            ))
        });
        Ok(txid)
    }

    async fn sign_multisig_inputs(
        &self,
        unsigned_tx: &DepositTx,
        own_inputs: &[RawTransactionInput],
        _peer_inputs: &[RawTransactionInput],
        _own_multisig_pub_key: &PublicKey,
        _peer_multisig_pub_key: &PublicKey,
    ) -> Result<Vec<InputSignature>, EscrowError> {
        let txid = unsigned_tx.txid()?;
        own_inputs
            .iter()
            .map(|input| {
                if input.owner_pub_key != self.pub_key {
                    return Err(EscrowError::Simple(format!(
                        "MockWallet {} does not own input {:?}",
                        self.name, input.outpoint
                    )));
                }
                let input_index = unsigned_tx.input_index_of(&input.outpoint).ok_or_else(|| {
                    EscrowError::DataIntegrity(format!(
                        "Input {:?} not in deposit tx",
                        input.outpoint
                    ))
                })?;
                Ok(InputSignature {
                    input_index,
                    signature: crypto::sign_hash(&self.secret_key, &sighash(&txid, input_index))?,
                })
            })
            .collect()
    }

    async fn sign_with_multisig_key(
        &self,
        multisig_pub_key: &PublicKey,
        sighash: &[u8; 32],
    ) -> Result<Vec<u8>, EscrowError> {
        let secp = Secp256k1::new();
        let state = self.state.lock().unwrap();
        let secret_key = state
            .multisig_keys
            .values()
            .find(|secret_key| PublicKey::from_secret_key(&secp, secret_key) == *multisig_pub_key)
            .ok_or_else(|| {
                EscrowError::Simple(format!(
                    "MockWallet {} has no key for {}",
                    self.name, multisig_pub_key
                ))
            })?;
        crypto::sign_hash(secret_key, sighash)
    }

    async fn is_tx_known(&self, txid: &TxId) -> Result<bool, EscrowError> {
        Ok(self.chain.contains(txid))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<TxId, EscrowError> {
        let txid = tx.txid()?;
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_broadcasts > 0 {
                state.fail_broadcasts -= 1;
                return Err(EscrowError::Broadcast(format!(
                    "MockWallet {} broadcast of {} rejected",
                    self.name, txid
                )));
            }
            state.broadcasts += 1;
        }
        self.chain.txs.lock().unwrap().insert(txid, tx.clone());
        Ok(txid)
    }
}
