use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::payout::SignedPayoutTx;
use crate::common::{
    crypto,
    error::EscrowError,
    types::Coin,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TxId({})", self.to_hex())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransactionInput {
    pub outpoint: OutPoint,
    pub value: Coin,
    pub owner_pub_key: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOutput {
    pub address: String,
    pub value: Coin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigOutput {
    pub amount: Coin,
    pub buyer_pub_key: PublicKey,
    pub seller_pub_key: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSignature {
    pub input_index: u32,
    pub signature: Vec<u8>,
}

/// Inputs reserved by a wallet for one side of the deposit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSelection {
    pub inputs: Vec<RawTransactionInput>,
    pub change: Option<ChangeOutput>,
}

impl InputSelection {
    pub fn contribution(&self) -> Result<Coin, EscrowError> {
        contribution_of(&self.inputs, self.change.as_ref())
    }
}

fn contribution_of(
    inputs: &[RawTransactionInput],
    change: Option<&ChangeOutput>,
) -> Result<Coin, EscrowError> {
    let total = Coin::checked_sum(inputs.iter().map(|input| &input.value))
        .ok_or_else(|| EscrowError::DataIntegrity("Input values overflow".to_string()))?;
    let change = change.map(|change| change.value).unwrap_or(Coin::ZERO);
    total.checked_sub(change).ok_or_else(|| {
        EscrowError::DataIntegrity(format!(
            "Change output {} exceeds inputs {}",
            change, total
        ))
    })
}

/// Buyer funds its deposit plus two fees (deposit tx miner fee and the fee reserved for the
/// payout), seller funds its deposit plus the trade amount.
pub fn required_contribution(
    is_buyer: bool,
    trade_amount: Coin,
    own_security_deposit: Coin,
    tx_fee: Coin,
) -> Result<Coin, EscrowError> {
    let required = if is_buyer {
        tx_fee
            .checked_mul(2)
            .and_then(|fees| own_security_deposit.checked_add(fees))
    } else {
        own_security_deposit.checked_add(trade_amount)
    };
    required.ok_or_else(|| EscrowError::DataIntegrity("Contribution overflows".to_string()))
}

pub fn expected_multisig_amount(
    buyer_security_deposit: Coin,
    seller_security_deposit: Coin,
    trade_amount: Coin,
    tx_fee: Coin,
) -> Result<Coin, EscrowError> {
    Coin::checked_sum(&[
        buyer_security_deposit,
        seller_security_deposit,
        trade_amount,
        tx_fee,
    ])
    .ok_or_else(|| EscrowError::DataIntegrity("Multisig amount overflows".to_string()))
}

pub fn sighash(txid: &TxId, input_index: u32) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(36);
    preimage.extend_from_slice(&txid.0);
    preimage.extend_from_slice(&input_index.to_le_bytes());
    crypto::sha256(&preimage)
}

pub struct DepositTxParams<'a> {
    pub trade_amount: Coin,
    pub buyer_security_deposit: Coin,
    pub seller_security_deposit: Coin,
    pub tx_fee: Coin,
    pub taker_is_buyer: bool,
    pub taker_inputs: &'a [RawTransactionInput],
    pub taker_change: Option<&'a ChangeOutput>,
    pub maker_inputs: &'a [RawTransactionInput],
    pub maker_change: Option<&'a ChangeOutput>,
    pub buyer_multisig_pub_key: PublicKey,
    pub seller_multisig_pub_key: PublicKey,
    pub lock_time: u32,
}

/// Witness-stripped deposit transaction. Taker inputs come first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositTx {
    pub taker_inputs: Vec<RawTransactionInput>,
    pub maker_inputs: Vec<RawTransactionInput>,
    pub multisig_output: MultisigOutput,
    pub taker_change: Option<ChangeOutput>,
    pub maker_change: Option<ChangeOutput>,
    pub lock_time: u32,
}

impl DepositTx {
    pub fn build(params: DepositTxParams) -> Result<Self, EscrowError> {
        if params.taker_inputs.is_empty() || params.maker_inputs.is_empty() {
            return Err(EscrowError::DataIntegrity(
                "Deposit tx needs inputs from both parties".to_string(),
            ));
        }

        let (taker_deposit, maker_deposit) = if params.taker_is_buyer {
            (params.buyer_security_deposit, params.seller_security_deposit)
        } else {
            (params.seller_security_deposit, params.buyer_security_deposit)
        };
        Self::check_contribution(
            "taker",
            params.taker_inputs,
            params.taker_change,
            required_contribution(
                params.taker_is_buyer,
                params.trade_amount,
                taker_deposit,
                params.tx_fee,
            )?,
        )?;
        Self::check_contribution(
            "maker",
            params.maker_inputs,
            params.maker_change,
            required_contribution(
                !params.taker_is_buyer,
                params.trade_amount,
                maker_deposit,
                params.tx_fee,
            )?,
        )?;

        let tx = DepositTx {
            taker_inputs: params.taker_inputs.to_vec(),
            maker_inputs: params.maker_inputs.to_vec(),
            multisig_output: MultisigOutput {
                amount: expected_multisig_amount(
                    params.buyer_security_deposit,
                    params.seller_security_deposit,
                    params.trade_amount,
                    params.tx_fee,
                )?,
                buyer_pub_key: params.buyer_multisig_pub_key,
                seller_pub_key: params.seller_multisig_pub_key,
            },
            taker_change: params.taker_change.cloned(),
            maker_change: params.maker_change.cloned(),
            lock_time: params.lock_time,
        };
        tx.verify_amounts(
            params.buyer_security_deposit,
            params.seller_security_deposit,
            params.trade_amount,
            params.tx_fee,
        )?;
        Ok(tx)
    }

    fn check_contribution(
        side: &str,
        inputs: &[RawTransactionInput],
        change: Option<&ChangeOutput>,
        required: Coin,
    ) -> Result<(), EscrowError> {
        let contribution = contribution_of(inputs, change)?;
        if contribution != required {
            return Err(EscrowError::DataIntegrity(format!(
                "The {} contributes {} but {} is required",
                side, contribution, required
            )));
        }
        Ok(())
    }

    /// Checks the multisig output against the agreed amounts and that the implied miner fee is
    /// exactly one tx fee.
    pub fn verify_amounts(
        &self,
        buyer_security_deposit: Coin,
        seller_security_deposit: Coin,
        trade_amount: Coin,
        tx_fee: Coin,
    ) -> Result<(), EscrowError> {
        let expected = expected_multisig_amount(
            buyer_security_deposit,
            seller_security_deposit,
            trade_amount,
            tx_fee,
        )?;
        if self.multisig_output.amount != expected {
            return Err(EscrowError::DataIntegrity(format!(
                "Multisig output {} does not match expected {}",
                self.multisig_output.amount, expected
            )));
        }

        let mut outpoints = HashSet::new();
        for input in self.inputs() {
            if input.value.is_zero() {
                return Err(EscrowError::DataIntegrity(format!(
                    "Input {}:{} has zero value",
                    input.outpoint.txid, input.outpoint.vout
                )));
            }
            if !outpoints.insert(input.outpoint) {
                return Err(EscrowError::DataIntegrity(format!(
                    "Input {}:{} spent twice",
                    input.outpoint.txid, input.outpoint.vout
                )));
            }
        }

        let total_in = Coin::checked_sum(self.inputs().map(|input| &input.value))
            .ok_or_else(|| EscrowError::DataIntegrity("Input values overflow".to_string()))?;
        let total_out = Coin::checked_sum(
            self.taker_change
                .iter()
                .chain(self.maker_change.iter())
                .map(|change| &change.value)
                .chain(std::iter::once(&self.multisig_output.amount)),
        )
        .ok_or_else(|| EscrowError::DataIntegrity("Output values overflow".to_string()))?;
        let miner_fee = total_in.checked_sub(total_out).ok_or_else(|| {
            EscrowError::DataIntegrity(format!(
                "Outputs {} exceed inputs {}",
                total_out, total_in
            ))
        })?;
        if miner_fee != tx_fee {
            return Err(EscrowError::DataIntegrity(format!(
                "Implied miner fee {} does not match tx fee {}",
                miner_fee, tx_fee
            )));
        }
        Ok(())
    }

    pub fn inputs(&self) -> impl Iterator<Item = &RawTransactionInput> {
        self.taker_inputs.iter().chain(self.maker_inputs.iter())
    }

    pub fn input_count(&self) -> usize {
        self.taker_inputs.len() + self.maker_inputs.len()
    }

    pub fn input_index_of(&self, outpoint: &OutPoint) -> Option<u32> {
        self.inputs()
            .position(|input| &input.outpoint == outpoint)
            .map(|index| index as u32)
    }

    pub fn txid(&self) -> Result<TxId, EscrowError> {
        let encoded = bincode::serialize(self)?;
        Ok(TxId(crypto::sha256d(&encoded)))
    }
}

/// Checks that every input in `signed_inputs` carries exactly one valid signature from its owner
/// and that no other signature is present.
pub fn verify_input_signatures(
    tx: &DepositTx,
    signed_inputs: &[RawTransactionInput],
    signatures: &[InputSignature],
) -> Result<(), EscrowError> {
    if signatures.len() != signed_inputs.len() {
        return Err(EscrowError::DataIntegrity(format!(
            "Expected {} input signatures, received {}",
            signed_inputs.len(),
            signatures.len()
        )));
    }

    let txid = tx.txid()?;
    for input in signed_inputs {
        let index = tx.input_index_of(&input.outpoint).ok_or_else(|| {
            EscrowError::DataIntegrity(format!(
                "Input {}:{} is not part of the deposit tx",
                input.outpoint.txid, input.outpoint.vout
            ))
        })?;
        let signature = signatures
            .iter()
            .find(|signature| signature.input_index == index)
            .ok_or_else(|| {
                EscrowError::DataIntegrity(format!("Missing signature for input {}", index))
            })?;
        crypto::verify_hash_signature(
            &input.owner_pub_key,
            &sighash(&txid, index),
            &signature.signature,
        )?;
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDepositTx {
    pub tx: DepositTx,
    pub signatures: Vec<InputSignature>,
}

impl SignedDepositTx {
    /// Combines both parties' signatures, ordered by input index.
    pub fn finalize(
        tx: DepositTx,
        own_signatures: &[InputSignature],
        peer_signatures: &[InputSignature],
    ) -> Result<Self, EscrowError> {
        let mut signatures: Vec<InputSignature> = own_signatures
            .iter()
            .chain(peer_signatures.iter())
            .cloned()
            .collect();
        signatures.sort_by_key(|signature| signature.input_index);
        let signed = SignedDepositTx { tx, signatures };
        signed.verify_complete()?;
        Ok(signed)
    }

    pub fn txid(&self) -> Result<TxId, EscrowError> {
        self.tx.txid()
    }

    pub fn verify_complete(&self) -> Result<(), EscrowError> {
        let inputs: Vec<RawTransactionInput> = self.tx.inputs().cloned().collect();
        verify_input_signatures(&self.tx, &inputs, &self.signatures)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    Deposit(SignedDepositTx),
    Payout(SignedPayoutTx),
}

impl Transaction {
    pub fn txid(&self) -> Result<TxId, EscrowError> {
        match self {
            Transaction::Deposit(tx) => tx.txid(),
            Transaction::Payout(tx) => tx.txid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::sign_hash;
    use secp256k1::{rand::rngs::OsRng, Secp256k1, SecretKey};

    const AMOUNT: Coin = Coin::from_sat(50_000_000);
    const BUYER_DEPOSIT: Coin = Coin::from_sat(7_500_000);
    const SELLER_DEPOSIT: Coin = Coin::from_sat(7_500_000);
    const FEE: Coin = Coin::from_sat(50_000);

    struct Party {
        secret_key: SecretKey,
        inputs: Vec<RawTransactionInput>,
        change: Option<ChangeOutput>,
    }

    fn party(seed: u8, contribution: Coin, surplus: Coin) -> Party {
        let secp = Secp256k1::new();
        let (secret_key, owner_pub_key) = secp.generate_keypair(&mut OsRng);
        let value = contribution.checked_add(surplus).unwrap();
        Party {
            secret_key,
            inputs: vec![RawTransactionInput {
                outpoint: OutPoint {
                    txid: TxId([seed; 32]),
                    vout: 0,
                },
                value,
                owner_pub_key,
            }],
            change: (!surplus.is_zero()).then(|| ChangeOutput {
                address: format!("change-{}", seed),
                value: surplus,
            }),
        }
    }

    fn multisig_key() -> PublicKey {
        let secp = Secp256k1::new();
        secp.generate_keypair(&mut OsRng).1
    }

    fn build(taker: &Party, maker: &Party, trade_amount: Coin) -> Result<DepositTx, EscrowError> {
        DepositTx::build(DepositTxParams {
            trade_amount,
            buyer_security_deposit: BUYER_DEPOSIT,
            seller_security_deposit: SELLER_DEPOSIT,
            tx_fee: FEE,
            taker_is_buyer: true,
            taker_inputs: &taker.inputs,
            taker_change: taker.change.as_ref(),
            maker_inputs: &maker.inputs,
            maker_change: maker.change.as_ref(),
            buyer_multisig_pub_key: multisig_key(),
            seller_multisig_pub_key: multisig_key(),
            lock_time: 4320,
        })
    }

    fn buyer_taker() -> Party {
        let contribution = required_contribution(true, AMOUNT, BUYER_DEPOSIT, FEE).unwrap();
        party(1, contribution, Coin::from_sat(12_345))
    }

    fn seller_maker() -> Party {
        let contribution = required_contribution(false, AMOUNT, SELLER_DEPOSIT, FEE).unwrap();
        party(2, contribution, Coin::ZERO)
    }

    #[test]
    fn multisig_output_holds_deposits_amount_and_one_fee() {
        let tx = build(&buyer_taker(), &seller_maker(), AMOUNT).unwrap();
        assert_eq!(tx.multisig_output.amount, Coin::from_sat(65_050_000));
        assert_eq!(tx.input_count(), 2);
    }

    #[test]
    fn mismatching_contribution_rejected_before_signing() {
        let error = build(&buyer_taker(), &seller_maker(), Coin::from_sat(60_000_000)).unwrap_err();
        assert!(error.is_integrity_violation());
    }

    #[test]
    fn tampered_multisig_amount_detected() {
        let mut tx = build(&buyer_taker(), &seller_maker(), AMOUNT).unwrap();
        tx.multisig_output.amount = Coin::from_sat(65_049_999);
        let error = tx
            .verify_amounts(BUYER_DEPOSIT, SELLER_DEPOSIT, AMOUNT, FEE)
            .unwrap_err();
        assert!(error.to_string().contains("Multisig output"));
    }

    #[test]
    fn txid_is_stable_across_clones() {
        let tx = build(&buyer_taker(), &seller_maker(), AMOUNT).unwrap();
        assert_eq!(tx.txid().unwrap(), tx.clone().txid().unwrap());
    }

    #[test]
    fn finalize_requires_every_input_signed() {
        let taker = buyer_taker();
        let maker = seller_maker();
        let tx = build(&taker, &maker, AMOUNT).unwrap();
        let txid = tx.txid().unwrap();

        let taker_signature = InputSignature {
            input_index: 0,
            signature: sign_hash(&taker.secret_key, &sighash(&txid, 0)).unwrap(),
        };
        let maker_signature = InputSignature {
            input_index: 1,
            signature: sign_hash(&maker.secret_key, &sighash(&txid, 1)).unwrap(),
        };

        assert!(SignedDepositTx::finalize(tx.clone(), &[taker_signature.clone()], &[]).is_err());

        let signed =
            SignedDepositTx::finalize(tx, &[taker_signature], &[maker_signature]).unwrap();
        assert_eq!(signed.txid().unwrap(), txid);
    }

    #[test]
    fn signature_by_wrong_owner_rejected() {
        let taker = buyer_taker();
        let maker = seller_maker();
        let tx = build(&taker, &maker, AMOUNT).unwrap();
        let txid = tx.txid().unwrap();

        let forged = InputSignature {
            input_index: 1,
            signature: sign_hash(&taker.secret_key, &sighash(&txid, 1)).unwrap(),
        };
        let error = verify_input_signatures(&tx, &maker.inputs, &[forged]).unwrap_err();
        assert!(error.is_integrity_violation());
    }
}
