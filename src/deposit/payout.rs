use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use super::tx::TxId;
use crate::common::{crypto, error::EscrowError, types::Coin};

fn tagged_hash(tag: &[u8], txid: &TxId) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(tag.len() + 32);
    preimage.extend_from_slice(tag);
    preimage.extend_from_slice(&txid.0);
    crypto::sha256(&preimage)
}

/// Digest of the pre-signed warning tx spending the deposit (protocol version 5 and up).
pub fn warning_sighash(deposit_txid: &TxId) -> [u8; 32] {
    tagged_hash(b"warning", deposit_txid)
}

pub fn redirect_sighash(deposit_txid: &TxId) -> [u8; 32] {
    tagged_hash(b"redirect", deposit_txid)
}

/// Spends the multisig output. The buyer gets the trade amount back with its deposit, the seller
/// gets its deposit, the reserved tx fee pays the miner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutTx {
    pub deposit_txid: TxId,
    pub multisig_amount: Coin,
    pub buyer_payout_address: String,
    pub buyer_payout_amount: Coin,
    pub seller_payout_address: String,
    pub seller_payout_amount: Coin,
    pub tx_fee: Coin,
}

impl PayoutTx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deposit_txid: TxId,
        multisig_amount: Coin,
        buyer_payout_address: impl Into<String>,
        seller_payout_address: impl Into<String>,
        trade_amount: Coin,
        buyer_security_deposit: Coin,
        seller_security_deposit: Coin,
        tx_fee: Coin,
    ) -> Result<Self, EscrowError> {
        let buyer_payout_amount = trade_amount
            .checked_add(buyer_security_deposit)
            .ok_or_else(|| EscrowError::DataIntegrity("Buyer payout overflows".to_string()))?;
        let payout_total =
            Coin::checked_sum(&[buyer_payout_amount, seller_security_deposit, tx_fee])
                .ok_or_else(|| EscrowError::DataIntegrity("Payout overflows".to_string()))?;
        if payout_total != multisig_amount {
            return Err(EscrowError::DataIntegrity(format!(
                "Payout total {} does not spend multisig amount {}",
                payout_total, multisig_amount
            )));
        }

        Ok(Self {
            deposit_txid,
            multisig_amount,
            buyer_payout_address: buyer_payout_address.into(),
            buyer_payout_amount,
            seller_payout_address: seller_payout_address.into(),
            seller_payout_amount: seller_security_deposit,
            tx_fee,
        })
    }

    pub fn txid(&self) -> Result<TxId, EscrowError> {
        let encoded = bincode::serialize(self)?;
        Ok(TxId(crypto::sha256d(&encoded)))
    }

    pub fn payout_sighash(&self) -> Result<[u8; 32], EscrowError> {
        Ok(tagged_hash(b"payout", &self.txid()?))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayoutTx {
    pub tx: PayoutTx,
    pub buyer_signature: Vec<u8>,
    pub seller_signature: Vec<u8>,
}

impl SignedPayoutTx {
    pub fn txid(&self) -> Result<TxId, EscrowError> {
        self.tx.txid()
    }

    pub fn verify(
        &self,
        buyer_multisig_pub_key: &PublicKey,
        seller_multisig_pub_key: &PublicKey,
    ) -> Result<(), EscrowError> {
        let sighash = self.tx.payout_sighash()?;
        crypto::verify_hash_signature(buyer_multisig_pub_key, &sighash, &self.buyer_signature)?;
        crypto::verify_hash_signature(seller_multisig_pub_key, &sighash, &self.seller_signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::sign_hash;
    use secp256k1::{rand::rngs::OsRng, Secp256k1};

    fn payout(multisig_amount: Coin) -> Result<PayoutTx, EscrowError> {
        PayoutTx::new(
            TxId([7; 32]),
            multisig_amount,
            "buyer-payout",
            "seller-payout",
            Coin::from_sat(50_000_000),
            Coin::from_sat(7_500_000),
            Coin::from_sat(7_500_000),
            Coin::from_sat(50_000),
        )
    }

    #[test]
    fn payout_splits_multisig_amount() {
        let tx = payout(Coin::from_sat(65_050_000)).unwrap();
        assert_eq!(tx.buyer_payout_amount, Coin::from_sat(57_500_000));
        assert_eq!(tx.seller_payout_amount, Coin::from_sat(7_500_000));
    }

    #[test]
    fn payout_rejects_unbalanced_multisig() {
        assert!(payout(Coin::from_sat(65_000_000)).is_err());
    }

    #[test]
    fn both_signatures_required() {
        let secp = Secp256k1::new();
        let (buyer_secret, buyer_pub) = secp.generate_keypair(&mut OsRng);
        let (seller_secret, seller_pub) = secp.generate_keypair(&mut OsRng);
        let tx = payout(Coin::from_sat(65_050_000)).unwrap();
        let sighash = tx.payout_sighash().unwrap();

        let signed = SignedPayoutTx {
            tx: tx.clone(),
            buyer_signature: sign_hash(&buyer_secret, &sighash).unwrap(),
            seller_signature: sign_hash(&seller_secret, &sighash).unwrap(),
        };
        signed.verify(&buyer_pub, &seller_pub).unwrap();

        let swapped = SignedPayoutTx {
            tx,
            buyer_signature: signed.seller_signature.clone(),
            seller_signature: signed.buyer_signature.clone(),
        };
        assert!(swapped.verify(&buyer_pub, &seller_pub).is_err());
    }

    #[test]
    fn warning_and_redirect_digests_differ() {
        let txid = TxId([3; 32]);
        assert_ne!(warning_sighash(&txid), redirect_sighash(&txid));
    }
}
