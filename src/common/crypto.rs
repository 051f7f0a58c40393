use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::common::error::EscrowError;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(data));
    hash
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// DER encoded ECDSA signature over a 32 byte digest.
pub fn sign_hash(secret_key: &SecretKey, hash: &[u8; 32]) -> Result<Vec<u8>, EscrowError> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_slice(hash)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_der().to_vec())
}

pub fn verify_hash_signature(
    pub_key: &PublicKey,
    hash: &[u8; 32],
    signature: &[u8],
) -> Result<(), EscrowError> {
    let secp = Secp256k1::verification_only();
    let message = Message::from_slice(hash)?;
    let signature = Signature::from_der(signature).map_err(|error| {
        EscrowError::DataIntegrity(format!("Signature not DER decodable - {}", error))
    })?;
    secp.verify_ecdsa(&message, &signature, pub_key)
        .map_err(|_| {
            EscrowError::DataIntegrity(format!(
                "Signature does not verify against pubkey {}",
                pub_key
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::rand::rngs::OsRng;

    #[test]
    fn sign_then_verify() {
        let secp = Secp256k1::new();
        let (secret_key, pub_key) = secp.generate_keypair(&mut OsRng);
        let hash = sha256(b"contract");
        let signature = sign_hash(&secret_key, &hash).unwrap();
        verify_hash_signature(&pub_key, &hash, &signature).unwrap();
    }

    #[test]
    fn verify_rejects_other_key() {
        let secp = Secp256k1::new();
        let (secret_key, _) = secp.generate_keypair(&mut OsRng);
        let (_, other_pub_key) = secp.generate_keypair(&mut OsRng);
        let hash = sha256(b"contract");
        let signature = sign_hash(&secret_key, &hash).unwrap();
        let error = verify_hash_signature(&other_pub_key, &hash, &signature).unwrap_err();
        assert!(error.is_integrity_violation());
    }

    #[test]
    fn sha256d_differs_from_single() {
        assert_ne!(sha256(b"abc"), sha256d(b"abc"));
    }
}
