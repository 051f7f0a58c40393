use dyn_clone::DynClone;
use secp256k1::{rand::rngs::OsRng, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};

use std::any::Any;
use std::fmt::{self, Debug};

use crate::common::{crypto, error::EscrowError};

/// Amount in satoshis.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Coin(u64);

impl Coin {
    pub const ZERO: Coin = Coin(0);

    pub const fn from_sat(sat: u64) -> Self {
        Coin(sat)
    }

    pub fn sat(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Coin) -> Option<Coin> {
        self.0.checked_add(other.0).map(Coin)
    }

    pub fn checked_sub(self, other: Coin) -> Option<Coin> {
        self.0.checked_sub(other.0).map(Coin)
    }

    pub fn checked_mul(self, factor: u64) -> Option<Coin> {
        self.0.checked_mul(factor).map(Coin)
    }

    /// Sums the amounts, failing on overflow.
    pub fn checked_sum<'a>(coins: impl IntoIterator<Item = &'a Coin>) -> Option<Coin> {
        coins
            .into_iter()
            .try_fold(Coin::ZERO, |acc, coin| acc.checked_add(*coin))
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

/// Sat per virtual byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
pub enum Direction {
    Buy,
    Sell,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
pub enum Role {
    BuyerAsMaker,
    BuyerAsTaker,
    SellerAsMaker,
    SellerAsTaker,
}

impl Role {
    pub fn from_parts(is_buyer: bool, is_maker: bool) -> Self {
        match (is_buyer, is_maker) {
            (true, true) => Role::BuyerAsMaker,
            (true, false) => Role::BuyerAsTaker,
            (false, true) => Role::SellerAsMaker,
            (false, false) => Role::SellerAsTaker,
        }
    }

    pub fn is_buyer(&self) -> bool {
        matches!(self, Role::BuyerAsMaker | Role::BuyerAsTaker)
    }

    pub fn is_maker(&self) -> bool {
        matches!(self, Role::BuyerAsMaker | Role::SellerAsMaker)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host_name: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host_name: impl Into<String>, port: u16) -> Self {
        Self {
            host_name: host_name.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host_name, self.port)
    }
}

/// Public half of a node's identity. Contracts and messages are signed against it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKeyRing {
    pub signature_pub_key: PublicKey,
}

pub struct KeyRing {
    secret_key: SecretKey,
    pub_key_ring: PubKeyRing,
}

impl KeyRing {
    pub fn new(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let signature_pub_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            pub_key_ring: PubKeyRing { signature_pub_key },
        }
    }

    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, _) = secp.generate_keypair(&mut OsRng);
        Self::new(secret_key)
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        self.pub_key_ring
    }

    pub fn sign_hash(&self, hash: &[u8; 32]) -> Result<Vec<u8>, EscrowError> {
        crypto::sign_hash(&self.secret_key, hash)
    }
}

impl Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("pub_key_ring", &self.pub_key_ring)
            .finish_non_exhaustive()
    }
}

/// Delivery progress of an outbound peer message.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, IntoStaticStr,
)]
pub enum MessageState {
    #[default]
    Undefined,
    Sent,
    Arrived,
    StoredInMailbox,
    Acknowledged,
    Failed,
}

/// Payment account details of one side of a trade. Only a hash of it enters the contract,
/// the concrete payload type is left to the embedding application.
#[typetag::serde(tag = "type")]
pub trait PaymentAccountPayload: DynClone + Debug + Send + Sync {
    fn payment_method_id(&self) -> &str;
    fn any_ref(&self) -> &dyn Any;
}

dyn_clone::clone_trait_object!(PaymentAccountPayload);

impl dyn PaymentAccountPayload {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.any_ref().downcast_ref()
    }

    pub fn hash(&self) -> Result<[u8; 32], EscrowError> {
        let json = serde_json::to_vec(self)?;
        Ok(crypto::sha256(&json))
    }
}
