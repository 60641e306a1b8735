use crate::SwapId;
use bitcoin::hashes::{sha256, Hash};
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
};

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum FromErr {
    #[error("expected {expected} bytes but got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid hex")]
    FromHex,
}

impl From<hex::FromHexError> for FromErr {
    fn from(_: hex::FromHexError) -> Self {
        FromErr::FromHex
    }
}

fn from_slice(slice: &[u8]) -> Result<[u8; 32], FromErr> {
    if slice.len() != 32 {
        return Err(FromErr::InvalidLength {
            expected: 32,
            got: slice.len(),
        });
    }

    let mut data = [0u8; 32];
    data.copy_from_slice(slice);

    Ok(data)
}

/// The preimage of a swap's hashlock.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn from_vec(vec: &[u8]) -> Result<Secret, FromErr> {
        Ok(Secret(from_slice(vec)?))
    }

    pub fn random() -> Secret {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);

        Secret(bytes)
    }

    pub fn hash(&self) -> SecretHash {
        SecretHash::new(*self)
    }

    pub fn as_raw_secret(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn into_raw_secret(self) -> [u8; 32] {
        self.0
    }
}

impl From<[u8; 32]> for Secret {
    fn from(secret: [u8; 32]) -> Self {
        Secret(secret)
    }
}

// Never print the preimage by accident.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl fmt::LowerHex for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for Secret {
    type Err = FromErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vec = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_vec(&vec)
    }
}

/// SHA-256 hash of a [`Secret`], committed to on both ledgers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretHash([u8; 32]);

impl SecretHash {
    pub fn new(secret: Secret) -> Self {
        let hash = sha256::Hash::hash(secret.as_raw_secret());

        SecretHash(hash.into_inner())
    }

    pub fn from_vec(vec: &[u8]) -> Result<Self, FromErr> {
        Ok(SecretHash(from_slice(vec)?))
    }

    pub fn as_raw(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn into_raw(self) -> [u8; 32] {
        self.0
    }
}

impl From<[u8; 32]> for SecretHash {
    fn from(bytes: [u8; 32]) -> Self {
        SecretHash(bytes)
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for SecretHash {
    type Err = FromErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vec = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_vec(&vec)
    }
}

macro_rules! impl_hex_serde {
    ($ty:ident, $expecting:literal, $bytes:ident) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&hex::encode(self.$bytes()))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                struct Visitor;

                impl<'vde> de::Visitor<'vde> for Visitor {
                    type Value = $ty;

                    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                        formatter.write_str($expecting)
                    }

                    fn visit_str<E>(self, v: &str) -> Result<$ty, E>
                    where
                        E: de::Error,
                    {
                        $ty::from_str(v).map_err(|_| {
                            de::Error::invalid_value(de::Unexpected::Str(v), &$expecting)
                        })
                    }
                }

                deserializer.deserialize_str(Visitor)
            }
        }
    };
}

impl_hex_serde!(Secret, "a hex encoded 32 byte secret", as_raw_secret);
impl_hex_serde!(SecretHash, "a hex encoded 32 byte hash", as_raw);

/// The shared secret of one swap: a random preimage and its hash.
///
/// Only the party that will claim the Bitcoin leg ever holds one of these.
/// Everybody else only ever sees the [`SecretHash`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SecretCommitment {
    preimage: Secret,
    hash: SecretHash,
}

impl SecretCommitment {
    pub fn generate() -> Self {
        Self::from_secret(Secret::random())
    }

    pub fn from_secret(preimage: Secret) -> Self {
        Self {
            preimage,
            hash: preimage.hash(),
        }
    }

    pub fn hash(&self) -> SecretHash {
        self.hash
    }

    pub fn preimage(&self) -> Secret {
        self.preimage
    }
}

/// Local custody of the preimages of all swaps this node initiated.
///
/// A preimage is handed out only to the completion path, which reveals it on
/// the Bitcoin ledger after it independently verified the HTLC is funded.
#[derive(Clone, Debug, Default)]
pub struct SecretVault {
    inner: Arc<Mutex<HashMap<SwapId, SecretCommitment>>>,
}

impl SecretVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, swap_id: SwapId, commitment: SecretCommitment) {
        if let Ok(mut secrets) = self.inner.lock() {
            secrets.insert(swap_id, commitment);
        }
    }

    pub fn commitment(&self, swap_id: &SwapId) -> Option<SecretCommitment> {
        self.inner
            .lock()
            .ok()
            .and_then(|secrets| secrets.get(swap_id).copied())
    }

    pub fn discard(&self, swap_id: &SwapId) {
        if let Ok(mut secrets) = self.inner.lock() {
            secrets.remove(swap_id);
        }
    }

    pub fn all(&self) -> Vec<(SwapId, SecretCommitment)> {
        self.inner
            .lock()
            .map(|secrets| secrets.iter().map(|(id, c)| (*id, *c)).collect())
            .unwrap_or_default()
    }
}
