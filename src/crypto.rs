use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Sha3_256};
use std::fmt;
use thiserror::Error;

use crate::config::{ADDRESS_SIZE, COIN_PREFIX, CONTRACT_PREFIX};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid signature encoding: {0}")]
    Malformed(String),
    #[error("signature recovery failed")]
    Recovery,
    #[error("object signed by {got}, expected {want}")]
    WrongSigner { want: String, got: String },
    #[error("invalid secret key")]
    InvalidKey,
}

/// Hex-encoded SHA3-256 digest. The empty string is the sentinel used for
/// the none trie root and the genesis parent hash.
#[derive(
    Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Hash(String);

impl Hash {
    pub fn none() -> Self {
        Hash(String::new())
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Hash(hex.into())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Raw 32-byte digest, for signing. Fails on the none sentinel.
    pub fn to_raw(&self) -> Result<[u8; 32], CryptoError> {
        let bytes = hex::decode(&self.0)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| CryptoError::Malformed("digest is not 32 bytes".into()))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.0)
    }
}

/// Prefixed account identifier: `gBx` (externally owned) or `gBc`
/// (contract) followed by the last 40 hex chars of a SHA3-256 digest.
#[derive(
    Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Address(value.into())
    }

    pub fn empty() -> Self {
        Address(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_contract(&self) -> bool {
        self.0.starts_with(CONTRACT_PREFIX)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &self.0)
    }
}

pub fn sha3_hex(data: &[u8]) -> Hash {
    Hash(hex::encode(Sha3_256::digest(data)))
}

pub fn sha3_bytes(data: &[u8]) -> [u8; 32] {
    Sha3_256::digest(data).into()
}

/// Derive an externally-owned address from a 64-byte uncompressed
/// public key (SEC1 point without the 0x04 tag).
pub fn create_nodebase(public_key: &[u8]) -> Address {
    let digest = sha3_hex(public_key);
    let tail = &digest.as_str()[digest.as_str().len() - 40..];
    let address = format!("{}{}", COIN_PREFIX, tail);
    debug_assert_eq!(address.len(), ADDRESS_SIZE);
    Address(address)
}

/// Derive a contract address from the creating account and its nonce.
pub fn create_contract(nodebase: &Address, nonce: u64) -> Address {
    let mut material = nodebase.as_bytes().to_vec();
    material.extend_from_slice(nonce.to_string().as_bytes());
    let digest = sha3_hex(&material);
    let tail = &digest.as_str()[digest.as_str().len() - 40..];
    let address = format!("{}{}", CONTRACT_PREFIX, tail);
    debug_assert_eq!(address.len(), ADDRESS_SIZE);
    Address(address)
}

/// secp256k1 signer over SHA3-256 digests. Nonces are RFC 6979
/// deterministic; the recovery id is appended to the hex signature as
/// `00`/`01`.
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn new(key: SigningKey) -> Self {
        Signer { key }
    }

    pub fn generate() -> Self {
        Signer {
            key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_secret(secret: &[u8]) -> Result<Self, CryptoError> {
        let key = SigningKey::from_slice(secret).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Signer { key })
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        self.key.to_bytes().to_vec()
    }

    pub fn nodebase(&self) -> Address {
        let point = self.key.verifying_key().to_encoded_point(false);
        create_nodebase(&point.as_bytes()[1..])
    }

    pub fn sign(&self, digest: &Hash) -> Result<String, CryptoError> {
        let prehash = digest.to_raw()?;
        let (signature, recovery) = self
            .key
            .sign_prehash_recoverable(&prehash)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        let mut out = hex::encode(signature.to_bytes());
        out.push_str(if recovery.is_y_odd() { "01" } else { "00" });
        Ok(out)
    }
}

/// Recover the signing address of `signature` over `digest`.
pub fn recover(digest: &Hash, signature: &str) -> Result<Address, CryptoError> {
    if signature.len() != 130 {
        return Err(CryptoError::Malformed(format!(
            "signature length {}",
            signature.len()
        )));
    }
    let raw = hex::decode(&signature[..128])
        .map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let parsed =
        Signature::from_slice(&raw).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let recovery = match &signature[128..] {
        "00" => RecoveryId::from_byte(0),
        "01" => RecoveryId::from_byte(1),
        other => {
            return Err(CryptoError::Malformed(format!("recovery id {}", other)));
        }
    }
    .ok_or(CryptoError::Recovery)?;

    let prehash = digest.to_raw()?;
    let key = VerifyingKey::recover_from_prehash(&prehash, &parsed, recovery)
        .map_err(|_| CryptoError::Recovery)?;
    let point = key.to_encoded_point(false);
    Ok(create_nodebase(&point.as_bytes()[1..]))
}

/// Verify that `signature` over `digest` was produced by `sender`.
pub fn verify(digest: &Hash, signature: &str, sender: &Address) -> Result<(), CryptoError> {
    let signer = recover(digest, signature)?;
    if &signer != sender {
        return Err(CryptoError::WrongSigner {
            want: sender.to_string(),
            got: signer.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = Signer::generate();
        let digest = sha3_hex(b"payload");
        let sig = signer.sign(&digest).unwrap();
        assert_eq!(sig.len(), 130);
        verify(&digest, &sig, &signer.nodebase()).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_sender() {
        let signer = Signer::generate();
        let other = Signer::generate();
        let digest = sha3_hex(b"payload");
        let sig = signer.sign(&digest).unwrap();
        assert!(verify(&digest, &sig, &other.nodebase()).is_err());
    }

    #[test]
    fn address_shapes() {
        let signer = Signer::generate();
        let base = signer.nodebase();
        assert!(base.as_str().starts_with("gBx"));
        assert_eq!(base.as_str().len(), ADDRESS_SIZE);

        let contract = create_contract(&base, 7);
        assert!(contract.as_str().starts_with("gBc"));
        assert_eq!(contract.as_str().len(), ADDRESS_SIZE);
        assert!(contract.is_contract());
    }

    #[test]
    fn signer_secret_roundtrip() {
        let signer = Signer::generate();
        let restored = Signer::from_secret(&signer.secret_bytes()).unwrap();
        assert_eq!(signer.nodebase(), restored.nodebase());
    }
}
