use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha3::Sha3_256;
use std::path::Path;
use thiserror::Error;

use crate::crypto::{sha3_bytes, CryptoError, Signer};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_FILE_CONTEXT: &[u8] = b"llfc-node-key";

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("seed not input, please input to seed")]
    NotInputSeed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cipher: {0}")]
    Cipher(String),
    #[error("key: {0}")]
    Key(#[from] CryptoError),
}

/// Key file name: hex HMAC-SHA3-256 keyed by the seed over a fixed
/// context constant. The seed never appears on disk.
fn key_file_name(seed: &[u8]) -> String {
    let mut mac = Hmac::<Sha3_256>::new_from_slice(seed)
        .expect("hmac accepts any key length");
    mac.update(KEY_FILE_CONTEXT);
    hex::encode(mac.finalize().into_bytes())
}

fn encrypt(seed: &[u8], plain: &[u8]) -> Vec<u8> {
    let key = sha3_bytes(seed);
    let iv = [0u8; 16];
    Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain)
}

fn decrypt(seed: &[u8], cipher: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    let key = sha3_bytes(seed);
    let iv = [0u8; 16];
    Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(cipher)
        .map_err(|e| KeystoreError::Cipher(e.to_string()))
}

/// Load the node key for `seed`, creating and persisting a fresh one
/// on first use.
pub fn load_or_create(node_dir: &Path, seed: &str) -> Result<Signer, KeystoreError> {
    if seed.is_empty() {
        return Err(KeystoreError::NotInputSeed);
    }
    std::fs::create_dir_all(node_dir)?;
    let path = node_dir.join(key_file_name(seed.as_bytes()));

    if path.is_file() {
        let stored = std::fs::read_to_string(&path)?;
        let cipher = hex::decode(stored.trim())
            .map_err(|e| KeystoreError::Cipher(e.to_string()))?;
        let secret = decrypt(seed.as_bytes(), &cipher)?;
        return Ok(Signer::from_secret(&secret)?);
    }

    let signer = Signer::generate();
    let cipher = encrypt(seed.as_bytes(), &signer.secret_bytes());
    std::fs::write(&path, hex::encode(cipher))?;
    Ok(signer)
}
