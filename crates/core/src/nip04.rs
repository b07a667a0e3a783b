//! Encrypted direct messages (NIP-04)
//!
//! ECDH over secp256k1 (raw x-coordinate, no hashing) feeding AES-256-CBC.
//! The wire format is `base64(ciphertext) + "?iv=" + base64(iv)`. Used here
//! as the transport wrap for recovery shares exchanged with guardians.

use aes::Aes256;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine;
use bitcoin::secp256k1::{PublicKey, SecretKey, ecdh};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("plaintext is not valid UTF-8")]
    BadPlaintext,
}

/// Raw ECDH shared secret between our secret key and a peer's x-only
/// pubkey: the x-coordinate of the shared point, unhashed, as NIP-04
/// requires. The x-only key is lifted with even parity.
fn shared_secret(
    secret_key: &[u8; 32],
    peer_pubkey_hex: &str,
) -> Result<[u8; 32], Nip04Error> {
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| Nip04Error::InvalidKey(e.to_string()))?;

    if peer_pubkey_hex.len() != 64 {
        return Err(Nip04Error::InvalidKey(format!(
            "expected 64 hex chars, got {}",
            peer_pubkey_hex.len()
        )));
    }
    let full_hex = format!("02{}", peer_pubkey_hex);
    let peer_bytes =
        hex::decode(&full_hex).map_err(|e| Nip04Error::InvalidKey(e.to_string()))?;
    let peer = PublicKey::from_slice(&peer_bytes)
        .map_err(|e| Nip04Error::InvalidKey(e.to_string()))?;

    let mut point = ecdh::shared_secret_point(&peer, &sk);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&point[..32]);
    point.zeroize();
    Ok(secret)
}

/// Encrypt a message to a peer, producing `base64(ct)?iv=base64(iv)`.
pub fn encrypt(
    secret_key: &[u8; 32],
    peer_pubkey_hex: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let mut key = shared_secret(secret_key, peer_pubkey_hex)?;

    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| Nip04Error::InvalidKey(e.to_string()));
    key.zeroize();
    let ciphertext = cipher?.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(format!("{}?iv={}", b64.encode(&ciphertext), b64.encode(iv)))
}

/// Decrypt a `base64(ct)?iv=base64(iv)` message from a peer.
pub fn decrypt(
    secret_key: &[u8; 32],
    peer_pubkey_hex: &str,
    payload: &str,
) -> Result<String, Nip04Error> {
    let (ct_b64, iv_b64) = payload
        .split_once("?iv=")
        .ok_or_else(|| Nip04Error::Malformed("missing ?iv= separator".to_string()))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    let ciphertext = b64
        .decode(ct_b64)
        .map_err(|e| Nip04Error::Malformed(e.to_string()))?;
    let iv = b64
        .decode(iv_b64)
        .map_err(|e| Nip04Error::Malformed(e.to_string()))?;
    if iv.len() != 16 {
        return Err(Nip04Error::Malformed(format!(
            "iv must be 16 bytes, got {}",
            iv.len()
        )));
    }

    let mut key = shared_secret(secret_key, peer_pubkey_hex)?;
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| Nip04Error::InvalidKey(e.to_string()));
    key.zeroize();
    let mut plaintext = cipher?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::DecryptionFailed)?;

    match String::from_utf8(std::mem::take(&mut plaintext)) {
        Ok(text) => Ok(text),
        Err(e) => {
            let mut bytes = e.into_bytes();
            bytes.zeroize();
            Err(Nip04Error::BadPlaintext)
        }
    }
}
