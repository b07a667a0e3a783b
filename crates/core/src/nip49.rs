//! Private key encryption (NIP-49)
//!
//! Passphrase-based encryption of a 32-byte secret key: the passphrase is
//! NFKC-normalized, stretched with scrypt (N = 2^log_n, r = 8, p = 1) and
//! used as an XChaCha20-Poly1305 key. The result is bech32-encoded under
//! the `ncryptsec` HRP. Derived keys and plaintext buffers are zeroized.

use bech32::{Bech32, Hrp};
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use scrypt::{Params, scrypt};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroize;

pub const VERSION: u8 = 0x02;
pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 24;
pub const SECRET_KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

/// VERSION (1) + LOG_N (1) + SALT (16) + NONCE (24) + KEY_SECURITY (1)
/// + CIPHERTEXT (32 + 16)
pub const ENCRYPTED_SIZE: usize =
    2 + SALT_SIZE + NONCE_SIZE + 1 + SECRET_KEY_SIZE + TAG_SIZE;

const HRP_NCRYPTSEC: &str = "ncryptsec";

/// How the key was handled before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySecurity {
    /// Key has been handled insecurely at some point
    Insecure = 0x00,
    /// Key has not been handled insecurely
    Secure = 0x01,
    /// Client does not track this
    Unknown = 0x02,
}

impl KeySecurity {
    pub fn from_byte(b: u8) -> Result<Self, Nip49Error> {
        match b {
            0x00 => Ok(KeySecurity::Insecure),
            0x01 => Ok(KeySecurity::Secure),
            0x02 => Ok(KeySecurity::Unknown),
            _ => Err(Nip49Error::BadKeySecurity(b)),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum Nip49Error {
    #[error("unsupported version byte {0:#04x}")]
    BadVersion(u8),

    #[error("log_n {0} outside the supported range")]
    BadLogN(u8),

    #[error("invalid key security byte {0}")]
    BadKeySecurity(u8),

    #[error("not an ncryptsec string: {0}")]
    BadEncoding(String),

    #[error("ciphertext has wrong length: expected {ENCRYPTED_SIZE}, got {0}")]
    BadLength(usize),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("wrong password or corrupted data")]
    DecryptionFailed,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
}

/// NFKC-normalize a passphrase so it derives the same key on every platform.
pub fn normalize_password(password: &str) -> String {
    password.nfkc().collect()
}

/// Stretch a passphrase into a 32-byte symmetric key.
pub fn derive_key(
    password: &str,
    salt: &[u8; SALT_SIZE],
    log_n: u8,
) -> Result<[u8; 32], Nip49Error> {
    if !(10..=30).contains(&log_n) {
        return Err(Nip49Error::BadLogN(log_n));
    }

    let params = Params::new(log_n, 8, 1, 32)
        .map_err(|e| Nip49Error::KeyDerivation(e.to_string()))?;

    let mut normalized = normalize_password(password);
    let mut output = [0u8; 32];
    let result = scrypt(normalized.as_bytes(), salt, &params, &mut output);
    normalized.zeroize();
    result.map_err(|e| Nip49Error::KeyDerivation(e.to_string()))?;

    Ok(output)
}

/// Encrypt a secret key under a passphrase, producing an `ncryptsec1...`
/// bech32 string.
pub fn encrypt(
    secret_key: &[u8; SECRET_KEY_SIZE],
    password: &str,
    log_n: u8,
    key_security: KeySecurity,
) -> Result<String, Nip49Error> {
    let mut salt = [0u8; SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let mut symmetric_key = derive_key(password, &salt, log_n)?;
    let cipher = XChaCha20Poly1305::new((&symmetric_key).into());
    let aad = [key_security.to_byte()];
    let ciphertext = cipher
        .encrypt(
            (&nonce).into(),
            Payload {
                msg: secret_key,
                aad: &aad,
            },
        )
        .map_err(|e| Nip49Error::EncryptionFailed(e.to_string()));
    symmetric_key.zeroize();
    let ciphertext = ciphertext?;

    let mut payload = Vec::with_capacity(ENCRYPTED_SIZE);
    payload.push(VERSION);
    payload.push(log_n);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce);
    payload.push(key_security.to_byte());
    payload.extend_from_slice(&ciphertext);

    let hrp = Hrp::parse(HRP_NCRYPTSEC).map_err(|e| Nip49Error::BadEncoding(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &payload).map_err(|e| Nip49Error::BadEncoding(e.to_string()))
}

struct Envelope {
    log_n: u8,
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
    key_security: KeySecurity,
    ciphertext: Vec<u8>,
}

fn parse_envelope(encrypted: &str) -> Result<Envelope, Nip49Error> {
    let (hrp, data) =
        bech32::decode(encrypted).map_err(|e| Nip49Error::BadEncoding(e.to_string()))?;
    if hrp.as_str() != HRP_NCRYPTSEC {
        return Err(Nip49Error::BadEncoding(format!(
            "expected '{}' HRP, got '{}'",
            HRP_NCRYPTSEC, hrp
        )));
    }
    if data.len() != ENCRYPTED_SIZE {
        return Err(Nip49Error::BadLength(data.len()));
    }
    if data[0] != VERSION {
        return Err(Nip49Error::BadVersion(data[0]));
    }

    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&data[2..2 + SALT_SIZE]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&data[2 + SALT_SIZE..2 + SALT_SIZE + NONCE_SIZE]);
    let security_off = 2 + SALT_SIZE + NONCE_SIZE;

    Ok(Envelope {
        log_n: data[1],
        salt,
        nonce,
        key_security: KeySecurity::from_byte(data[security_off])?,
        ciphertext: data[security_off + 1..].to_vec(),
    })
}

/// Decrypt an `ncryptsec1...` string.
///
/// Returns the secret key together with the scrypt work factor and key
/// security flag recovered from the envelope. An authentication failure is
/// indistinguishable between a wrong passphrase and corrupted data.
pub fn decrypt(
    encrypted: &str,
    password: &str,
) -> Result<([u8; SECRET_KEY_SIZE], u8, KeySecurity), Nip49Error> {
    let envelope = parse_envelope(encrypted)?;

    let mut symmetric_key = derive_key(password, &envelope.salt, envelope.log_n)?;
    let cipher = XChaCha20Poly1305::new((&symmetric_key).into());
    let aad = [envelope.key_security.to_byte()];
    let plaintext = cipher.decrypt(
        (&envelope.nonce).into(),
        Payload {
            msg: envelope.ciphertext.as_slice(),
            aad: &aad,
        },
    );
    symmetric_key.zeroize();
    let mut plaintext = plaintext.map_err(|_| Nip49Error::DecryptionFailed)?;

    if plaintext.len() != SECRET_KEY_SIZE {
        plaintext.zeroize();
        return Err(Nip49Error::DecryptionFailed);
    }

    let mut secret_key = [0u8; SECRET_KEY_SIZE];
    secret_key.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok((secret_key, envelope.log_n, envelope.key_security))
}
