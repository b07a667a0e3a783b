//! Key derivation from mnemonic seed phrases (NIP-06)
//!
//! BIP-39 turns the mnemonic (12/15/18/21/24 words, optional passphrase)
//! into a 64-byte seed; BIP-32 derives the Nostr key at
//! `m/44'/1237'/<account>'/0/0`. Coin type 1237 is the SLIP-0044
//! registration for Nostr. Also carries the npub/nsec bech32 codecs.
//!
//! Derivation is one-way: there is no path from a derived key back to the
//! mnemonic.

use bip39::Mnemonic;
use bitcoin::Network;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::SecretKey;
use thiserror::Error;
use zeroize::Zeroize;

const NOSTR_COIN_TYPE: u32 = 1237;
const NSEC_HRP: &str = "nsec";
const NPUB_HRP: &str = "npub";

#[derive(Debug, Error)]
pub enum Nip06Error {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("bech32 error: {0}")]
    Bech32(String),

    #[error("invalid hrp: expected {expected}, got {got}")]
    WrongHrp { expected: String, got: String },

    #[error("invalid key length: expected 32 bytes, got {0}")]
    BadKeyLength(usize),
}

/// A derived Nostr keypair.
#[derive(Clone)]
pub struct Keypair {
    pub secret_key: [u8; 32],
    /// x-only public key
    pub public_key: [u8; 32],
}

impl Keypair {
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    pub fn nsec(&self) -> Result<String, Nip06Error> {
        secret_key_to_nsec(&self.secret_key)
    }

    pub fn npub(&self) -> Result<String, Nip06Error> {
        public_key_to_npub(&self.public_key)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_hex())
            .field("secret_key", &"[redacted]")
            .finish()
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

/// BIP-39 seed from a mnemonic; empty passphrase is the BIP-39 default.
pub fn mnemonic_to_seed(mnemonic: &str, passphrase: &str) -> Result<[u8; 64], Nip06Error> {
    let mnemonic =
        Mnemonic::parse(mnemonic).map_err(|e| Nip06Error::InvalidMnemonic(e.to_string()))?;
    Ok(mnemonic.to_seed(passphrase))
}

/// Derive the account-0 keypair: `m/44'/1237'/0'/0/0`.
pub fn derive_keypair(mnemonic: &str) -> Result<Keypair, Nip06Error> {
    derive_keypair_full(mnemonic, "", 0)
}

/// Derive `m/44'/1237'/<account>'/0/0` with no passphrase.
pub fn derive_keypair_with_account(mnemonic: &str, account: u32) -> Result<Keypair, Nip06Error> {
    derive_keypair_full(mnemonic, "", account)
}

/// Derive `m/44'/1237'/<account>'/0/0` with an optional BIP-39 passphrase.
pub fn derive_keypair_full(
    mnemonic: &str,
    passphrase: &str,
    account: u32,
) -> Result<Keypair, Nip06Error> {
    let mut seed = mnemonic_to_seed(mnemonic, passphrase)?;
    let result = derive_from_seed(&seed, account);
    seed.zeroize();
    result
}

fn derive_from_seed(seed: &[u8; 64], account: u32) -> Result<Keypair, Nip06Error> {
    let secp = Secp256k1::new();

    // the bitcoin network tag does not affect derivation, only serialization
    let master = Xpriv::new_master(Network::Bitcoin, seed)
        .map_err(|e| Nip06Error::KeyDerivation(e.to_string()))?;

    let map_err = |e: bitcoin::bip32::Error| Nip06Error::KeyDerivation(e.to_string());
    let path = DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(44).map_err(map_err)?,
        ChildNumber::from_hardened_idx(NOSTR_COIN_TYPE).map_err(map_err)?,
        ChildNumber::from_hardened_idx(account).map_err(map_err)?,
        ChildNumber::from_normal_idx(0).map_err(map_err)?,
        ChildNumber::from_normal_idx(0).map_err(map_err)?,
    ]);

    let derived = master
        .derive_priv(&secp, &path)
        .map_err(|e| Nip06Error::KeyDerivation(e.to_string()))?;

    let secret_key: [u8; 32] = derived.private_key.secret_bytes();
    let sk = SecretKey::from_slice(&secret_key)
        .map_err(|e| Nip06Error::KeyDerivation(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);

    Ok(Keypair {
        secret_key,
        public_key: xonly.serialize(),
    })
}

pub fn secret_key_to_nsec(secret_key: &[u8; 32]) -> Result<String, Nip06Error> {
    encode_bech32(NSEC_HRP, secret_key)
}

pub fn public_key_to_npub(public_key: &[u8; 32]) -> Result<String, Nip06Error> {
    encode_bech32(NPUB_HRP, public_key)
}

pub fn nsec_to_secret_key(nsec: &str) -> Result<[u8; 32], Nip06Error> {
    decode_bech32(NSEC_HRP, nsec)
}

pub fn npub_to_public_key(npub: &str) -> Result<[u8; 32], Nip06Error> {
    decode_bech32(NPUB_HRP, npub)
}

fn encode_bech32(hrp: &str, data: &[u8; 32]) -> Result<String, Nip06Error> {
    use bech32::{Bech32, Hrp};
    let hrp = Hrp::parse(hrp).map_err(|e| Nip06Error::Bech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Nip06Error::Bech32(e.to_string()))
}

fn decode_bech32(expected_hrp: &str, encoded: &str) -> Result<[u8; 32], Nip06Error> {
    let (hrp, data) = bech32::decode(encoded).map_err(|e| Nip06Error::Bech32(e.to_string()))?;

    if hrp.as_str() != expected_hrp {
        return Err(Nip06Error::WrongHrp {
            expected: expected_hrp.to_string(),
            got: hrp.to_string(),
        });
    }
    if data.len() != 32 {
        return Err(Nip06Error::BadKeyLength(data.len()));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&data);
    Ok(out)
}
