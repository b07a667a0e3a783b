//! Encrypted key backup documents
//!
//! A backup is a small JSON wrapper around a NIP-49 `ncryptsec` ciphertext
//! with enough metadata to identify the key and the scrypt work factor it
//! was encrypted under. Import accepts either the wrapper or a bare
//! `ncryptsec1...` string. Mnemonic import is one-way: a BIP-39 phrase
//! derives the key, but a key never yields a phrase back.

use crate::event::{EventError, get_public_key};
use crate::nip06::{self, Keypair, Nip06Error};
use crate::nip49::{self, KeySecurity, Nip49Error};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current backup document schema version
pub const BACKUP_VERSION: u32 = 1;
/// Payload format identifier
pub const BACKUP_FORMAT: &str = "nip49";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Encryption(#[from] Nip49Error),

    #[error(transparent)]
    Derivation(#[from] Nip06Error),

    #[error("key: {0}")]
    Key(#[from] EventError),

    #[error("malformed backup document: {0}")]
    BadDocument(String),

    #[error("not_available")]
    NotAvailable,
}

/// Named scrypt work factors, each the `log2(N)` passed to NIP-49.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityLevel {
    Fast,
    Normal,
    High,
    Paranoid,
}

impl SecurityLevel {
    pub fn log_n(self) -> u8 {
        match self {
            SecurityLevel::Fast => 16,
            SecurityLevel::Normal => 19,
            SecurityLevel::High => 21,
            SecurityLevel::Paranoid => 22,
        }
    }

    pub fn from_log_n(log_n: u8) -> Option<Self> {
        match log_n {
            16 => Some(SecurityLevel::Fast),
            19 => Some(SecurityLevel::Normal),
            21 => Some(SecurityLevel::High),
            22 => Some(SecurityLevel::Paranoid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupDocument {
    pub version: u32,
    pub format: String,
    pub created_at: String,
    pub identity_name: String,
    pub npub: String,
    pub ncryptsec: String,
    pub security_level: SecurityLevel,
}

/// A key recovered from a backup, with the envelope metadata.
pub struct ImportedKey {
    pub secret_key: [u8; 32],
    pub log_n: u8,
    pub key_security: KeySecurity,
}

/// Encrypt a secret key under a passphrase and wrap it in a backup
/// document.
pub fn export(
    secret_key: &[u8; 32],
    passphrase: &str,
    level: SecurityLevel,
    identity_name: &str,
) -> Result<BackupDocument, BackupError> {
    let ncryptsec = nip49::encrypt(secret_key, passphrase, level.log_n(), KeySecurity::Unknown)?;
    let pubkey = get_public_key(secret_key)?;
    let npub = nip06::public_key_to_npub(&pubkey)?;

    Ok(BackupDocument {
        version: BACKUP_VERSION,
        format: BACKUP_FORMAT.to_string(),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        identity_name: identity_name.to_string(),
        npub,
        ncryptsec,
        security_level: level,
    })
}

/// Recover a secret key from either a backup document (JSON) or a bare
/// `ncryptsec1...` string.
pub fn import(input: &str, passphrase: &str) -> Result<ImportedKey, BackupError> {
    let trimmed = input.trim();
    let ncryptsec = if trimmed.starts_with('{') {
        let doc: BackupDocument = serde_json::from_str(trimmed)
            .map_err(|e| BackupError::BadDocument(e.to_string()))?;
        if doc.format != BACKUP_FORMAT {
            return Err(BackupError::BadDocument(format!(
                "unsupported format '{}'",
                doc.format
            )));
        }
        doc.ncryptsec
    } else {
        trimmed.to_string()
    };

    let (secret_key, log_n, key_security) = nip49::decrypt(&ncryptsec, passphrase)?;
    Ok(ImportedKey {
        secret_key,
        log_n,
        key_security,
    })
}

/// Derive a key from a BIP-39 phrase. The reverse direction does not
/// exist; see [`export_mnemonic`].
pub fn import_mnemonic(
    mnemonic: &str,
    passphrase: &str,
    account: u32,
) -> Result<Keypair, BackupError> {
    Ok(nip06::derive_keypair_full(mnemonic, passphrase, account)?)
}

/// A mnemonic cannot be recovered from derived key material.
pub fn export_mnemonic() -> Result<String, BackupError> {
    Err(BackupError::NotAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::generate_secret_key;

    // log_n 16 is slow enough already; tests stay at FAST
    const LEVEL: SecurityLevel = SecurityLevel::Fast;

    #[test]
    fn test_export_import_roundtrip() {
        let sk = generate_secret_key();
        let doc = export(&sk, "hunter2", LEVEL, "main identity").unwrap();

        assert_eq!(doc.version, BACKUP_VERSION);
        assert_eq!(doc.format, BACKUP_FORMAT);
        assert_eq!(doc.security_level, LEVEL);
        assert!(doc.npub.starts_with("npub1"));
        assert!(doc.ncryptsec.starts_with("ncryptsec1"));
        assert!(chrono::DateTime::parse_from_rfc3339(&doc.created_at).is_ok());

        let json = serde_json::to_string(&doc).unwrap();
        let imported = import(&json, "hunter2").unwrap();
        assert_eq!(imported.secret_key, sk);
        assert_eq!(imported.log_n, LEVEL.log_n());
    }

    #[test]
    fn test_import_bare_ncryptsec() {
        let sk = generate_secret_key();
        let doc = export(&sk, "pass", LEVEL, "x").unwrap();
        let imported = import(&doc.ncryptsec, "pass").unwrap();
        assert_eq!(imported.secret_key, sk);
    }

    #[test]
    fn test_wrong_passphrase_reason() {
        let sk = generate_secret_key();
        let doc = export(&sk, "right", LEVEL, "x").unwrap();
        // ImportedKey carries no Debug impl, so match rather than unwrap_err
        match import(&doc.ncryptsec, "wrong") {
            Err(err) => assert_eq!(err.to_string(), "wrong password or corrupted data"),
            Ok(_) => panic!("import succeeded with the wrong passphrase"),
        }
    }

    #[test]
    fn test_security_level_names_serialize_uppercase() {
        assert_eq!(
            serde_json::to_string(&SecurityLevel::Paranoid).unwrap(),
            "\"PARANOID\""
        );
        assert_eq!(
            serde_json::from_str::<SecurityLevel>("\"FAST\"").unwrap(),
            SecurityLevel::Fast
        );
        assert_eq!(SecurityLevel::from_log_n(19), Some(SecurityLevel::Normal));
        assert_eq!(SecurityLevel::from_log_n(17), None);
    }

    #[test]
    fn test_bad_document_rejected() {
        assert!(matches!(
            import("{\"not\": \"a backup\"}", "p"),
            Err(BackupError::BadDocument(_))
        ));
    }

    #[test]
    fn test_mnemonic_is_one_way() {
        let mnemonic =
            "leader monkey parrot ring guide accident before fence cannon height naive bean";
        let keypair = import_mnemonic(mnemonic, "", 0).unwrap();
        assert_eq!(keypair.secret_key_hex().len(), 64);

        let err = export_mnemonic().unwrap_err();
        assert_eq!(err.to_string(), "not_available");
    }
}
