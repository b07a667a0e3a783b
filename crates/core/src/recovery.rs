//! Social recovery configuration and share transport
//!
//! An owner splits their secret key among guardians with
//! [`crate::shamir::split`], wraps each share for its guardian over NIP-04,
//! and records who holds what in a per-owner JSON config under the user
//! data directory (0700).

use crate::event::EventError;
use crate::nip04::{self, Nip04Error};
use crate::shamir::{self, Share, ShamirError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// Wrapper type tag for an encrypted share in transit
pub const SHARE_WRAP_TYPE: &str = "social_recovery_share";
/// Wrapper format version
pub const SHARE_WRAP_VERSION: &str = "1.0";
/// Current recovery config schema version
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("invalid_params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Shamir(#[from] ShamirError),

    #[error("share transport: {0}")]
    Transport(#[from] Nip04Error),

    #[error("key: {0}")]
    Key(#[from] EventError),

    #[error("malformed share wrapper: {0}")]
    BadWrapper(String),

    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One guardian entry in a recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Guardian {
    pub pubkey: String,
    pub label: String,
    pub share_index: u8,
    pub assigned_at: i64,
    pub confirmed: bool,
}

/// Per-owner record of a recovery setup. Contains no share material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub owner_pubkey: String,
    pub threshold: usize,
    pub total: usize,
    pub guardians: Vec<Guardian>,
    pub created_at: i64,
    pub version: u32,
}

impl RecoveryConfig {
    pub fn guardian(&self, pubkey: &str) -> Option<&Guardian> {
        self.guardians.iter().find(|g| g.pubkey == pubkey)
    }

    pub fn confirm_guardian(&mut self, pubkey: &str) -> bool {
        match self.guardians.iter_mut().find(|g| g.pubkey == pubkey) {
            Some(g) => {
                g.confirmed = true;
                true
            }
            None => false,
        }
    }

    pub fn confirmed_count(&self) -> usize {
        self.guardians.iter().filter(|g| g.confirmed).count()
    }
}

#[derive(Serialize, Deserialize)]
struct ShareWrapper {
    #[serde(rename = "type")]
    kind: String,
    version: String,
    content: String,
}

/// Split a secret for a set of guardians and build the config record.
///
/// `guardians` is `(pubkey_hex, label)` per guardian; `n` is its length.
/// Returns the config plus one encrypted wrapper JSON string per guardian,
/// in the same order.
pub fn setup(
    owner_secret_key: &[u8; 32],
    owner_pubkey: &str,
    secret: &[u8],
    threshold: usize,
    guardians: &[(String, String)],
    now: i64,
) -> Result<(RecoveryConfig, Vec<String>), RecoveryError> {
    if guardians.is_empty() {
        return Err(RecoveryError::InvalidParams("no guardians".to_string()));
    }
    for (i, (pubkey, _)) in guardians.iter().enumerate() {
        for (other, _) in &guardians[i + 1..] {
            if pubkey == other {
                return Err(RecoveryError::InvalidParams(format!(
                    "duplicate guardian {}",
                    pubkey
                )));
            }
        }
    }

    let shares = shamir::split(secret, threshold, guardians.len())?;

    let mut entries = Vec::with_capacity(guardians.len());
    let mut wrapped = Vec::with_capacity(guardians.len());
    for ((pubkey, label), share) in guardians.iter().zip(&shares) {
        wrapped.push(wrap_share(owner_secret_key, pubkey, share)?);
        entries.push(Guardian {
            pubkey: pubkey.clone(),
            label: label.clone(),
            share_index: share.index,
            assigned_at: now,
            confirmed: false,
        });
    }

    let config = RecoveryConfig {
        owner_pubkey: owner_pubkey.to_string(),
        threshold,
        total: guardians.len(),
        guardians: entries,
        created_at: now,
        version: CONFIG_VERSION,
    };

    debug!(
        owner = %owner_pubkey,
        threshold,
        total = config.total,
        "recovery setup complete"
    );
    Ok((config, wrapped))
}

/// Encrypt one share to a guardian:
/// `{"type":"social_recovery_share","version":"1.0","content":<nip04>}`.
pub fn wrap_share(
    owner_secret_key: &[u8; 32],
    guardian_pubkey: &str,
    share: &Share,
) -> Result<String, RecoveryError> {
    let encoded = share.encode();
    let content = nip04::encrypt(owner_secret_key, guardian_pubkey, &encoded)?;
    let wrapper = ShareWrapper {
        kind: SHARE_WRAP_TYPE.to_string(),
        version: SHARE_WRAP_VERSION.to_string(),
        content,
    };
    Ok(serde_json::to_string(&wrapper)?)
}

/// Decrypt a wrapped share received from the owner.
pub fn unwrap_share(
    guardian_secret_key: &[u8; 32],
    owner_pubkey: &str,
    wrapper_json: &str,
) -> Result<Share, RecoveryError> {
    let wrapper: ShareWrapper = serde_json::from_str(wrapper_json)?;
    if wrapper.kind != SHARE_WRAP_TYPE {
        return Err(RecoveryError::BadWrapper(format!(
            "unexpected type '{}'",
            wrapper.kind
        )));
    }
    if wrapper.version != SHARE_WRAP_VERSION {
        return Err(RecoveryError::BadWrapper(format!(
            "unsupported version '{}'",
            wrapper.version
        )));
    }
    let encoded = nip04::decrypt(guardian_secret_key, owner_pubkey, &wrapper.content)?;
    Ok(Share::decode(&encoded)?)
}

/// Reconstruct a 32-byte secret key from collected guardian shares.
pub fn recover_secret_key(
    shares: &[Share],
    threshold: usize,
) -> Result<Zeroizing<Vec<u8>>, RecoveryError> {
    Ok(shamir::combine_secret(shares, threshold, 32)?)
}

/// On-disk store for recovery configs, one JSON file per owner.
pub struct RecoveryStore {
    dir: PathBuf,
}

impl RecoveryStore {
    /// Open the store, creating `dir` with 0700 if missing.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RecoveryError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { dir })
    }

    fn config_path(&self, owner_pubkey: &str) -> PathBuf {
        self.dir.join(format!("recovery_{}.json", owner_pubkey))
    }

    /// Persist a config atomically (temp file then rename).
    pub fn save(&self, config: &RecoveryConfig) -> Result<(), RecoveryError> {
        let path = self.config_path(&config.owner_pubkey);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(config)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, owner_pubkey: &str) -> Result<Option<RecoveryConfig>, RecoveryError> {
        let path = self.config_path(owner_pubkey);
        match fs::read_to_string(&path) {
            Ok(body) => Ok(Some(serde_json::from_str(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete(&self, owner_pubkey: &str) -> Result<bool, RecoveryError> {
        match fs::remove_file(self.config_path(owner_pubkey)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{generate_secret_key, get_public_key_hex};
    use tempfile::TempDir;

    fn keypair() -> ([u8; 32], String) {
        let sk = generate_secret_key();
        let pk = get_public_key_hex(&sk).unwrap();
        (sk, pk)
    }

    #[test]
    fn test_setup_and_recover_2_of_3() {
        let (owner_sk, owner_pk) = keypair();
        let guardians: Vec<([u8; 32], String)> = (0..3).map(|_| keypair()).collect();
        let roster: Vec<(String, String)> = guardians
            .iter()
            .enumerate()
            .map(|(i, (_, pk))| (pk.clone(), format!("guardian-{}", i)))
            .collect();

        let secret = generate_secret_key();
        let (config, wrapped) =
            setup(&owner_sk, &owner_pk, &secret, 2, &roster, 1_700_000_000).unwrap();

        assert_eq!(config.threshold, 2);
        assert_eq!(config.total, 3);
        assert_eq!(wrapped.len(), 3);
        assert!(config.guardians.iter().all(|g| !g.confirmed));

        // guardians 0 and 2 come back with their shares
        let s0 = unwrap_share(&guardians[0].0, &owner_pk, &wrapped[0]).unwrap();
        let s2 = unwrap_share(&guardians[2].0, &owner_pk, &wrapped[2]).unwrap();

        let recovered = recover_secret_key(&[s0, s2], 2).unwrap();
        assert_eq!(recovered.as_slice(), &secret);
    }

    #[test]
    fn test_single_share_is_not_enough() {
        let (owner_sk, owner_pk) = keypair();
        let roster: Vec<(String, String)> = (0..3)
            .map(|i| (keypair().1, format!("g{}", i)))
            .collect();
        let secret = generate_secret_key();
        let (config, _) = setup(&owner_sk, &owner_pk, &secret, 2, &roster, 0).unwrap();

        let shares = shamir::split(&secret, config.threshold, config.total).unwrap();
        assert!(matches!(
            recover_secret_key(&shares[..1], 2),
            Err(RecoveryError::Shamir(ShamirError::ThresholdNotMet { .. }))
        ));
    }

    #[test]
    fn test_wrong_guardian_cannot_unwrap() {
        let (owner_sk, owner_pk) = keypair();
        let (_, guardian_pk) = keypair();
        let (eve_sk, _) = keypair();

        let shares = shamir::split(&[7u8; 32], 2, 3).unwrap();
        let wrapped = wrap_share(&owner_sk, &guardian_pk, &shares[0]).unwrap();

        assert!(unwrap_share(&eve_sk, &owner_pk, &wrapped).is_err());
    }

    #[test]
    fn test_wrapper_type_and_version_checked() {
        let (owner_sk, owner_pk) = keypair();
        let (guardian_sk, guardian_pk) = keypair();
        let shares = shamir::split(&[1u8; 32], 2, 2).unwrap();
        let wrapped = wrap_share(&owner_sk, &guardian_pk, &shares[0]).unwrap();

        let mut v: serde_json::Value = serde_json::from_str(&wrapped).unwrap();
        assert_eq!(v["type"], SHARE_WRAP_TYPE);
        assert_eq!(v["version"], SHARE_WRAP_VERSION);

        v["type"] = "something_else".into();
        assert!(matches!(
            unwrap_share(&guardian_sk, &owner_pk, &v.to_string()),
            Err(RecoveryError::BadWrapper(_))
        ));
    }

    #[test]
    fn test_duplicate_guardian_rejected() {
        let (owner_sk, owner_pk) = keypair();
        let (_, g) = keypair();
        let roster = vec![(g.clone(), "a".to_string()), (g, "b".to_string())];
        assert!(matches!(
            setup(&owner_sk, &owner_pk, &[1u8; 32], 2, &roster, 0),
            Err(RecoveryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_store_roundtrip_and_confirm() {
        let dir = TempDir::new().unwrap();
        let store = RecoveryStore::open(dir.path().join("recovery")).unwrap();

        let (owner_sk, owner_pk) = keypair();
        let roster: Vec<(String, String)> = (0..3)
            .map(|i| (keypair().1, format!("g{}", i)))
            .collect();
        let (mut config, _) =
            setup(&owner_sk, &owner_pk, &[9u8; 32], 2, &roster, 42).unwrap();

        store.save(&config).unwrap();
        let loaded = store.load(&owner_pk).unwrap().unwrap();
        assert_eq!(loaded, config);

        assert!(config.confirm_guardian(&roster[1].0));
        assert!(!config.confirm_guardian("unknown"));
        assert_eq!(config.confirmed_count(), 1);
        store.save(&config).unwrap();
        assert_eq!(store.load(&owner_pk).unwrap().unwrap().confirmed_count(), 1);

        assert!(store.delete(&owner_pk).unwrap());
        assert!(store.load(&owner_pk).unwrap().is_none());
        assert!(!store.delete(&owner_pk).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_store_dir_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recovery");
        RecoveryStore::open(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
