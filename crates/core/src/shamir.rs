//! Shamir secret sharing over GF(2^8)
//!
//! k-of-n threshold splitting of an arbitrary-length secret, one byte at a
//! time in the Rijndael field (x^8 + x^4 + x^3 + x + 1). The constant term
//! of each per-byte polynomial is the secret byte; higher coefficients come
//! from the OS RNG. Shares are evaluated with Horner's rule at x = 1..n and
//! recombined by Lagrange interpolation at x = 0 using log/exp tables.
//!
//! Wire encoding for a share: `sss1:<index>:<base64(data)>`.

use base64::Engine;
use rand::RngCore;
use std::sync::OnceLock;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Prefix for the share string encoding
pub const SHARE_PREFIX: &str = "sss1";

/// Highest usable share index (0 is reserved for the secret itself)
pub const MAX_SHARES: usize = 255;

#[derive(Debug, Error)]
pub enum ShamirError {
    #[error("invalid_params: {0}")]
    InvalidParams(String),

    #[error("invalid_share: {0}")]
    InvalidShare(String),

    #[error("threshold_not_met: need {needed}, have {have}")]
    ThresholdNotMet { needed: usize, have: usize },

    #[error("reconstruction_failed: {0}")]
    ReconstructionFailed(String),
}

// Rijndael reduction polynomial, carry-less peasant multiply. Only used to
// seed the log/exp tables; runtime arithmetic goes through the tables.
fn gf_mul_slow(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let hi = a & 0x80;
        a <<= 1;
        if hi != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    product
}

struct GfTables {
    /// exp[i] = 3^i, doubled so sums of two logs need no reduction
    exp: [u8; 510],
    /// log[a] for a != 0, base 3
    log: [u8; 256],
}

fn tables() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 510];
        let mut log = [0u8; 256];
        let mut x = 1u8;
        for i in 0..255 {
            exp[i] = x;
            exp[i + 255] = x;
            log[x as usize] = i as u8;
            x = gf_mul_slow(x, 3);
        }
        GfTables { exp, log }
    })
}

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

fn gf_div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0);
    if a == 0 {
        return 0;
    }
    let t = tables();
    t.exp[t.log[a as usize] as usize + 255 - t.log[b as usize] as usize]
}

/// Horner evaluation of a polynomial given coefficients c0..c_{k-1}.
fn poly_eval(coefficients: &[u8], x: u8) -> u8 {
    let mut acc = 0u8;
    for &coefficient in coefficients.iter().rev() {
        acc = gf_mul(acc, x) ^ coefficient;
    }
    acc
}

/// One share: a 1-based evaluation point and per-byte polynomial values.
/// The buffer is wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    pub index: u8,
    data: Vec<u8>,
}

impl Share {
    pub fn new(index: u8, data: Vec<u8>) -> Result<Self, ShamirError> {
        if index == 0 {
            return Err(ShamirError::InvalidShare("index 0 is reserved".to_string()));
        }
        if data.is_empty() {
            return Err(ShamirError::InvalidShare("empty share data".to_string()));
        }
        Ok(Self { index, data })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encode as `sss1:<index>:<base64(data)>`.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}",
            SHARE_PREFIX,
            self.index,
            base64::engine::general_purpose::STANDARD.encode(&self.data)
        )
    }

    /// Parse the `sss1:<index>:<base64>` encoding.
    pub fn decode(encoded: &str) -> Result<Self, ShamirError> {
        let mut parts = encoded.splitn(3, ':');
        let prefix = parts.next().unwrap_or_default();
        if prefix != SHARE_PREFIX {
            return Err(ShamirError::InvalidShare(format!(
                "expected '{}' prefix",
                SHARE_PREFIX
            )));
        }

        let index: u8 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .filter(|&i| i != 0)
            .ok_or_else(|| ShamirError::InvalidShare("bad share index".to_string()))?;

        let payload = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ShamirError::InvalidShare("missing share payload".to_string()))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| ShamirError::InvalidShare(e.to_string()))?;

        Share::new(index, data)
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("data", &"[redacted]")
            .finish()
    }
}

/// Split a secret into n shares, any k of which reconstruct it.
pub fn split(secret: &[u8], k: usize, n: usize) -> Result<Vec<Share>, ShamirError> {
    if secret.is_empty() {
        return Err(ShamirError::InvalidParams("empty secret".to_string()));
    }
    if k < 2 {
        return Err(ShamirError::InvalidParams(format!(
            "threshold must be at least 2, got {}",
            k
        )));
    }
    if n < k {
        return Err(ShamirError::InvalidParams(format!(
            "share count {} below threshold {}",
            n, k
        )));
    }
    if n > MAX_SHARES {
        return Err(ShamirError::InvalidParams(format!(
            "share count {} exceeds {}",
            n, MAX_SHARES
        )));
    }

    let mut shares: Vec<Vec<u8>> = vec![Vec::with_capacity(secret.len()); n];
    let mut coefficients = Zeroizing::new(vec![0u8; k]);

    for &secret_byte in secret {
        coefficients[0] = secret_byte;
        rand::rng().fill_bytes(&mut coefficients[1..]);

        for (j, share) in shares.iter_mut().enumerate() {
            share.push(poly_eval(&coefficients, (j + 1) as u8));
        }
    }

    shares
        .into_iter()
        .enumerate()
        .map(|(j, data)| Share::new((j + 1) as u8, data))
        .collect()
}

/// Reconstruct the secret from at least `threshold` shares.
pub fn combine(shares: &[Share], threshold: usize) -> Result<Zeroizing<Vec<u8>>, ShamirError> {
    if threshold < 2 {
        return Err(ShamirError::InvalidParams(format!(
            "threshold must be at least 2, got {}",
            threshold
        )));
    }
    if shares.len() < threshold {
        return Err(ShamirError::ThresholdNotMet {
            needed: threshold,
            have: shares.len(),
        });
    }

    let subset = &shares[..threshold];
    let secret_len = subset[0].data.len();
    for share in subset {
        if share.data.len() != secret_len {
            return Err(ShamirError::InvalidShare(
                "shares have mismatched lengths".to_string(),
            ));
        }
    }
    for (i, a) in subset.iter().enumerate() {
        for b in &subset[i + 1..] {
            if a.index == b.index {
                return Err(ShamirError::InvalidShare(format!(
                    "duplicate share index {}",
                    a.index
                )));
            }
        }
    }

    let mut secret = Zeroizing::new(vec![0u8; secret_len]);
    for (byte_idx, out) in secret.iter_mut().enumerate() {
        let mut acc = 0u8;
        for share_j in subset {
            // Lagrange basis at x = 0
            let mut basis = 1u8;
            for share_m in subset {
                if share_m.index == share_j.index {
                    continue;
                }
                basis = gf_mul(
                    basis,
                    gf_div(share_m.index, share_m.index ^ share_j.index),
                );
            }
            acc ^= gf_mul(share_j.data[byte_idx], basis);
        }
        *out = acc;
    }

    Ok(secret)
}

/// Reconstruct a secret of a known length, failing when the shares imply a
/// different one.
pub fn combine_secret(
    shares: &[Share],
    threshold: usize,
    secret_len: usize,
) -> Result<Zeroizing<Vec<u8>>, ShamirError> {
    let secret = combine(shares, threshold)?;
    if secret.len() != secret_len {
        return Err(ShamirError::ReconstructionFailed(format!(
            "expected {} bytes, got {}",
            secret_len,
            secret.len()
        )));
    }
    Ok(secret)
}
