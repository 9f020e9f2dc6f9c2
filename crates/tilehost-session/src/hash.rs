//! Password hashing strategies.
//!
//! New records are hashed with the configured algorithm. Existing records
//! are verified with whichever algorithm they were stored under, so
//! changing `crypt_algorithm` never locks anyone out.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::distr::Alphanumeric;
use rand::Rng;
use tilehost_config::CryptAlgorithm;

use crate::SessionError;

/// Characters DES crypt accepts in its two-character salt.
const DES_SALT_CHARS: &str = "./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Hashes and verifies passwords for one algorithm.
///
/// Both operations are CPU-bound; async callers run them on the
/// blocking pool.
pub trait HashStrategy: Send + Sync {
    fn algorithm(&self) -> CryptAlgorithm;

    fn hash(&self, password: &str) -> Result<String, SessionError>;

    /// Constant-time with respect to the stored hash.
    fn verify(&self, password: &str, stored: &str) -> bool;
}

/// Picks the strategy for `algorithm`.
pub fn strategy_for(algorithm: CryptAlgorithm, salt_length: usize) -> Box<dyn HashStrategy> {
    match algorithm {
        CryptAlgorithm::Argon2 => Box::new(Argon2Strategy { salt_length }),
        CryptAlgorithm::Broken => Box::new(BrokenStrategy),
        other => Box::new(CryptStrategy {
            algorithm: other,
            salt_length,
        }),
    }
}

fn random_salt(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Argon2
// ---------------------------------------------------------------------------

/// Argon2id in PHC string format. The default.
pub struct Argon2Strategy {
    pub salt_length: usize,
}

impl HashStrategy for Argon2Strategy {
    fn algorithm(&self) -> CryptAlgorithm {
        CryptAlgorithm::Argon2
    }

    fn hash(&self, password: &str) -> Result<String, SessionError> {
        let salt = SaltString::from_b64(&random_salt(self.salt_length))
            .map_err(|e| SessionError::Hashing(e.to_string()))?;
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| SessionError::Hashing(e.to_string()))
    }

    fn verify(&self, password: &str, stored: &str) -> bool {
        match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Unix crypt family
// ---------------------------------------------------------------------------

/// SHA-512, SHA-256, MD5, and DES crypt.
pub struct CryptStrategy {
    algorithm: CryptAlgorithm,
    salt_length: usize,
}

impl CryptStrategy {
    fn setting(&self) -> String {
        match self.algorithm {
            CryptAlgorithm::Sha512 => format!("$6${}", random_salt(self.salt_length)),
            CryptAlgorithm::Sha256 => format!("$5${}", random_salt(self.salt_length)),
            CryptAlgorithm::Md5 => format!("$1${}", random_salt(self.salt_length)),
            _ => random_salt(2),
        }
    }
}

impl HashStrategy for CryptStrategy {
    fn algorithm(&self) -> CryptAlgorithm {
        self.algorithm
    }

    fn hash(&self, password: &str) -> Result<String, SessionError> {
        pwhash::unix::crypt(password, &self.setting()).map_err(|e| SessionError::Hashing(e.to_string()))
    }

    fn verify(&self, password: &str, stored: &str) -> bool {
        crypt_verify(password, stored)
    }
}

/// Recomputes with the stored setting and compares.
fn crypt_verify(password: &str, stored: &str) -> bool {
    match pwhash::unix::crypt(password, stored) {
        Ok(computed) => constant_time_eq(computed.as_bytes(), stored.as_bytes()),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Broken
// ---------------------------------------------------------------------------

/// DES crypt salted with the password's own first two characters.
///
/// Only for reading password files written by very old servers. Every
/// hash of the same password is identical.
pub struct BrokenStrategy;

impl HashStrategy for BrokenStrategy {
    fn algorithm(&self) -> CryptAlgorithm {
        CryptAlgorithm::Broken
    }

    fn hash(&self, password: &str) -> Result<String, SessionError> {
        let salt: String = password.chars().take(2).collect();
        if salt.chars().count() != 2 || !salt.chars().all(|c| DES_SALT_CHARS.contains(c)) {
            return Err(SessionError::Hashing(
                "password cannot be stored with the broken algorithm".into(),
            ));
        }
        pwhash::unix::crypt(password, &salt).map_err(|e| SessionError::Hashing(e.to_string()))
    }

    fn verify(&self, password: &str, stored: &str) -> bool {
        crypt_verify(password, stored)
    }
}

/// Compares without short-circuiting on the first difference.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
