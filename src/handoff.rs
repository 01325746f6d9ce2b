//! One-time handoff codes proving a member received their share.
//!
//! Only a salted SHA-256 digest of each code is kept, bound to the
//! `(group, member)` pair it was minted for, so a code is useless for any
//! other member or group. Comparison is constant-time.

use std::fmt;

use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::HandoffConfig;
use crate::model::{GroupId, UserId};

/// A raw code, handed out once for out-of-band delivery to the member.
#[derive(Clone, PartialEq, Eq)]
pub struct HandoffCode(String);

impl HandoffCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HandoffCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandoffCode(****)")
    }
}

/// Stored form of a handoff code.
#[derive(Clone, PartialEq, Eq)]
pub struct CodeHash {
    salt: [u8; 16],
    digest: [u8; 32],
}

impl fmt::Debug for CodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeHash({}:{})", hex::encode(self.salt), hex::encode(self.digest))
    }
}

#[derive(Debug, Clone)]
pub struct HandoffVerifier {
    digits: u32,
    max_attempts: u32,
}

impl HandoffVerifier {
    /// `digits` is clamped to 4..=9 and `max_attempts` to at least 1.
    pub fn new(digits: u32, max_attempts: u32) -> Self {
        Self {
            digits: digits.clamp(4, 9),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn digits(&self) -> u32 {
        self.digits
    }

    /// Wrong codes tolerated before a member's code is revoked.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Generate a fresh code for `member` of `group`.
    pub fn mint(&self, group: GroupId, member: UserId) -> (HandoffCode, CodeHash) {
        let mut rng = rand::thread_rng();
        let value = rng.gen_range(0..10u32.pow(self.digits));
        let code = format!("{value:0width$}", width = self.digits as usize);

        let mut salt = [0u8; 16];
        rng.fill(&mut salt);
        let digest = Self::digest(&salt, group, member, &code);
        (HandoffCode(code), CodeHash { salt, digest })
    }

    /// Check `candidate` against the stored hash for `member` of `group`.
    pub fn verify(&self, group: GroupId, member: UserId, candidate: &str, stored: &CodeHash) -> bool {
        let digest = Self::digest(&stored.salt, group, member, candidate.trim());
        digest.as_slice().ct_eq(stored.digest.as_slice()).into()
    }

    fn digest(salt: &[u8; 16], group: GroupId, member: UserId, code: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(group.to_be_bytes());
        hasher.update(member.to_be_bytes());
        hasher.update(code.as_bytes());
        hasher.finalize().into()
    }
}

impl From<&HandoffConfig> for HandoffVerifier {
    fn from(config: &HandoffConfig) -> Self {
        HandoffVerifier::new(config.code_digits, config.max_attempts)
    }
}

impl Default for HandoffVerifier {
    fn default() -> Self {
        HandoffVerifier::from(&HandoffConfig::default())
    }
}
