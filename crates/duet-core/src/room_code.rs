//! RoomCode: short, human-typeable identifier two peers use to rendezvous.
//!
//! Generated codes are four unambiguous letters followed by two digits
//! (e.g. `ABCD23`). Codes typed by a user are normalized (trimmed and
//! uppercased) and accepted from four characters up, so a guest can still
//! attempt a join after mistyping the length.

use rand::Rng;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Letters used in generated codes. No E, I, O or U.
pub const CODE_LETTERS: &[u8] = b"ABCDFGHJKLMNPQRSTVWXYZ";

/// Digits used in generated codes. No 0 or 1.
pub const CODE_DIGITS: &[u8] = b"23456789";

/// Length of a generated code.
pub const CODE_LENGTH: usize = 6;

/// Shortest input accepted by [`RoomCode::normalize`].
pub const MIN_INPUT_LENGTH: usize = 4;

/// Signaling namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "AVENTURA";

const LETTER_COUNT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomCodeError {
    #[error("Invalid room code format: {0}")]
    InvalidFormat(String),
}

/// A room code, always stored uppercased.
///
/// # Examples
/// ```
/// use duet_core::RoomCode;
///
/// let code = RoomCode::normalize("  abcd23 ").unwrap();
/// assert_eq!(code.as_str(), "ABCD23");
/// assert_eq!(code.peer_name("AVENTURA"), "AVENTURA-ABCD23");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a new random code using the thread-local RNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    /// Generate a code from an explicit random source.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut code = String::with_capacity(CODE_LENGTH);
        for _ in 0..LETTER_COUNT {
            code.push(CODE_LETTERS[rng.random_range(0..CODE_LETTERS.len())] as char);
        }
        for _ in LETTER_COUNT..CODE_LENGTH {
            code.push(CODE_DIGITS[rng.random_range(0..CODE_DIGITS.len())] as char);
        }
        Self(code)
    }

    /// Normalize user input into a code: trim and uppercase.
    ///
    /// Fails only when fewer than four characters remain. Anything else is
    /// passed through to signaling, where an unknown room fails the dial.
    pub fn normalize(input: &str) -> Result<Self, RoomCodeError> {
        let trimmed = input.trim();
        if trimmed.chars().count() < MIN_INPUT_LENGTH {
            return Err(RoomCodeError::InvalidFormat(format!(
                "expected at least {} characters, got {:?}",
                MIN_INPUT_LENGTH, trimmed
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Whether this code has the exact shape of a generated one.
    pub fn is_canonical(&self) -> bool {
        let bytes = self.0.as_bytes();
        bytes.len() == CODE_LENGTH
            && bytes[..LETTER_COUNT].iter().all(|b| CODE_LETTERS.contains(b))
            && bytes[LETTER_COUNT..].iter().all(|b| CODE_DIGITS.contains(b))
    }

    /// Identifier registered with the signaling service: `NAMESPACE-CODE`.
    pub fn peer_name(&self, namespace: &str) -> String {
        format!("{}-{}", namespace, self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s)
    }
}

impl AsRef<str> for RoomCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
