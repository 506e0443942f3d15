// Identifier sources: how the bytes of a broadcast identifier are produced

use super::RotatorError;
use rand::RngCore;
use zeroize::Zeroizing;

/// Length of a broadcast identifier in bytes
pub const IDENTIFIER_LEN: usize = 16;

pub type IdentifierBytes = [u8; IDENTIFIER_LEN];

/// Domain separation context for per-user secrets
const USER_SECRET_CONTEXT: &str = "contact-tracer 2020-04 user secret v1";

/// Pluggable identifier derivation.
///
/// `issued_at` is the start of the validity window the bytes will be used for.
/// Implementations may ignore it (pure randomness) or bind to it (keyed
/// derivation).
#[cfg_attr(test, mockall::automock)]
pub trait IdentifierSource: Send {
    fn derive(&mut self, issued_at: u64) -> Result<IdentifierBytes, RotatorError>;
}

/// Fresh OS randomness for every identifier
#[derive(Debug, Default)]
pub struct RandomSource;

impl IdentifierSource for RandomSource {
    fn derive(&mut self, _issued_at: u64) -> Result<IdentifierBytes, RotatorError> {
        let mut bytes = [0u8; IDENTIFIER_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| RotatorError::ExhaustedEntropy(e.to_string()))?;
        Ok(bytes)
    }
}

/// Keyed derivation from a per-user secret.
///
/// `blake3_keyed(secret, issued_at || counter)` truncated to
/// [`IDENTIFIER_LEN`]. The counter makes two derivations for the same
/// `issued_at` differ.
pub struct KeyedSource {
    secret: Zeroizing<[u8; 32]>,
    counter: u64,
}

impl KeyedSource {
    pub fn new(secret: [u8; 32]) -> Self {
        Self {
            secret: Zeroizing::new(secret),
            counter: 0,
        }
    }

    /// Derive the secret from a persisted user id
    pub fn from_user_id(user_id: &str) -> Self {
        Self::new(blake3::derive_key(USER_SECRET_CONTEXT, user_id.as_bytes()))
    }

    /// Generate a fresh random secret
    pub fn generate() -> Result<Self, RotatorError> {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng
            .try_fill_bytes(&mut secret[..])
            .map_err(|e| RotatorError::ExhaustedEntropy(e.to_string()))?;
        Ok(Self {
            secret,
            counter: 0,
        })
    }
}

impl IdentifierSource for KeyedSource {
    fn derive(&mut self, issued_at: u64) -> Result<IdentifierBytes, RotatorError> {
        let mut hasher = blake3::Hasher::new_keyed(&self.secret);
        hasher.update(&issued_at.to_le_bytes());
        hasher.update(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);

        let hash = hasher.finalize();
        let mut bytes = [0u8; IDENTIFIER_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..IDENTIFIER_LEN]);
        Ok(bytes)
    }
}

impl std::fmt::Debug for KeyedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedSource")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}
