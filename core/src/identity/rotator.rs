//! Identifier rotation
//!
//! Issues time-boxed broadcast identifiers. A successor can be pre-generated
//! ahead of expiry so the advertiser's swap needs no derivation work, and a
//! lookback window guarantees no identifier is reissued soon after use.

use super::source::{IdentifierBytes, IdentifierSource};
use super::RotatorError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Default identifier validity in seconds (15 minutes)
pub const DEFAULT_VALIDITY_SECS: u64 = 15 * 60;

/// Default number of recently issued identifiers that must not repeat (24h)
pub const DEFAULT_LOOKBACK: usize = 96;

/// Re-derivation attempts before a collision is treated as exhausted entropy
const MAX_DERIVE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Validity window length of each identifier
    pub validity_secs: u64,
    /// How many previously issued identifiers are checked for repeats
    pub lookback: usize,
    /// Swap this many seconds before the current identifier expires
    pub rotation_lead_secs: u64,
    /// Advertiser tick cadence in milliseconds
    pub tick_interval_ms: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            validity_secs: DEFAULT_VALIDITY_SECS,
            lookback: DEFAULT_LOOKBACK,
            rotation_lead_secs: 1,
            tick_interval_ms: 1000,
        }
    }
}

/// An anonymous identifier with its validity window `[issued_at, expires_at)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastIdentifier {
    pub bytes: IdentifierBytes,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl BroadcastIdentifier {
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.issued_at <= now && now < self.expires_at
    }

    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

pub struct IdentifierRotator {
    source: Box<dyn IdentifierSource>,
    config: RotationConfig,
    current: Option<BroadcastIdentifier>,
    successor: Option<IdentifierBytes>,
    recent: VecDeque<IdentifierBytes>,
}

impl IdentifierRotator {
    pub fn new(source: Box<dyn IdentifierSource>, config: RotationConfig) -> Self {
        Self {
            source,
            config,
            current: None,
            successor: None,
            recent: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// The identifier issued by the last rotation, if any
    pub fn current_identifier(&self) -> Option<&BroadcastIdentifier> {
        self.current.as_ref()
    }

    pub fn has_successor(&self) -> bool {
        self.successor.is_some()
    }

    /// Whether the current identifier is missing or expires within `lead_secs`
    pub fn needs_rotation(&self, now: u64, lead_secs: u64) -> bool {
        match &self.current {
            None => true,
            Some(current) => now.saturating_add(lead_secs) >= current.expires_at,
        }
    }

    /// Pre-generate the next identifier's bytes. No-op if one is already pending.
    pub fn prepare_successor(&mut self, now: u64) -> Result<(), RotatorError> {
        if self.successor.is_none() {
            let issued_at = self
                .current
                .as_ref()
                .map(|c| c.expires_at)
                .unwrap_or(now);
            self.successor = Some(self.derive_fresh(issued_at)?);
        }
        Ok(())
    }

    /// Issue a new identifier valid for `[now, now + validity)`.
    ///
    /// Uses the pre-generated successor when present.
    pub fn rotate(&mut self, now: u64) -> Result<BroadcastIdentifier, RotatorError> {
        let bytes = match self.successor.take() {
            Some(bytes) => bytes,
            None => self.derive_fresh(now)?,
        };

        let identifier = BroadcastIdentifier {
            bytes,
            issued_at: now,
            expires_at: now.saturating_add(self.config.validity_secs),
        };

        self.remember(bytes);
        self.current = Some(identifier.clone());

        debug!(
            "Rotated broadcast identifier {}.. valid until {}",
            &identifier.to_hex()[..8],
            identifier.expires_at
        );
        Ok(identifier)
    }

    fn derive_fresh(&mut self, issued_at: u64) -> Result<IdentifierBytes, RotatorError> {
        for attempt in 0..MAX_DERIVE_ATTEMPTS {
            let candidate = self.source.derive(issued_at)?;
            if !self.recent.contains(&candidate) && self.successor != Some(candidate) {
                return Ok(candidate);
            }
            warn!("Identifier collision within lookback (attempt {})", attempt + 1);
        }

        Err(RotatorError::ExhaustedEntropy(format!(
            "no fresh identifier after {} attempts",
            MAX_DERIVE_ATTEMPTS
        )))
    }

    fn remember(&mut self, bytes: IdentifierBytes) {
        self.recent.push_back(bytes);
        let capacity = self.config.lookback.max(1);
        while self.recent.len() > capacity {
            self.recent.pop_front();
        }
    }
}

impl std::fmt::Debug for IdentifierRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifierRotator")
            .field("config", &self.config)
            .field("current", &self.current)
            .field("has_successor", &self.successor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{MockIdentifierSource, RandomSource};
    use std::collections::HashSet;

    fn rotator() -> IdentifierRotator {
        IdentifierRotator::new(Box::new(RandomSource), RotationConfig::default())
    }

    #[test]
    fn test_no_current_identifier_before_first_rotation() {
        let rotator = rotator();
        assert!(rotator.current_identifier().is_none());
        assert!(rotator.needs_rotation(0, 0));
    }

    #[test]
    fn test_rotate_sets_validity_window() {
        let mut rotator = rotator();
        let id = rotator.rotate(10_000).unwrap();

        assert_eq!(id.issued_at, 10_000);
        assert_eq!(id.expires_at, 10_000 + DEFAULT_VALIDITY_SECS);
        assert!(id.is_valid_at(10_000));
        assert!(!id.is_valid_at(10_000 + DEFAULT_VALIDITY_SECS));
        assert_eq!(rotator.current_identifier(), Some(&id));
    }

    #[test]
    fn test_needs_rotation_respects_lead() {
        let mut rotator = rotator();
        let id = rotator.rotate(0).unwrap();

        assert!(!rotator.needs_rotation(id.expires_at - 10, 1));
        assert!(rotator.needs_rotation(id.expires_at - 1, 1));
        assert!(rotator.needs_rotation(id.expires_at, 0));
    }

    #[test]
    fn test_rotate_consumes_prepared_successor() {
        let mut rotator = rotator();
        rotator.rotate(0).unwrap();
        rotator.prepare_successor(890).unwrap();
        assert!(rotator.has_successor());

        rotator.rotate(899).unwrap();
        assert!(!rotator.has_successor());
    }

    #[test]
    fn test_prepare_successor_is_idempotent() {
        let mut source = MockIdentifierSource::new();
        source.expect_derive().times(2).returning(|t| {
            let mut bytes = [0u8; 16];
            bytes[..8].copy_from_slice(&t.to_le_bytes());
            Ok(bytes)
        });

        let mut rotator = IdentifierRotator::new(Box::new(source), RotationConfig::default());
        rotator.rotate(0).unwrap();
        rotator.prepare_successor(100).unwrap();
        rotator.prepare_successor(200).unwrap();
    }

    #[test]
    fn test_many_rotations_never_repeat_within_lookback() {
        let mut rotator = rotator();
        let mut seen = HashSet::new();

        for i in 0..DEFAULT_LOOKBACK as u64 {
            let id = rotator.rotate(i * DEFAULT_VALIDITY_SECS).unwrap();
            assert!(seen.insert(id.bytes), "identifier repeated at rotation {}", i);
        }
    }

    #[test]
    fn test_collision_is_rederived() {
        let mut source = MockIdentifierSource::new();
        let mut calls = 0u8;
        source.expect_derive().returning(move |_| {
            calls += 1;
            // First two derivations collide, third is fresh
            Ok(if calls <= 2 { [1u8; 16] } else { [2u8; 16] })
        });

        let mut rotator = IdentifierRotator::new(Box::new(source), RotationConfig::default());
        let first = rotator.rotate(0).unwrap();
        let second = rotator.rotate(900).unwrap();

        assert_eq!(first.bytes, [1u8; 16]);
        assert_eq!(second.bytes, [2u8; 16]);
    }

    #[test]
    fn test_constant_source_exhausts() {
        let mut source = MockIdentifierSource::new();
        source.expect_derive().returning(|_| Ok([9u8; 16]));

        let mut rotator = IdentifierRotator::new(Box::new(source), RotationConfig::default());
        rotator.rotate(0).unwrap();

        let err = rotator.rotate(900).unwrap_err();
        assert!(matches!(err, RotatorError::ExhaustedEntropy(_)));
    }

    #[test]
    fn test_source_failure_is_surfaced() {
        let mut source = MockIdentifierSource::new();
        source
            .expect_derive()
            .returning(|_| Err(RotatorError::ExhaustedEntropy("rng offline".into())));

        let mut rotator = IdentifierRotator::new(Box::new(source), RotationConfig::default());
        assert_eq!(
            rotator.rotate(0),
            Err(RotatorError::ExhaustedEntropy("rng offline".into()))
        );
        assert!(rotator.current_identifier().is_none());
    }

    #[test]
    fn test_lookback_allows_reuse_after_window() {
        let config = RotationConfig {
            lookback: 1,
            ..RotationConfig::default()
        };
        let mut source = MockIdentifierSource::new();
        let mut calls = 0u8;
        source.expect_derive().returning(move |_| {
            calls += 1;
            Ok(if calls % 2 == 1 { [1u8; 16] } else { [2u8; 16] })
        });

        let mut rotator = IdentifierRotator::new(Box::new(source), config);
        assert_eq!(rotator.rotate(0).unwrap().bytes, [1u8; 16]);
        assert_eq!(rotator.rotate(900).unwrap().bytes, [2u8; 16]);
        assert_eq!(rotator.rotate(1800).unwrap().bytes, [1u8; 16]);
    }
}
