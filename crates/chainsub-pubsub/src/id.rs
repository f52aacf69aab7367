//! Subscription identifiers.
//!
//! Server-minted ids are 128 random bits rendered as `0x`-prefixed lowercase
//! hex without leading zeros. Client-side, an id is whatever string the node
//! returned from its subscribe call, so [`SubscriptionId`] does not validate.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

/// An opaque subscription id as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Mint a fresh id from the process-wide generator.
    pub fn new_random() -> Self {
        IdGenerator::global().next()
    }

    /// Render raw id bytes: lowercase hex, `0x` prefix, leading zeros stripped.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let encoded = hex::encode(bytes);
        let trimmed = encoded.trim_start_matches('0');
        if trimmed.is_empty() {
            Self("0x0".to_string())
        } else {
            Self(format!("0x{trimmed}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Thread-safe source of subscription ids.
///
/// A single PRNG, seeded once from the OS, behind a short lock. If the OS
/// source is unavailable the seed falls back to the current time: ids get
/// easier to guess but generation never fails.
pub struct IdGenerator {
    rng: Mutex<StdRng>,
}

impl IdGenerator {
    pub fn new() -> Self {
        let rng = StdRng::from_rng(OsRng).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "OS randomness unavailable, seeding subscription ids from clock");
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default();
            StdRng::seed_from_u64(nanos)
        });
        Self { rng: Mutex::new(rng) }
    }

    /// The process-wide generator.
    pub fn global() -> &'static IdGenerator {
        static GLOBAL: OnceLock<IdGenerator> = OnceLock::new();
        GLOBAL.get_or_init(IdGenerator::new)
    }

    /// Produce the next id.
    pub fn next(&self) -> SubscriptionId {
        let mut bytes = [0u8; 16];
        self.rng.lock().fill_bytes(&mut bytes);
        SubscriptionId::from_bytes(&bytes)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn zero_renders_as_0x0() {
        assert_eq!(SubscriptionId::from_bytes(&[0u8; 16]).as_str(), "0x0");
    }

    #[test]
    fn leading_zero_nibbles_stripped() {
        let mut bytes = [0u8; 16];
        bytes[14] = 0x0a;
        bytes[15] = 0xbc;
        assert_eq!(SubscriptionId::from_bytes(&bytes).as_str(), "0xabc");
    }

    #[test]
    fn generated_ids_are_lowercase_hex() {
        let id = SubscriptionId::new_random();
        let hex_part = id.as_str().strip_prefix("0x").unwrap();
        assert!(!hex_part.is_empty() && hex_part.len() <= 32);
        assert!(!hex_part.starts_with('0') || hex_part == "0");
        assert!(hex_part.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn concurrent_generation_yields_distinct_ids() {
        let gen = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = Arc::clone(&gen);
                std::thread::spawn(move || (0..250).map(|_| gen.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SubscriptionId::from("0x9f");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"0x9f\"");
        let back: SubscriptionId = serde_json::from_str("\"0x9f\"").unwrap();
        assert_eq!(back, id);
    }
}
