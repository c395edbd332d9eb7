//! Bucket state and its persisted encoding.

use serde::{Deserialize, Serialize};

/// Default namespace for state keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// A key that identifies one client's bucket in the shared store.
///
/// Both fields of the bucket live under this single key so that one
/// conditional write covers them together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    /// Namespace shared by every client of one limiter
    pub prefix: String,
    /// The client this bucket belongs to
    pub client_id: String,
}

impl StateKey {
    pub fn new(prefix: &str, client_id: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            client_id: client_id.to_string(),
        }
    }

    /// The key string used against the store: `{prefix}:{client_id}:state`.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}:state", self.prefix, self.client_id)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

/// Per-client token bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, fractional
    pub tokens: f64,
    /// Epoch milliseconds at which `tokens` was last computed
    pub last_refill_at_ms: i64,
}

impl BucketState {
    /// A full bucket observed for the first time at `now_ms`.
    pub fn full(capacity: u64, now_ms: i64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill_at_ms: now_ms,
        }
    }

    /// Encode as the single string value stored per client.
    ///
    /// A non-finite balance is refused rather than written, since JSON has
    /// no representation for it.
    pub fn encode(&self) -> Result<String, String> {
        if !self.tokens.is_finite() {
            return Err(format!("token balance {} is not finite", self.tokens));
        }
        serde_json::to_string(self).map_err(|e| e.to_string())
    }

    /// Decode a stored value, rejecting anything that is not a valid balance.
    pub fn decode(raw: &str) -> Result<Self, String> {
        let state: BucketState = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        if !state.tokens.is_finite() || state.tokens < 0.0 {
            return Err(format!("token balance {} out of range", state.tokens));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_key_format() {
        let key = StateKey::new(DEFAULT_KEY_PREFIX, "client-a");
        assert_eq!(key.to_store_key(), "rate_limit:client-a:state");
        assert_eq!(key.to_string(), "rate_limit:client-a:state");
    }

    #[test]
    fn test_state_key_keeps_delimiters_in_client_id() {
        let key = StateKey::new("svc", "tenant:42");
        assert_eq!(key.to_store_key(), "svc:tenant:42:state");
    }

    #[test]
    fn test_encode_keeps_fractional_tokens() {
        let state = BucketState {
            tokens: 2.75,
            last_refill_at_ms: 1_704_067_200_123,
        };
        let encoded = state.encode().unwrap();

        assert_eq!(
            encoded,
            r#"{"tokens":2.75,"last_refill_at_ms":1704067200123}"#
        );
        assert_eq!(BucketState::decode(&encoded).unwrap(), state);
    }

    #[test]
    fn test_encoding_is_bit_exact() {
        for tokens in [0.9999999999999999, 0.1 + 0.2, 1.0 / 3.0, 4.000000000000001, 1e-300] {
            let state = BucketState {
                tokens,
                last_refill_at_ms: 1_700_000_000_000,
            };
            let decoded = BucketState::decode(&state.encode().unwrap()).unwrap();
            assert_eq!(
                decoded.tokens.to_bits(),
                tokens.to_bits(),
                "{} changed across encode/decode",
                tokens
            );
        }
    }

    #[test]
    fn test_encode_refuses_non_finite_balance() {
        for tokens in [f64::NAN, f64::INFINITY] {
            let state = BucketState {
                tokens,
                last_refill_at_ms: 0,
            };
            assert!(state.encode().is_err());
        }
    }

    #[test]
    fn test_full_bucket() {
        let state = BucketState::full(5, 1000);
        assert_eq!(state.tokens, 5.0);
        assert_eq!(state.last_refill_at_ms, 1000);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(BucketState::decode("not json").is_err());
        assert!(BucketState::decode(r#"{"tokens":1.0}"#).is_err());
        assert!(BucketState::decode(r#"{"tokens":-1.0,"last_refill_at_ms":0}"#).is_err());
    }
}
