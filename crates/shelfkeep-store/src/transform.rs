//! Reversible text transform applied to payloads before chunking.
//!
//! encode: UTF-8 bytes → XOR with repeating key → +1 per byte (wrapping) → base64
//! decode: base64 → -1 per byte (wrapping) → XOR with repeating key → UTF-8
//!
//! This is obfuscation only. It offers no confidentiality against anyone who
//! holds the key or bothers to recover it, and no integrity protection at all.

use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::StoreError;

/// Key used when the configuration does not supply one.
pub const DEFAULT_OBFUSCATION_KEY: &str = "shelfkeep-local-catalog";

/// Repeating key for the XOR stream. Never empty.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ObfuscationKey(Vec<u8>);

impl std::fmt::Debug for ObfuscationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObfuscationKey([REDACTED])")
    }
}

impl ObfuscationKey {
    /// Build a key from raw bytes. An empty key is rejected.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, StoreError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(StoreError::Validation(
                "obfuscation key must not be empty".to_string(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for ObfuscationKey {
    fn default() -> Self {
        Self(DEFAULT_OBFUSCATION_KEY.as_bytes().to_vec())
    }
}

/// XOR each byte with the key byte at the same position modulo key length.
/// Applying it twice with the same key returns the input.
pub fn xor_stream(data: &[u8], key: &ObfuscationKey) -> Vec<u8> {
    data.iter()
        .zip(key.0.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

/// Add 1 to every byte, wrapping at 256.
pub fn shift_up(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b = b.wrapping_add(1);
    }
}

/// Subtract 1 from every byte, wrapping at 0.
pub fn shift_down(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b = b.wrapping_sub(1);
    }
}

/// Obfuscating transform bound to a key.
#[derive(Debug, Clone, Default)]
pub struct ReversibleTransform {
    key: ObfuscationKey,
}

impl ReversibleTransform {
    /// Create a transform using `key`
    pub fn new(key: ObfuscationKey) -> Self {
        Self { key }
    }

    /// Obfuscate `plaintext` into a base64 token. Infallible.
    pub fn encode(&self, plaintext: &str) -> String {
        let mut bytes = xor_stream(plaintext.as_bytes(), &self.key);
        shift_up(&mut bytes);
        STANDARD.encode(bytes)
    }

    /// Reverse [`encode`](Self::encode). Fails with `Decode` on a malformed
    /// token or when the recovered bytes are not UTF-8 (usually a wrong key).
    pub fn decode(&self, token: &str) -> Result<String, StoreError> {
        let mut bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| StoreError::Decode(format!("invalid base64: {e}")))?;
        shift_down(&mut bytes);
        let plain = xor_stream(&bytes, &self.key);
        String::from_utf8(plain)
            .map_err(|e| StoreError::Decode(format!("payload is not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> ObfuscationKey {
        ObfuscationKey::new(b"k3y".to_vec()).unwrap()
    }

    proptest! {
        #[test]
        fn prop_roundtrip(text in ".{0,2000}", key in prop::collection::vec(0u8..=255, 1..64)) {
            let t = ReversibleTransform::new(ObfuscationKey::new(key).unwrap());
            let token = t.encode(&text);
            prop_assert_eq!(t.decode(&token).unwrap(), text);
        }

        #[test]
        fn prop_xor_is_self_inverse(data in prop::collection::vec(0u8..=255, 0..4096)) {
            let key = test_key();
            prop_assert_eq!(xor_stream(&xor_stream(&data, &key), &key), data);
        }
    }

    #[test]
    fn empty_text_roundtrips() {
        let t = ReversibleTransform::default();
        assert_eq!(t.encode(""), "");
        assert_eq!(t.decode("").unwrap(), "");
    }

    #[test]
    fn shift_wraps_at_byte_boundary() {
        let mut data = vec![0u8, 254, 255];
        shift_up(&mut data);
        assert_eq!(data, vec![1, 255, 0]);
        shift_down(&mut data);
        assert_eq!(data, vec![0, 254, 255]);
    }

    #[test]
    fn token_is_not_plaintext() {
        let t = ReversibleTransform::new(test_key());
        let token = t.encode(r#"[{"title":"Dune"}]"#);
        assert!(!token.contains("Dune"));
    }

    #[test]
    fn malformed_token_is_decode_error() {
        let t = ReversibleTransform::default();
        assert!(matches!(t.decode("not base64 !!"), Err(StoreError::Decode(_))));
    }

    #[test]
    fn wrong_key_yields_decode_error_or_different_text() {
        let t = ReversibleTransform::new(test_key());
        let token = t.encode("plain ascii catalog text");
        let other = ReversibleTransform::new(ObfuscationKey::new(b"other".to_vec()).unwrap());
        match other.decode(&token) {
            Ok(text) => assert_ne!(text, "plain ascii catalog text"),
            Err(e) => assert!(matches!(e, StoreError::Decode(_))),
        }
    }

    #[test]
    fn empty_key_rejected() {
        assert!(matches!(
            ObfuscationKey::new(Vec::new()),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn key_debug_is_redacted() {
        assert_eq!(format!("{:?}", test_key()), "ObfuscationKey([REDACTED])");
    }
}
