//! Typed filter chain applied to a resolved identity field before it is
//! forwarded as a header or query parameter.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::io::Write as _;

use crate::{Error, Result};

/// The shape of a value flowing through the filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Binary,
}

/// A value carried through the pipeline, tagged with its current type.
#[derive(Debug, Clone)]
pub enum FilterOutput {
    String(String),
    Binary(Vec<u8>),
}

impl FilterOutput {
    fn value_type(&self) -> ValueType {
        match self {
            FilterOutput::String(_) => ValueType::String,
            FilterOutput::Binary(_) => ValueType::Binary,
        }
    }

    fn as_bytes(&self) -> Vec<u8> {
        match self {
            FilterOutput::String(s) => s.as_bytes().to_vec(),
            FilterOutput::Binary(b) => b.clone(),
        }
    }
}

/// One step in a filter chain, as configured under `forwarding.*.filters`.
#[derive(Debug, Clone)]
pub enum FilterSpec {
    /// AES-256-GCM with a caller-provided key (>= 32 bytes). Nonce is
    /// prepended to the ciphertext. Accepts `String|Binary`, yields `Binary`.
    Encrypt { key: Vec<u8> },
    /// gzip. Accepts `String|Binary`, yields `Binary`.
    Zip,
    /// Standard base64. Accepts `Binary`, yields `String`.
    Base64,
}

impl FilterSpec {
    fn input_type(&self) -> Option<ValueType> {
        match self {
            FilterSpec::Encrypt { .. } | FilterSpec::Zip => None, // accepts either
            FilterSpec::Base64 => Some(ValueType::Binary),
        }
    }

    fn output_type(&self) -> ValueType {
        match self {
            FilterSpec::Encrypt { .. } | FilterSpec::Zip => ValueType::Binary,
            FilterSpec::Base64 => ValueType::String,
        }
    }

    fn apply(&self, input: FilterOutput) -> Result<FilterOutput> {
        if let Some(expected) = self.input_type() {
            if input.value_type() != expected {
                return Err(Error::ConfigInvalid(format!(
                    "filter expects {expected:?} input, got {:?}",
                    input.value_type()
                )));
            }
        }
        match self {
            FilterSpec::Encrypt { key } => {
                if key.len() < 32 {
                    return Err(Error::ConfigInvalid("encrypt filter key must be >= 32 bytes".into()));
                }
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..32]));
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let ciphertext = cipher
                    .encrypt(&nonce, input.as_bytes().as_slice())
                    .map_err(|e| Error::Internal(format!("encrypt filter: {e}")))?;
                let mut out = nonce.to_vec();
                out.extend(ciphertext);
                Ok(FilterOutput::Binary(out))
            }
            FilterSpec::Zip => {
                use flate2::Compression;
                use flate2::write::GzEncoder;
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&input.as_bytes())
                    .map_err(|e| Error::Internal(format!("zip filter: {e}")))?;
                let out = encoder
                    .finish()
                    .map_err(|e| Error::Internal(format!("zip filter: {e}")))?;
                Ok(FilterOutput::Binary(out))
            }
            FilterSpec::Base64 => Ok(FilterOutput::String(BASE64.encode(input.as_bytes()))),
        }
    }
}

/// Run `value` through `filters` left to right; if the final output is
/// `Binary`, a `base64` filter is appended automatically so the result is
/// always representable as a header/query string.
pub fn run_pipeline(value: &str, filters: &[FilterSpec]) -> Result<String> {
    let mut current = FilterOutput::String(value.to_string());
    for filter in filters {
        current = filter.apply(current)?;
    }
    if current.value_type() == ValueType::Binary {
        current = FilterSpec::Base64.apply(current)?;
    }
    match current {
        FilterOutput::String(s) => Ok(s),
        FilterOutput::Binary(_) => unreachable!("auto-base64 above guarantees String"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_filters_passes_value_through_unchanged() {
        assert_eq!(run_pipeline("hello", &[]).unwrap(), "hello");
    }

    #[test]
    fn zip_then_auto_base64_roundtrips_through_gzip() {
        let encoded = run_pipeline("hello world", &[FilterSpec::Zip]).unwrap();
        let compressed = BASE64.decode(encoded).unwrap();
        use std::io::Read;
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, "hello world");
    }

    #[test]
    fn encrypt_then_auto_base64_roundtrips() {
        let key = vec![7u8; 32];
        let encoded = run_pipeline("secret", &[FilterSpec::Encrypt { key: key.clone() }]).unwrap();
        let raw = BASE64.decode(encoded).unwrap();
        let (nonce_bytes, ciphertext) = raw.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce_bytes), ciphertext)
            .unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[test]
    fn encrypt_rejects_short_keys() {
        let result = run_pipeline("x", &[FilterSpec::Encrypt { key: vec![1u8; 16] }]);
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn base64_as_first_filter_is_a_type_error() {
        // The pipeline starts as String; base64 requires Binary input.
        let result = run_pipeline("x", &[FilterSpec::Base64]);
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }
}
