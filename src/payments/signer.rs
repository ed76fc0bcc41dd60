//! Canonical signing of gateway parameters.
//!
//! Both directions of the gateway protocol go through this module: the
//! outbound redirect is signed with [`Signer::sign_params`] and the inbound
//! callback is checked with [`Signer::verify_params`]. Keeping a single
//! canonicalization routine is what lets the two sides agree byte-for-byte.
//!
//! Canonical form:
//! 1. entries whose value is absent or empty are dropped,
//! 2. keys are sorted by byte value,
//! 3. keys and values are encoded as `application/x-www-form-urlencoded`
//!    (space becomes `+`, everything outside `A-Za-z0-9*-._` is percent-encoded),
//! 4. pairs are joined as `key=value` with `&`.
//!
//! The tag is HMAC-SHA512 over the UTF-8 bytes of that string, rendered as
//! uppercase hex.

use crate::payments::error::{PaymentError, PaymentResult};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use url::form_urlencoded;

type HmacSha512 = Hmac<Sha512>;

/// Value of the signature-type field appended after signing
pub const SIGNATURE_TYPE: &str = "SHA512";

/// A closed parameter record that knows which of its fields are signed.
///
/// Values are `None` when the field is not present; the canonicalizer drops
/// those along with empty strings.
pub trait SignableParams {
    fn signing_pairs(&self) -> Vec<(String, Option<String>)>;
}

/// Canonical string plus its tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedParams {
    pub canonical: String,
    pub signature: String,
}

pub fn encode_component(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Build the canonical signing string
pub fn canonicalize<K, V, I>(pairs: I) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
    I: IntoIterator<Item = (K, Option<V>)>,
{
    let mut kept: Vec<(String, String)> = pairs
        .into_iter()
        .filter_map(|(key, value)| {
            let value = value?;
            if value.as_ref().is_empty() {
                return None;
            }
            Some((key.as_ref().to_string(), value.as_ref().to_string()))
        })
        .collect();

    kept.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    kept.iter()
        .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Keyed signer built from the gateway's shared secret
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha512,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").field("secret", &"<redacted>").finish()
    }
}

impl Signer {
    pub fn new(secret: &str) -> PaymentResult<Self> {
        if secret.trim().is_empty() {
            return Err(PaymentError::ConfigurationError {
                message: "gateway hash secret is not configured".to_string(),
            });
        }
        let mac = HmacSha512::new_from_slice(secret.as_bytes()).map_err(|e| {
            PaymentError::ConfigurationError {
                message: format!("invalid gateway hash secret: {}", e),
            }
        })?;
        Ok(Self { mac })
    }

    /// Uppercase hex HMAC-SHA512 of `canonical`
    pub fn sign(&self, canonical: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(canonical.as_bytes());
        hex::encode_upper(mac.finalize().into_bytes())
    }

    pub fn sign_params<P: SignableParams + ?Sized>(&self, params: &P) -> SignedParams {
        let canonical = canonicalize(params.signing_pairs());
        let signature = self.sign(&canonical);
        SignedParams {
            canonical,
            signature,
        }
    }

    /// Recompute the tag and compare it in constant time against `supplied`.
    /// Hex case in the supplied value is not significant.
    pub fn verify(&self, canonical: &str, supplied: &str) -> bool {
        let expected = self.sign(canonical);
        let supplied = supplied.trim().to_ascii_uppercase();
        secure_eq(expected.as_bytes(), supplied.as_bytes())
    }

    /// Returns the recomputed signature alongside the verdict so callers can
    /// log both sides of a mismatch.
    pub fn verify_params<P: SignableParams + ?Sized>(
        &self,
        params: &P,
        supplied: &str,
    ) -> (bool, SignedParams) {
        let signed = self.sign_params(params);
        let supplied = supplied.trim().to_ascii_uppercase();
        let valid = secure_eq(signed.signature.as_bytes(), supplied.as_bytes());
        (valid, signed)
    }
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
