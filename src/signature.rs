//! GitHub webhook signature checks (`X-Hub-Signature-256`).
//!
//! The header carries `sha256=<hex>` where the hex is the HMAC-SHA256 of the raw
//! request body keyed with the shared webhook secret.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("webhook secret is not configured")]
    SecretNotConfigured,
    #[error("signature header missing")]
    Missing,
    #[error("signature does not match payload")]
    Mismatch,
}

/// Header value GitHub would send for `body` under `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC takes any key size");
    mac.update(body);
    format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Check `header` against the body. With no secret configured nothing passes.
pub fn verify(
    secret: Option<&SecretString>,
    header: Option<&str>,
    body: &[u8],
) -> Result<(), SignatureError> {
    let secret = secret.ok_or(SignatureError::SecretNotConfigured)?;
    let header = header.ok_or(SignatureError::Missing)?;

    let expected = sign(secret.expose_secret().as_bytes(), body);
    if constant_time_str_eq(&expected, header.trim()) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn constant_time_str_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
