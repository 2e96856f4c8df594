//! HMAC-SHA256 signatures for cookie values.
//!
//! A signed value is `value.signature`, the signature being the URL-safe
//! base64 of `HMAC-SHA256(secret, value)`. Checks run in constant time.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8], value: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(value);
    mac
}

pub(crate) fn signature(secret: &[u8], value: &str) -> String {
    URL_SAFE_NO_PAD.encode(mac(secret, value.as_bytes()).finalize().into_bytes())
}

/// Constant-time check of a detached signature.
pub(crate) fn verify_signature(secret: &[u8], value: &str, signature: &str) -> bool {
    let Ok(expected) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };
    mac(secret, value.as_bytes()).verify_slice(&expected).is_ok()
}

pub(crate) fn sign(secret: &[u8], value: &str) -> String {
    format!("{value}.{}", signature(secret, value))
}

/// The value, if `signed` carries a valid signature for it.
pub(crate) fn unsign<'a>(secret: &[u8], signed: &'a str) -> Option<&'a str> {
    let (value, sig) = signed.rsplit_once('.')?;
    verify_signature(secret, value, sig).then_some(value)
}

/// `len` random bytes, URL-safe base64 encoded.
pub(crate) fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_values_round_trip() {
        let signed = sign(b"secret", "hello");
        assert_eq!(unsign(b"secret", &signed), Some("hello"));
    }

    #[test]
    fn tampering_is_detected() {
        let signed = sign(b"secret", "hello");
        assert_eq!(unsign(b"other", &signed), None);
        assert_eq!(unsign(b"secret", &signed.replace("hello", "jello")), None);
        assert_eq!(unsign(b"secret", "womp.signature"), None);
        assert_eq!(unsign(b"secret", "no-dot"), None);
    }

    #[test]
    fn random_tokens_differ() {
        assert_ne!(random_token(18), random_token(18));
        assert_eq!(random_token(18).len(), 24);
    }
}
