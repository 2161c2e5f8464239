// For signature verification
use hex::decode as hex_decode;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use tracing::{error, warn};

/// Verify a `<algorithm>=<hexdigest>` signature header against the raw body.
///
/// The digest is recomputed over the exact bytes received and compared in
/// constant time. A missing secret is treated as the empty key.
pub fn verify_hub_signature(secret: Option<&str>, payload: &[u8], signature_header: &str) -> bool {
    let Some((algorithm, digest)) = signature_header.trim().split_once('=') else {
        error!("Malformed signature header");
        return false;
    };

    let expected = match hex_decode(digest) {
        Ok(bytes) => bytes,
        Err(_) => {
            error!("Signature verification failed: digest is not hex");
            return false;
        }
    };

    let key = secret.unwrap_or_default().as_bytes();
    match algorithm.to_ascii_lowercase().as_str() {
        // Legacy `X-Hub-Signature` header; GitHub and Bitbucket Server still send it.
        "sha1" => verify_mac::<Hmac<Sha1>>(key, payload, &expected),
        "sha224" => verify_mac::<Hmac<Sha224>>(key, payload, &expected),
        "sha256" => verify_mac::<Hmac<Sha256>>(key, payload, &expected),
        "sha384" => verify_mac::<Hmac<Sha384>>(key, payload, &expected),
        "sha512" => verify_mac::<Hmac<Sha512>>(key, payload, &expected),
        other => {
            warn!("Unsupported signature algorithm {:?}", other);
            false
        }
    }
}

fn verify_mac<M: Mac + KeyInit>(key: &[u8], payload: &[u8], expected: &[u8]) -> bool {
    let mut mac = match <M as KeyInit>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    Mac::update(&mut mac, payload);
    mac.verify_slice(expected).is_ok()
}

/// Exact, constant-time comparison of a received token with the configured secret.
/// Both absent counts as a match; only one present does not.
pub fn tokens_match(received: Option<&str>, secret: Option<&str>) -> bool {
    match (received, secret) {
        (None, None) => true,
        (Some(received), Some(secret)) => bool::from(received.as_bytes().ct_eq(secret.as_bytes())),
        _ => false,
    }
}

/// Hex HMAC-SHA256 digest of `payload`, formatted the way GitHub sends it.
#[cfg(test)]
pub(crate) fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(secret.as_bytes()).unwrap();
    Mac::update(&mut mac, payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
