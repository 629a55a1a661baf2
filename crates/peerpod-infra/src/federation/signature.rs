//! Message signatures
//!
//! Every outbound body is signed with HMAC-SHA256 keyed by the shared secret agreed
//! with the receiving pod at handshake. The header value is `v1=<hex digest>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use peerpod_core::constants::SIGNATURE_VERSION;
use peerpod_core::AppError;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &str) -> Result<HmacSha256, AppError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("Invalid shared secret: {}", e)))
}

/// Signature header value for `body`.
pub fn sign(body: &[u8], secret: &str) -> Result<String, AppError> {
    let mut mac = mac_for(secret)?;
    mac.update(body);
    Ok(format!(
        "{}={}",
        SIGNATURE_VERSION,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a signature header against `body`. The digest comparison is constant time.
pub fn verify(body: &[u8], secret: &str, header: &str) -> Result<(), AppError> {
    let digest = header
        .strip_prefix(SIGNATURE_VERSION)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| AppError::Unauthorized("Unsupported signature format".to_string()))?;

    let digest = hex::decode(digest)
        .map_err(|_| AppError::Unauthorized("Signature is not valid hex".to_string()))?;

    let mut mac = mac_for(secret)?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| AppError::Unauthorized("Signature mismatch".to_string()))
}
