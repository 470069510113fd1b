//! Webhook authentication: hex HMAC-SHA512 of the raw body, keyed by the
//! gateway secret, carried in `x-paystack-signature`.

use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::errors::ServiceError;

pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

type HmacSha512 = Hmac<Sha512>;

pub fn sign(secret: &str, body: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid HMAC key: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of `signature` against the body. Fails closed on a
/// missing, malformed or mismatched signature.
pub fn verify(secret: &str, body: &[u8], signature: Option<&str>) -> Result<(), ServiceError> {
    let provided = signature
        .map(str::trim)
        .and_then(|s| hex::decode(s).ok())
        .ok_or(ServiceError::UnauthorizedWebhook)?;

    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid HMAC key: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| ServiceError::UnauthorizedWebhook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SECRET: &str = "sk_test_webhook";

    #[test]
    fn accepts_own_signature() {
        let body = br#"{"event":"charge.success"}"#;
        let sig = sign(SECRET, body).unwrap();
        assert_eq!(sig.len(), 128);
        assert!(verify(SECRET, body, Some(&sig)).is_ok());
        assert!(verify(SECRET, body, Some(&sig.to_uppercase())).is_ok());
    }

    #[test]
    fn rejects_tampering() {
        let body = br#"{"event":"charge.success","data":{"amount":350000}}"#;
        let sig = sign(SECRET, body).unwrap();
        let tampered = br#"{"event":"charge.success","data":{"amount":100}}"#;

        assert_matches!(
            verify(SECRET, tampered, Some(&sig)),
            Err(ServiceError::UnauthorizedWebhook)
        );
        assert_matches!(
            verify("other", body, Some(&sig)),
            Err(ServiceError::UnauthorizedWebhook)
        );
        assert_matches!(verify(SECRET, body, None), Err(ServiceError::UnauthorizedWebhook));
        assert_matches!(
            verify(SECRET, body, Some("not-hex")),
            Err(ServiceError::UnauthorizedWebhook)
        );
    }
}
