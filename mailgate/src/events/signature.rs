//! HMAC-SHA256 webhook signatures.
//!
//! Forwarded events are signed with the receiving subscription's secret and
//! carry the hex digest in `X-Webhook-Signature`. The same check is offered
//! for inbound provider webhooks when a signing secret is configured.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Optional scheme prefix accepted on incoming signatures.
const SCHEME_PREFIX: &str = "sha256=";

fn mac_for(secret: &str) -> HmacSha256 {
    // HMAC accepts keys of any length, including empty.
    HmacSha256::new_from_slice(secret.as_bytes()).unwrap_or_else(|_| unreachable!())
}

/// Hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let mut mac = mac_for(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature in constant time.
///
/// Accepts an optional `sha256=` prefix. Anything that is not valid hex fails.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix(SCHEME_PREFIX).unwrap_or(signature);

    if signature.is_empty() {
        warn!("webhook_signature_missing");
        return false;
    }

    let expected = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!(signature_length = signature.len(), "webhook_signature_not_hex");
            return false;
        }
    };

    let mut mac = mac_for(secret);
    mac.update(payload);
    let valid = mac.verify_slice(&expected).is_ok();

    if !valid {
        warn!(signature_length = signature.len(), "webhook_signature_mismatch");
    }

    valid
}

/// Whether inbound signature enforcement is switched on.
pub fn is_signature_verification_enabled(secret: &Option<String>) -> bool {
    secret
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_known_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            sign_payload(b"what do ya want for nothing?", "Jefe"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_round_trip() {
        let payload = br#"{"event":"delivered"}"#;
        let sig = sign_payload(payload, "whsec_abc");
        assert!(verify_signature(payload, &sig, "whsec_abc"));
        assert!(verify_signature(payload, &format!("sha256={}", sig), "whsec_abc"));
        assert!(verify_signature(payload, &sig.to_uppercase(), "whsec_abc"));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let payload = br#"{"event":"delivered"}"#;
        let sig = sign_payload(payload, "whsec_abc");
        assert!(!verify_signature(br#"{"event":"bounced"}"#, &sig, "whsec_abc"));
        assert!(!verify_signature(payload, &sig, "whsec_other"));
        assert!(!verify_signature(payload, &sig[..10], "whsec_abc"));
    }

    #[test]
    fn test_verify_rejects_any_flipped_byte() {
        let cases: [(&[u8], &str); 3] = [
            (br#"{"event":"delivered"}"#, "whsec_abc"),
            (b"", "k"),
            (b"what do ya want for nothing?", "Jefe"),
        ];
        for (payload, secret) in cases {
            let sig = hex::decode(sign_payload(payload, secret)).unwrap();
            for i in 0..sig.len() {
                let mut flipped = sig.clone();
                flipped[i] ^= 0x01;
                assert!(
                    !verify_signature(payload, &hex::encode(&flipped), secret),
                    "byte {} flipped still verified",
                    i
                );
            }
        }
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(!verify_signature(b"x", "", "secret"));
        assert!(!verify_signature(b"x", "not-hex-at-all", "secret"));
        assert!(!verify_signature(b"x", "sha256=", "secret"));
    }

    #[test]
    fn test_is_signature_verification_enabled() {
        assert!(!is_signature_verification_enabled(&None));
        assert!(!is_signature_verification_enabled(&Some("".to_string())));
        assert!(!is_signature_verification_enabled(&Some("   ".to_string())));
        assert!(is_signature_verification_enabled(&Some("key123".to_string())));
    }
}
