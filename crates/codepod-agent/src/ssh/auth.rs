//! SSH authentication: shared token and CA-signed certificates

use russh::keys::ssh_key::{certificate::CertType, Certificate, Fingerprint, HashAlg, PublicKey};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Certificate rejection reasons
#[derive(Debug, Error)]
pub enum AuthError {
    /// The configured CA key text could not be parsed
    #[error("invalid CA public key: {0}")]
    InvalidCaKey(String),

    /// A host certificate was presented where a user certificate is required
    #[error("certificate is not a user certificate")]
    NotUserCertificate,

    /// Signature or validity-window check failed
    #[error("certificate validation failed: {0}")]
    Invalid(String),

    /// The requested user is not among the certificate principals
    #[error("user '{user}' is not a valid principal")]
    PrincipalMismatch { user: String },
}

/// Constant-time token comparison
///
/// The fold touches every byte pair so equality of a prefix is not
/// observable through timing. Differing lengths short-circuit, which only
/// reveals the length. An empty configured token matches only an empty
/// password.
pub fn verify_token(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Trusted user CA for certificate authentication
pub struct CertificateAuthority {
    fingerprint: Fingerprint,
}

impl CertificateAuthority {
    /// Parse an OpenSSH-format public key ("ssh-ed25519 AAAA... comment")
    pub fn parse(text: &str) -> Result<Self, AuthError> {
        let key =
            PublicKey::from_openssh(text.trim()).map_err(|e| AuthError::InvalidCaKey(e.to_string()))?;
        Ok(Self {
            fingerprint: key.fingerprint(HashAlg::Sha256),
        })
    }

    /// Verify a presented certificate for `user` at the current time
    pub fn verify(&self, certificate: &Certificate, user: &str) -> Result<(), AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.verify_at(certificate, user, now)
    }

    /// Verify a presented certificate for `user` at `unix_time`
    ///
    /// Checks, in order: certificate type, CA signature against the trusted
    /// fingerprint plus the validity window, and principal membership.
    pub fn verify_at(
        &self,
        certificate: &Certificate,
        user: &str,
        unix_time: u64,
    ) -> Result<(), AuthError> {
        if certificate.cert_type() != CertType::User {
            return Err(AuthError::NotUserCertificate);
        }

        certificate
            .validate_at(unix_time, [&self.fingerprint])
            .map_err(|e| AuthError::Invalid(e.to_string()))?;

        if !certificate.valid_principals().iter().any(|p| p == user) {
            return Err(AuthError::PrincipalMismatch {
                user: user.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::certificate::Builder;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, PrivateKey};

    #[test]
    fn test_verify_token_match() {
        assert!(verify_token(b"secret-token", b"secret-token"));
    }

    #[test]
    fn test_verify_token_mismatch() {
        assert!(!verify_token(b"secret-token", b"secret-tokeX"));
        assert!(!verify_token(b"short", b"longer-token"));
        assert!(!verify_token(b"", b"secret"));
    }

    #[test]
    fn test_empty_token_matches_empty_password_only() {
        assert!(verify_token(b"", b""));
        assert!(!verify_token(b"x", b""));
    }

    fn make_cert(
        ca: &PrivateKey,
        principal: &str,
        valid_after: u64,
        valid_before: u64,
    ) -> Certificate {
        let user_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            user_key.public_key().key_data().clone(),
            valid_after,
            valid_before,
        )
        .unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.valid_principal(principal).unwrap();
        builder.key_id("test-cert").unwrap();
        builder.sign(ca).unwrap()
    }

    fn ca_pair() -> (PrivateKey, CertificateAuthority) {
        let ca_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let ca_text = ca_key.public_key().to_openssh().unwrap();
        let authority = CertificateAuthority::parse(&ca_text).unwrap();
        (ca_key, authority)
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn test_valid_certificate_accepted() {
        let (ca_key, authority) = ca_pair();
        let cert = make_cert(&ca_key, "root", now() - 10, now() + 60);

        authority.verify_at(&cert, "root", now()).unwrap();
    }

    #[test]
    fn test_expired_certificate_rejected() {
        let (ca_key, authority) = ca_pair();
        let cert = make_cert(&ca_key, "root", now() - 120, now() - 60);

        let err = authority.verify_at(&cert, "root", now()).unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
    }

    #[test]
    fn test_wrong_principal_rejected() {
        let (ca_key, authority) = ca_pair();
        let cert = make_cert(&ca_key, "alice", now() - 10, now() + 60);

        let err = authority.verify_at(&cert, "root", now()).unwrap_err();
        assert!(matches!(err, AuthError::PrincipalMismatch { .. }));
    }

    #[test]
    fn test_cert_from_untrusted_ca_rejected() {
        let (_, authority) = ca_pair();
        let rogue_ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = make_cert(&rogue_ca, "root", now() - 10, now() + 60);

        let err = authority.verify_at(&cert, "root", now()).unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
    }

    #[test]
    fn test_parse_garbage_ca_key() {
        assert!(matches!(
            CertificateAuthority::parse("not a key"),
            Err(AuthError::InvalidCaKey(_))
        ));
    }
}
