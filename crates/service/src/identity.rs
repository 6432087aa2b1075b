use std::path::Path;

use codec::crypto::{self, SigningKey, VerifyingKey, pkcs8::DecodePrivateKey};
use x509_parser::prelude::{FromDer, X509Certificate, parse_x509_pem};

#[derive(Debug)]
pub enum IdentityError {
    Io(std::io::Error),
    /// The certificate bytes did not parse as X.509.
    BadCertificate,
    /// The private key bytes did not parse as a PKCS#8 P-256 key.
    BadKey,
    /// The private key does not match the certificate's public key.
    KeyMismatch,
}

impl std::error::Error for IdentityError {}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for IdentityError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// This node's identity: its signature certificate and the matching
/// private key. Loaded once at startup; read-only afterwards.
pub struct Identity {
    certificate: Vec<u8>,
    hash: [u8; 32],
    key: SigningKey,
}

impl Identity {
    pub fn new(certificate: Vec<u8>, key: SigningKey) -> Result<Self, IdentityError> {
        let (_, parsed) =
            X509Certificate::from_der(&certificate).map_err(|_| IdentityError::BadCertificate)?;

        let public = VerifyingKey::from_sec1_bytes(&parsed.public_key().subject_public_key.data)
            .map_err(|_| IdentityError::BadCertificate)?;
        if public != VerifyingKey::from(&key) {
            return Err(IdentityError::KeyMismatch);
        }

        let hash = crypto::sha256(&certificate);
        Ok(Self {
            certificate,
            hash,
            key,
        })
    }

    /// Load from files. Both PEM and DER are accepted; the key must be
    /// PKCS#8.
    pub fn from_files<P: AsRef<Path>>(certificate: P, key: P) -> Result<Self, IdentityError> {
        let cert_bytes = std::fs::read(certificate)?;
        let cert_der = if cert_bytes.starts_with(b"-----") {
            let (_, pem) =
                parse_x509_pem(&cert_bytes).map_err(|_| IdentityError::BadCertificate)?;
            pem.contents
        } else {
            cert_bytes
        };

        let key_bytes = std::fs::read(key)?;
        let key = if key_bytes.starts_with(b"-----") {
            let pem = String::from_utf8(key_bytes).map_err(|_| IdentityError::BadKey)?;
            SigningKey::from_pkcs8_pem(&pem).map_err(|_| IdentityError::BadKey)?
        } else {
            SigningKey::from_pkcs8_der(&key_bytes).map_err(|_| IdentityError::BadKey)?
        };

        Self::new(cert_der, key)
    }

    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// SHA-256 of the certificate DER; the value peers use in contact
    /// lookups.
    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        crypto::sign(&self.key, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_and_key_must_match() {
        let first = rcgen::generate_simple_self_signed(vec!["a.example".to_string()]).unwrap();
        let second = rcgen::generate_simple_self_signed(vec!["b.example".to_string()]).unwrap();

        let key = SigningKey::from_pkcs8_der(&first.key_pair.serialize_der()).unwrap();
        assert!(Identity::new(first.cert.der().to_vec(), key.clone()).is_ok());
        assert!(matches!(
            Identity::new(second.cert.der().to_vec(), key),
            Err(IdentityError::KeyMismatch)
        ));
    }

    #[test]
    fn signatures_verify_against_the_certificate() {
        let generated =
            rcgen::generate_simple_self_signed(vec!["node.example".to_string()]).unwrap();
        let key = SigningKey::from_pkcs8_der(&generated.key_pair.serialize_der()).unwrap();
        let identity = Identity::new(generated.cert.der().to_vec(), key).unwrap();

        let signature = identity.sign(b"message");
        let verifying = crate::validate::verifying_key(identity.certificate()).unwrap();
        assert!(crypto::verify(&verifying, b"message", &signature).is_ok());
    }
}
