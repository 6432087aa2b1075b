use codec::crypto::{self, VerifyingKey};
use x509_parser::oid_registry::OID_SIG_ECDSA_WITH_SHA256;
use x509_parser::prelude::{CertificateRevocationList, FromDer, X509Certificate, parse_x509_pem};

#[derive(Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// The presented bytes did not parse as an X.509 certificate.
    Parse,
    /// The certificate is outside its validity window.
    Expired,
    /// No configured authority matches the certificate's issuer.
    UnknownIssuer,
    /// The issuer was found but the chain signature did not verify, or the
    /// signature algorithm is not supported.
    BadSignature,
    /// A loaded CRL lists the certificate as revoked.
    Revoked,
}

impl std::error::Error for ValidationError {}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How presented certificates are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMethod {
    /// X.509 chain validation against the authority store, then the
    /// revocation policy.
    #[default]
    Default,
    /// Accept any parseable certificate.
    None,
}

/// Which certificates of the chain are checked against the loaded CRLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevocationPolicy {
    #[default]
    None,
    /// Only the presented (leaf) certificate.
    Last,
    /// Every certificate of the chain.
    All,
}

/// The authority store and validation policy. Built once at startup and
/// read-only afterwards, so it can be consulted from anywhere.
pub struct Validator {
    method: ValidationMethod,
    policy: RevocationPolicy,
    authorities: Vec<Vec<u8>>,
    crls: Vec<Vec<u8>>,
}

impl Validator {
    pub fn new(method: ValidationMethod, policy: RevocationPolicy) -> Self {
        Self {
            method,
            policy,
            authorities: Vec::new(),
            crls: Vec::new(),
        }
    }

    /// Accept-everything validator.
    pub fn open() -> Self {
        Self::new(ValidationMethod::None, RevocationPolicy::None)
    }

    pub fn add_authority(&mut self, der: Vec<u8>) -> Result<(), ValidationError> {
        X509Certificate::from_der(&der).map_err(|_| ValidationError::Parse)?;
        self.authorities.push(der);
        Ok(())
    }

    pub fn add_crl(&mut self, der: Vec<u8>) -> Result<(), ValidationError> {
        CertificateRevocationList::from_der(&der).map_err(|_| ValidationError::Parse)?;
        self.crls.push(der);
        Ok(())
    }

    /// Load a PEM bundle of CA certificates.
    pub fn add_authority_bundle(&mut self, pem: &[u8]) -> Result<usize, ValidationError> {
        let mut count = 0;
        let mut rest = pem;
        while let Ok((remaining, parsed)) = parse_x509_pem(rest) {
            self.add_authority(parsed.contents)?;
            count += 1;
            rest = remaining;
            if rest.is_empty() {
                break;
            }
        }

        if count == 0 {
            return Err(ValidationError::Parse);
        }

        Ok(count)
    }

    /// Validate one presented certificate according to the configured
    /// method and revocation policy.
    pub fn verify(&self, der: &[u8]) -> Result<(), ValidationError> {
        let (_, certificate) =
            X509Certificate::from_der(der).map_err(|_| ValidationError::Parse)?;

        if !certificate.validity().is_valid() {
            return Err(ValidationError::Expired);
        }

        if self.method == ValidationMethod::None {
            return Ok(());
        }

        // An exact store match is trusted directly (pinned or self-signed
        // roots); otherwise an authority must vouch for the issuer.
        let issuer = if self.authorities.iter().any(|a| a == der) {
            None
        } else {
            Some(self.find_issuer(&certificate)?)
        };

        match self.policy {
            RevocationPolicy::None => {}
            RevocationPolicy::Last => self.check_revocation(&certificate)?,
            RevocationPolicy::All => {
                self.check_revocation(&certificate)?;
                if let Some(issuer_der) = issuer {
                    let (_, issuer) = X509Certificate::from_der(issuer_der)
                        .map_err(|_| ValidationError::Parse)?;
                    self.check_revocation(&issuer)?;
                }
            }
        }

        Ok(())
    }

    fn find_issuer(&self, certificate: &X509Certificate<'_>) -> Result<&[u8], ValidationError> {
        if certificate.signature_algorithm.algorithm != OID_SIG_ECDSA_WITH_SHA256 {
            return Err(ValidationError::BadSignature);
        }

        let mut found = false;
        for der in &self.authorities {
            let Ok((_, authority)) = X509Certificate::from_der(der) else {
                continue;
            };

            if authority.subject().as_raw() != certificate.issuer().as_raw() {
                continue;
            }

            found = true;
            let Ok(key) =
                VerifyingKey::from_sec1_bytes(&authority.public_key().subject_public_key.data)
            else {
                continue;
            };

            if crypto::verify(
                &key,
                certificate.tbs_certificate.as_ref(),
                &certificate.signature_value.data,
            )
            .is_ok()
            {
                return Ok(der);
            }
        }

        Err(if found {
            ValidationError::BadSignature
        } else {
            ValidationError::UnknownIssuer
        })
    }

    fn check_revocation(&self, certificate: &X509Certificate<'_>) -> Result<(), ValidationError> {
        for der in &self.crls {
            let Ok((_, crl)) = CertificateRevocationList::from_der(der) else {
                continue;
            };

            if crl.issuer().as_raw() != certificate.issuer().as_raw() {
                continue;
            }

            for revoked in crl.iter_revoked_certificates() {
                if revoked.raw_serial() == certificate.tbs_certificate.raw_serial() {
                    return Err(ValidationError::Revoked);
                }
            }
        }

        Ok(())
    }
}

/// The verifying key embedded in a certificate, for handshake signature
/// checks.
pub fn verifying_key(der: &[u8]) -> Result<VerifyingKey, ValidationError> {
    let (_, certificate) = X509Certificate::from_der(der).map_err(|_| ValidationError::Parse)?;
    VerifyingKey::from_sec1_bytes(&certificate.public_key().subject_public_key.data)
        .map_err(|_| ValidationError::Parse)
}

/// Normalize certificate bytes to DER, accepting a PEM wrapper.
pub fn certificate_der(bytes: &[u8]) -> Result<Vec<u8>, ValidationError> {
    let der = if bytes.starts_with(b"-----") {
        let (_, pem) = parse_x509_pem(bytes).map_err(|_| ValidationError::Parse)?;
        pem.contents
    } else {
        bytes.to_vec()
    };

    X509Certificate::from_der(&der).map_err(|_| ValidationError::Parse)?;
    Ok(der)
}

/// The certificate's subject, for log lines.
pub fn subject(der: &[u8]) -> String {
    match X509Certificate::from_der(der) {
        Ok((_, certificate)) => certificate.subject().to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}
