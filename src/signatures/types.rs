//! Digital signature types and data structures.
//!
//! This module defines the values that flow through the signing pipeline and the
//! report returned by verification.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use der::asn1::OctetString;
use der::{Any, Decode, Encode, Sequence};
use serde::{Deserialize, Serialize};
use spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

use super::algorithms::{DigestAlgorithm, SignatureAlgorithm};
use super::level::SecurityLevel;
use super::phases::{Cms, VerifiedSignature};
use super::timestamp::{TimestampDisposition, VerifiedTimestamp};
use crate::error::{Error, Result};

/// Ordered X.509 certificate chain, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<Certificate>,
}

impl CertificateChain {
    /// Wrap already decoded certificates.
    pub fn new(certificates: Vec<Certificate>) -> Self {
        Self { certificates }
    }

    /// Decode a chain from individual DER certificates.
    pub fn from_der_certificates<I, B>(certificates: I) -> Result<Self>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let certificates = certificates
            .into_iter()
            .map(|der| {
                Certificate::from_der(der.as_ref())
                    .map_err(|e| Error::Encoding(format!("invalid certificate: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { certificates })
    }

    /// Decode a chain from concatenated PEM blocks.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let certificates = Certificate::load_pem_chain(pem)
            .map_err(|e| Error::Encoding(format!("invalid PEM certificate chain: {}", e)))?;
        Ok(Self { certificates })
    }

    /// Leaf (signer) certificate.
    pub fn leaf(&self) -> Option<&Certificate> {
        self.certificates.first()
    }

    /// All certificates, leaf first.
    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    /// Number of certificates.
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// DER encoding of every certificate, in chain order.
    pub fn to_der_certificates(&self) -> Result<Vec<Vec<u8>>> {
        self.certificates
            .iter()
            .map(|cert| cert.to_der().map_err(Error::from))
            .collect()
    }
}

/// Anything able to hand out the signer's certificate chain.
pub trait CertificateSource {
    /// Fetch the chain, leaf first.
    fn certificate_chain(&self) -> Result<CertificateChain>;
}

impl CertificateSource for CertificateChain {
    fn certificate_chain(&self) -> Result<CertificateChain> {
        Ok(self.clone())
    }
}

/// Certificate chain stored in a PEM file.
#[derive(Debug, Clone)]
pub struct PemFileSource {
    path: PathBuf,
}

impl PemFileSource {
    /// Read the chain from `path` on every request.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CertificateSource for PemFileSource {
    fn certificate_chain(&self) -> Result<CertificateChain> {
        log::debug!("Reading certificate chain from {}", self.path.display());
        let chain = CertificateChain::from_pem(&std::fs::read(&self.path)?)?;
        if chain.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} contains no certificates",
                self.path.display()
            )));
        }
        Ok(chain)
    }
}

/// PKCS#1 `DigestInfo ::= SEQUENCE { digestAlgorithm, digest }`.
#[derive(Sequence)]
struct DigestInfoAsn1 {
    algorithm: AlgorithmIdentifierOwned,
    digest: OctetString,
}

/// Digest handed to the external signer.
#[derive(Clone, PartialEq, Eq)]
pub struct DigestInfo {
    /// Digest algorithm
    pub algorithm: DigestAlgorithm,
    /// Raw digest bytes
    pub digest: Vec<u8>,
}

impl DigestInfo {
    /// Create a digest info.
    pub fn new(algorithm: DigestAlgorithm, digest: Vec<u8>) -> Self {
        Self { algorithm, digest }
    }

    /// DER encoding, the exact block a token performing raw `RSA_PKCS` signs.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let asn1 = DigestInfoAsn1 {
            algorithm: AlgorithmIdentifierOwned {
                oid: self.algorithm.oid(),
                parameters: Some(Any::null()),
            },
            digest: OctetString::new(self.digest.clone())?,
        };
        Ok(asn1.to_der()?)
    }
}

impl fmt::Debug for DigestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex: String = self.digest.iter().map(|b| format!("{:02x}", b)).collect();
        f.debug_struct("DigestInfo")
            .field("algorithm", &self.algorithm)
            .field("digest", &hex)
            .finish()
    }
}

/// Where signed content lives relative to the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignDisposition {
    /// Content travels separately
    #[default]
    Detached,
    /// Content is carried inside the SignedData
    Embedded,
}

impl SignDisposition {
    /// Upper-case name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignDisposition::Detached => "DETACHED",
            SignDisposition::Embedded => "EMBEDDED",
        }
    }
}

/// Verification report for one timestamp token.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampReport {
    /// How the token was attached
    pub disposition: TimestampDisposition,
    /// Verified token contents, when the token could be checked
    pub timestamp: Option<VerifiedTimestamp>,
    /// Level of the token signer, `Invalid` when the signature or imprint fails
    pub level: SecurityLevel,
    /// Diagnostics
    pub messages: Vec<String>,
}

impl TimestampReport {
    /// Token trusted time, when verified.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_ref().map(|t| t.time)
    }
}

/// Verification result for a single signer.
#[derive(Debug, Clone, Serialize)]
pub struct SignerVerification {
    /// Security level reached by this signer
    pub level: SecurityLevel,
    /// Signer certificate subject, when the certificate was found
    pub signer_subject: Option<String>,
    /// Recognized signature algorithm
    pub signature_algorithm: Option<SignatureAlgorithm>,
    /// Signing time from the signed attributes
    pub signing_time: Option<DateTime<Utc>>,
    /// Timestamp carried as an unsigned attribute of this signer
    pub attribute_timestamp: Option<TimestampReport>,
    /// Diagnostics
    pub messages: Vec<String>,
    /// Reconstructed phase chain, present when the signer could be decoded fully
    #[serde(skip)]
    pub signature: Option<VerifiedSignature<Cms>>,
}

impl SignerVerification {
    /// Report for a signer that has not passed any check yet.
    pub(crate) fn unverified() -> Self {
        Self {
            level: SecurityLevel::Invalid,
            signer_subject: None,
            signature_algorithm: None,
            signing_time: None,
            attribute_timestamp: None,
            messages: Vec::new(),
            signature: None,
        }
    }

    /// Lower the level and record why.
    pub fn downgrade(&mut self, level: SecurityLevel, message: impl Into<String>) {
        self.level = self.level.meet(level);
        self.messages.push(message.into());
    }
}

/// Result of verifying an envelope.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyInfo {
    /// Shape recognized while sniffing the envelope
    pub envelope: String,
    /// Per-signer results, in SignedData order
    pub signers: Vec<SignerVerification>,
    /// Enveloping and detached timestamps found outside the SignedData
    pub external_timestamps: Vec<TimestampReport>,
    /// Minimum level over every signer
    pub min_level: SecurityLevel,
    /// Whether the content was written to the output
    pub content_released: bool,
}

impl VerifyInfo {
    /// Render as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE_PEM: &[u8] = include_bytes!("../../tests/fixtures/alice.crt.pem");
    const CAROL_CHAIN_PEM: &[u8] = include_bytes!("../../tests/fixtures/carol-chain.pem");

    #[test]
    fn test_chain_from_pem() {
        let chain = CertificateChain::from_pem(CAROL_CHAIN_PEM).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain.leaf().is_some());

        let single = CertificateChain::from_pem(ALICE_PEM).unwrap();
        assert_eq!(single.len(), 1);
        let der = single.to_der_certificates().unwrap();
        let again = CertificateChain::from_der_certificates(&der).unwrap();
        assert_eq!(again, single);
    }

    #[test]
    fn test_chain_rejects_garbage() {
        let err = CertificateChain::from_der_certificates([b"not a certificate".to_vec()]);
        assert!(matches!(err, Err(Error::Encoding(_))));
    }

    #[test]
    fn test_pem_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.pem");
        std::fs::write(&path, CAROL_CHAIN_PEM).unwrap();
        let chain = PemFileSource::new(&path).certificate_chain().unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_digest_info_der_prefix() {
        let info = DigestInfo::new(DigestAlgorithm::Sha256, vec![0u8; 32]);
        let der = info.to_der().unwrap();
        // standard PKCS#1 v1.5 prefix for SHA-256
        let prefix: [u8; 19] = [
            0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
            0x01, 0x05, 0x00, 0x04, 0x20,
        ];
        assert_eq!(&der[..19], &prefix);
        assert_eq!(der.len(), 51);
    }

    #[test]
    fn test_signer_downgrade_only_lowers() {
        let mut signer = SignerVerification::unverified();
        assert_eq!(signer.level, SecurityLevel::Invalid);
        signer.level = SecurityLevel::Trusted;
        signer.downgrade(SecurityLevel::Valid, "not anchored");
        assert_eq!(signer.level, SecurityLevel::Valid);
        signer.downgrade(SecurityLevel::Trusted, "ignored");
        assert_eq!(signer.level, SecurityLevel::Valid);
        assert_eq!(signer.messages.len(), 2);
    }
}
