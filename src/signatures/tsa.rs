//! In-process RFC 3161 timestamp authority.
//!
//! Issues tokens signed with a software key. Useful for tests, for the command-line
//! tool and for deployments that run their own TSA next to the signing service.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{TimeZone, Utc};
use der::asn1::{Int, ObjectIdentifier};
use der::Encode;
use x509_cert::ext::pkix::name::GeneralName;

use super::algorithms::{AlgorithmRegistry, DigestAlgorithm, DigestDescriptor, SignatureAlgorithm};
use super::envelope::{self, Accuracy, PkiStatusInfo, TimeStampResp, TstInfo, ID_CT_TST_INFO};
use super::signer::{ExternalSigner, SoftwareSigner};
use super::timestamp::{MessageImprint, TimestampAuthority, TimestampToken, VerifiedTimestamp};
use super::types::{CertificateChain, DigestInfo};
use super::verifier::SignatureVerifier;
use crate::config::DEFAULT_TIMESTAMP_POLICY;
use crate::error::{Error, Result};

const DEFAULT_POLICY: ObjectIdentifier = ObjectIdentifier::new_unwrap(DEFAULT_TIMESTAMP_POLICY);

/// Timestamp authority backed by a local key.
#[derive(Debug)]
pub struct LocalTimestampAuthority {
    signer: SoftwareSigner,
    chain: CertificateChain,
    policy: ObjectIdentifier,
    digest: DigestDescriptor,
    next_serial: AtomicU64,
    verifier: SignatureVerifier,
}

impl LocalTimestampAuthority {
    /// Create an authority signing with `signer` under `chain` (leaf first).
    pub fn new(
        signer: SoftwareSigner,
        chain: CertificateChain,
        registry: AlgorithmRegistry,
    ) -> Result<Self> {
        if chain.is_empty() {
            return Err(Error::InvalidArgument(
                "timestamp authority needs a certificate".to_string(),
            ));
        }
        registry.signature(SignatureAlgorithm::Sha256WithRsa)?;
        let digest = *registry.digest(DigestAlgorithm::Sha256)?;
        Ok(Self {
            signer,
            chain,
            policy: DEFAULT_POLICY,
            digest,
            next_serial: AtomicU64::new(1),
            verifier: SignatureVerifier::new(registry),
        })
    }

    /// Load the key and a PEM certificate chain from files.
    pub fn from_files(
        key_path: impl AsRef<Path>,
        chain_path: impl AsRef<Path>,
        registry: AlgorithmRegistry,
    ) -> Result<Self> {
        let signer = SoftwareSigner::from_file(key_path)?;
        let chain = CertificateChain::from_pem(&std::fs::read(chain_path.as_ref())?)?;
        Self::new(signer, chain, registry)
    }

    /// Set the policy OID stamped into tokens.
    pub fn with_policy(mut self, policy: &str) -> Result<Self> {
        self.policy = ObjectIdentifier::new(policy)
            .map_err(|e| Error::Configuration(format!("invalid TSA policy {}: {}", policy, e)))?;
        Ok(self)
    }

    /// Issue a token over `imprint`.
    pub fn issue(&self, imprint: &MessageImprint) -> Result<TimestampToken> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let gen_time = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .ok_or_else(|| Error::ExternalService("system clock out of range".to_string()))?;
        let leaf = self
            .chain
            .leaf()
            .ok_or_else(|| Error::InvalidArgument("timestamp authority needs a certificate".to_string()))?;

        let tst_info = TstInfo {
            version: 1,
            policy: self.policy,
            message_imprint: imprint.to_asn1()?,
            serial_number: Int::new(&serial_bytes(serial))?,
            gen_time: envelope::generalized_time(gen_time)?,
            accuracy: Some(Accuracy {
                seconds: Some(1),
                millis: None,
                micros: None,
            }),
            ordering: None,
            nonce: None,
            tsa: Some(GeneralName::DirectoryName(leaf.tbs_certificate.subject.clone())),
            extensions: None,
        };
        let tst_der = tst_info.to_der()?;

        let attrs = envelope::signed_attributes(
            ID_CT_TST_INFO,
            &self.digest.digest(&tst_der),
            &self.chain,
            Some(gen_time),
        )?;
        let digest_info = DigestInfo::new(
            self.digest.algorithm,
            envelope::signed_attributes_digest(&self.digest, &attrs)?,
        );
        let signature = self.signer.sign(SignatureAlgorithm::Sha256WithRsa, &digest_info)?;
        let signer_info =
            envelope::signer_info(&self.chain, SignatureAlgorithm::Sha256WithRsa, attrs, &signature)?;
        let signed_data =
            envelope::signed_data(ID_CT_TST_INFO, Some(&tst_der), &self.chain, vec![signer_info])?;

        log::debug!("Local TSA issued token serial {}", serial);
        TimestampToken::from_der(&envelope::encode_signed_data(&signed_data)?)
    }

    /// Issue a token and wrap it in a granted `TimeStampResp` (`.tsr`).
    pub fn respond(&self, imprint: &MessageImprint) -> Result<Vec<u8>> {
        let token = self.issue(imprint)?;
        let response = TimeStampResp {
            status: PkiStatusInfo {
                status: 0,
                status_string: None,
                fail_info: None,
            },
            time_stamp_token: Some(token.content_info()?),
        };
        Ok(response.to_der()?)
    }
}

impl TimestampAuthority for LocalTimestampAuthority {
    fn request(&self, imprint: &MessageImprint) -> Result<TimestampToken> {
        self.issue(imprint)
    }

    fn verify(&self, token: &TimestampToken, bound: Option<&[u8]>) -> Result<VerifiedTimestamp> {
        self.verifier.verify_timestamp(token, bound)
    }
}

/// Minimal two's-complement encoding of a positive serial.
fn serial_bytes(serial: u64) -> Vec<u8> {
    let bytes = serial.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    let mut out = bytes[start..].to_vec();
    if out[0] & 0x80 != 0 {
        out.insert(0, 0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoProvider;
    use crate::signatures::SecurityLevel;

    fn tsa() -> LocalTimestampAuthority {
        let registry = AlgorithmRegistry::new(&CryptoProvider::register());
        let signer =
            SoftwareSigner::from_der(include_bytes!("../../tests/fixtures/tsa.key.der")).unwrap();
        let chain =
            CertificateChain::from_pem(include_bytes!("../../tests/fixtures/tsa.crt.pem")).unwrap();
        LocalTimestampAuthority::new(signer, chain, registry).unwrap()
    }

    fn imprint(data: &[u8]) -> MessageImprint {
        MessageImprint {
            algorithm: DigestAlgorithm::Sha256,
            digest: envelope::sha256(data),
        }
    }

    #[test]
    fn test_serial_bytes() {
        assert_eq!(serial_bytes(0), vec![0]);
        assert_eq!(serial_bytes(1), vec![1]);
        assert_eq!(serial_bytes(0x80), vec![0, 0x80]);
        assert_eq!(serial_bytes(0x0102), vec![1, 2]);
    }

    #[test]
    fn test_issue_and_verify() {
        let tsa = tsa();
        let token = tsa.issue(&imprint(b"document")).unwrap();
        assert_eq!(token.imprint, imprint(b"document"));
        assert!(token.issuer.contains("Example Time Stamping Unit"));
        assert!((Utc::now() - token.gen_time).num_seconds().abs() < 60);

        let verified = tsa.verify(&token, Some(b"document")).unwrap();
        assert_eq!(verified.time, token.gen_time);
        assert_eq!(verified.level, SecurityLevel::Valid);
        assert!(matches!(
            tsa.verify(&token, Some(b"other document")),
            Err(Error::ExternalService(_))
        ));
    }

    #[test]
    fn test_signer_without_time_stamping_usage_rejected() {
        let registry = AlgorithmRegistry::new(&CryptoProvider::register());
        let signer =
            SoftwareSigner::from_der(include_bytes!("../../tests/fixtures/alice.key.der")).unwrap();
        let chain =
            CertificateChain::from_pem(include_bytes!("../../tests/fixtures/alice.crt.pem")).unwrap();
        let impostor = LocalTimestampAuthority::new(signer, chain, registry).unwrap();

        let token = impostor.issue(&imprint(b"document")).unwrap();
        assert!(matches!(
            impostor.verify(&token, Some(b"document")),
            Err(Error::ExternalService(_))
        ));
        assert!(tsa().verify(&token, Some(b"document")).is_err());
    }

    #[test]
    fn test_serials_increase() {
        let tsa = tsa();
        let first = tsa.issue(&imprint(b"a")).unwrap();
        let second = tsa.issue(&imprint(b"a")).unwrap();
        assert_ne!(first.serial, second.serial);
    }

    #[test]
    fn test_response_round_trip() {
        let tsa = tsa();
        let tsr = tsa.respond(&imprint(b"doc")).unwrap();
        let token = TimestampToken::from_response(&tsr).unwrap();
        assert_eq!(token.imprint, imprint(b"doc"));
    }

    #[test]
    fn test_invalid_policy() {
        assert!(matches!(tsa().with_policy("not an oid"), Err(Error::Configuration(_))));
        assert!(tsa().with_policy("1.3.6.1.4.1.99999.1").is_ok());
    }

    #[test]
    fn test_tampered_token_fails() {
        let tsa = tsa();
        let mut token = tsa.issue(&imprint(b"doc")).unwrap();
        let last = token.encoded.len() - 1;
        token.encoded[last] ^= 0x01;
        assert!(tsa.verify(&token, None).is_err());
    }
}
