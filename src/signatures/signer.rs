//! Signing oracles.
//!
//! The pipeline never touches private keys. Between pre-sign and post-sign the caller
//! hands the [`DigestInfo`] to an [`ExternalSigner`] (a smart card, an HSM, a remote
//! service) and feeds the raw signature back. [`SoftwareSigner`] is the in-process
//! implementation used by the command-line tool, the local TSA and the tests.

use std::fmt;
use std::path::Path;

use pkcs1::DecodeRsaPrivateKey;
use pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};

use super::algorithms::SignatureAlgorithm;
use super::types::{CertificateChain, CertificateSource, DigestInfo};
use crate::error::{Error, Result};

/// Produces raw signature bytes over a digest.
pub trait ExternalSigner {
    /// Sign `digest_info` with `algorithm`, returning the raw signature value.
    fn sign(&self, algorithm: SignatureAlgorithm, digest_info: &DigestInfo) -> Result<Vec<u8>>;
}

/// RSA private key held in memory.
#[derive(Clone)]
pub struct SoftwareSigner {
    key: RsaPrivateKey,
}

impl SoftwareSigner {
    /// Wrap an RSA key.
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Load a PKCS#8 or PKCS#1 DER key.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_der(der)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(der))
            .map_err(|e| Error::Configuration(format!("unreadable RSA private key: {}", e)))?;
        Ok(Self { key })
    }

    /// Load a PKCS#8 PEM key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::Configuration(format!("unreadable RSA private key: {}", e)))?;
        Ok(Self { key })
    }

    /// Load a key file, PEM or DER.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        if data.starts_with(b"-----BEGIN") {
            let pem = String::from_utf8(data)
                .map_err(|_| Error::Configuration("PEM key is not UTF-8".to_string()))?;
            Self::from_pem(&pem)
        } else {
            Self::from_der(&data)
        }
    }

    /// Modulus size in bytes.
    pub fn key_size(&self) -> usize {
        rsa::traits::PublicKeyParts::size(&self.key)
    }
}

impl ExternalSigner for SoftwareSigner {
    fn sign(&self, algorithm: SignatureAlgorithm, digest_info: &DigestInfo) -> Result<Vec<u8>> {
        if algorithm != SignatureAlgorithm::Sha256WithRsa {
            return Err(Error::Unsupported(format!(
                "software signer only produces SHA256withRSA, not {}",
                algorithm
            )));
        }
        if digest_info.algorithm != algorithm.digest_algorithm() {
            return Err(Error::InvalidArgument(format!(
                "{} digest cannot be signed with {}",
                digest_info.algorithm, algorithm
            )));
        }
        // Raw PKCS#1 v1.5 over the encoded DigestInfo, as a token doing RSA_PKCS would.
        let block = digest_info.to_der()?;
        self.key
            .sign(Pkcs1v15Sign::new_unprefixed(), &block)
            .map_err(|e| Error::ExternalService(format!("RSA signing failed: {}", e)))
    }
}

impl fmt::Debug for SoftwareSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareSigner")
            .field("key_size", &self.key_size())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// A signer together with its certificate chain.
#[derive(Clone)]
pub struct SigningCredentials {
    /// Private key
    pub signer: SoftwareSigner,
    /// Certificate chain, leaf first
    pub chain: CertificateChain,
}

impl SigningCredentials {
    /// Bundle a key and its chain.
    pub fn new(signer: SoftwareSigner, chain: CertificateChain) -> Self {
        Self { signer, chain }
    }

    /// Load a key file and a PEM chain file.
    pub fn from_files(key_path: impl AsRef<Path>, chain_path: impl AsRef<Path>) -> Result<Self> {
        let signer = SoftwareSigner::from_file(key_path)?;
        let chain = CertificateChain::from_pem(&std::fs::read(chain_path.as_ref())?)?;
        Ok(Self { signer, chain })
    }
}

impl CertificateSource for SigningCredentials {
    fn certificate_chain(&self) -> Result<CertificateChain> {
        Ok(self.chain.clone())
    }
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("signer", &self.signer)
            .field("chain", &format!("{} certificates", self.chain.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::algorithms::DigestAlgorithm;

    const ALICE_KEY_DER: &[u8] = include_bytes!("../../tests/fixtures/alice.key.der");
    const ALICE_KEY_PEM: &str = include_str!("../../tests/fixtures/alice.key.pem");

    #[test]
    fn test_load_der_and_pem() {
        let der = SoftwareSigner::from_der(ALICE_KEY_DER).unwrap();
        let pem = SoftwareSigner::from_pem(ALICE_KEY_PEM).unwrap();
        assert_eq!(der.key_size(), 128);
        assert_eq!(pem.key_size(), 128);
    }

    #[test]
    fn test_load_pkcs1_der() {
        let pkcs1 = SoftwareSigner::from_der(include_bytes!("../../tests/fixtures/bob.key.rsa.der"))
            .unwrap();
        let pkcs8 = SoftwareSigner::from_der(include_bytes!("../../tests/fixtures/bob.key.der"))
            .unwrap();
        let info = DigestInfo::new(DigestAlgorithm::Sha256, vec![1; 32]);
        assert_eq!(
            pkcs1.sign(SignatureAlgorithm::Sha256WithRsa, &info).unwrap(),
            pkcs8.sign(SignatureAlgorithm::Sha256WithRsa, &info).unwrap()
        );
    }

    #[test]
    fn test_rejects_garbage_key() {
        assert!(matches!(SoftwareSigner::from_der(b"nope"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_sign_is_deterministic() {
        let signer = SoftwareSigner::from_der(ALICE_KEY_DER).unwrap();
        let info = DigestInfo::new(DigestAlgorithm::Sha256, vec![0x42; 32]);
        let a = signer.sign(SignatureAlgorithm::Sha256WithRsa, &info).unwrap();
        let b = signer.sign(SignatureAlgorithm::Sha256WithRsa, &info).unwrap();
        assert_eq!(a.len(), 128);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sign_rejects_other_algorithms() {
        let signer = SoftwareSigner::from_der(ALICE_KEY_DER).unwrap();
        let info = DigestInfo::new(DigestAlgorithm::Sha256, vec![0x42; 32]);
        assert!(matches!(
            signer.sign(SignatureAlgorithm::Sha1WithRsa, &info),
            Err(Error::Unsupported(_))
        ));
        let sha1 = DigestInfo::new(DigestAlgorithm::Sha1, vec![0x42; 20]);
        assert!(matches!(
            signer.sign(SignatureAlgorithm::Sha256WithRsa, &sha1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let signer = SoftwareSigner::from_der(ALICE_KEY_DER).unwrap();
        let debug = format!("{:?}", signer);
        assert!(debug.contains("[REDACTED]"));
    }
}
