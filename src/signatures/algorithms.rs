//! Algorithm registry.
//!
//! Digest and signature algorithms are *recognized* by the enums below (so OIDs found
//! in foreign envelopes can be named), but only the algorithms registered by the
//! [`CryptoProvider`] are *supported*. Asking the registry for anything else fails
//! with [`Error::Configuration`] before any content is read.

use std::collections::HashMap;
use std::fmt;

use der::asn1::ObjectIdentifier;
use serde::{Deserialize, Serialize};

use super::envelope;
use crate::config::CryptoProvider;
use crate::error::{Error, Result};

/// 1.3.14.3.2.26
pub const ID_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");
/// 2.16.840.1.101.3.4.2.1
pub const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
/// 2.16.840.1.101.3.4.2.2
pub const ID_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.2");
/// 2.16.840.1.101.3.4.2.3
pub const ID_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3");

/// rsaEncryption, 1.2.840.113549.1.1.1
pub const ID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
/// 1.2.840.113549.1.1.5
pub const ID_SHA1_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");
/// 1.2.840.113549.1.1.11
pub const ID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
/// 1.2.840.113549.1.1.12
pub const ID_SHA384_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
/// 1.2.840.113549.1.1.13
pub const ID_SHA512_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");

/// Digest algorithm used for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    /// SHA-1 (legacy, never supported for new signatures)
    #[serde(rename = "SHA-1")]
    Sha1,
    /// SHA-256
    #[default]
    #[serde(rename = "SHA-256")]
    Sha256,
    /// SHA-384
    #[serde(rename = "SHA-384")]
    Sha384,
    /// SHA-512
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl DigestAlgorithm {
    /// Get the OID for this digest algorithm.
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha1 => ID_SHA1,
            DigestAlgorithm::Sha256 => ID_SHA256,
            DigestAlgorithm::Sha384 => ID_SHA384,
            DigestAlgorithm::Sha512 => ID_SHA512,
        }
    }

    /// Get the name of this algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Recognize a digest algorithm by OID.
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        [
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ]
        .into_iter()
        .find(|alg| alg.oid() == *oid)
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signature algorithm (digest + RSA encryption).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// sha1WithRSAEncryption
    #[serde(rename = "SHA1withRSA")]
    Sha1WithRsa,
    /// sha256WithRSAEncryption
    #[default]
    #[serde(rename = "SHA256withRSA")]
    Sha256WithRsa,
    /// sha384WithRSAEncryption
    #[serde(rename = "SHA384withRSA")]
    Sha384WithRsa,
    /// sha512WithRSAEncryption
    #[serde(rename = "SHA512withRSA")]
    Sha512WithRsa,
}

impl SignatureAlgorithm {
    const ALL: [SignatureAlgorithm; 4] = [
        SignatureAlgorithm::Sha1WithRsa,
        SignatureAlgorithm::Sha256WithRsa,
        SignatureAlgorithm::Sha384WithRsa,
        SignatureAlgorithm::Sha512WithRsa,
    ];

    /// Get the combined signature OID.
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            SignatureAlgorithm::Sha1WithRsa => ID_SHA1_WITH_RSA,
            SignatureAlgorithm::Sha256WithRsa => ID_SHA256_WITH_RSA,
            SignatureAlgorithm::Sha384WithRsa => ID_SHA384_WITH_RSA,
            SignatureAlgorithm::Sha512WithRsa => ID_SHA512_WITH_RSA,
        }
    }

    /// Get the OID of the bare encryption algorithm.
    pub fn encryption_oid(&self) -> ObjectIdentifier {
        ID_RSA_ENCRYPTION
    }

    /// Digest algorithm paired with this signature algorithm.
    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        match self {
            SignatureAlgorithm::Sha1WithRsa => DigestAlgorithm::Sha1,
            SignatureAlgorithm::Sha256WithRsa => DigestAlgorithm::Sha256,
            SignatureAlgorithm::Sha384WithRsa => DigestAlgorithm::Sha384,
            SignatureAlgorithm::Sha512WithRsa => DigestAlgorithm::Sha512,
        }
    }

    /// Get the name of this algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha1WithRsa => "SHA1withRSA",
            SignatureAlgorithm::Sha256WithRsa => "SHA256withRSA",
            SignatureAlgorithm::Sha384WithRsa => "SHA384withRSA",
            SignatureAlgorithm::Sha512WithRsa => "SHA512withRSA",
        }
    }

    /// Recognize a signature algorithm from a signer's digest and signature OIDs.
    ///
    /// CMS signers may carry either the combined OID (`sha256WithRSAEncryption`) or
    /// the bare `rsaEncryption` OID, in which case the digest OID decides.
    pub fn from_oids(digest_oid: &ObjectIdentifier, signature_oid: &ObjectIdentifier) -> Option<Self> {
        let digest = DigestAlgorithm::from_oid(digest_oid)?;
        Self::ALL.into_iter().find(|alg| {
            alg.digest_algorithm() == digest
                && (alg.oid() == *signature_oid || alg.encryption_oid() == *signature_oid)
        })
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A supported digest algorithm together with its implementation.
#[derive(Clone, Copy)]
pub struct DigestDescriptor {
    /// Algorithm
    pub algorithm: DigestAlgorithm,
    /// Algorithm OID
    pub oid: ObjectIdentifier,
    compute: fn(&[u8]) -> Vec<u8>,
}

impl DigestDescriptor {
    /// Digest `data` with this algorithm.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        (self.compute)(data)
    }
}

impl fmt::Debug for DigestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestDescriptor")
            .field("algorithm", &self.algorithm)
            .field("oid", &self.oid)
            .finish()
    }
}

/// A supported signature algorithm.
#[derive(Debug, Clone, Copy)]
pub struct SignatureDescriptor {
    /// Algorithm
    pub algorithm: SignatureAlgorithm,
    /// Combined signature OID
    pub oid: ObjectIdentifier,
    /// Digest used by the algorithm
    pub digest: DigestAlgorithm,
}

/// Implementation table. Algorithms missing here can be recognized but never supported.
fn digest_implementation(algorithm: DigestAlgorithm) -> Option<fn(&[u8]) -> Vec<u8>> {
    match algorithm {
        DigestAlgorithm::Sha256 => Some(envelope::sha256),
        _ => None,
    }
}

fn signature_implemented(algorithm: SignatureAlgorithm) -> bool {
    matches!(algorithm, SignatureAlgorithm::Sha256WithRsa)
}

/// Capability map from OID to supported algorithm descriptors.
#[derive(Debug, Clone)]
pub struct AlgorithmRegistry {
    digests: HashMap<ObjectIdentifier, DigestDescriptor>,
    signatures: HashMap<ObjectIdentifier, SignatureDescriptor>,
}

impl AlgorithmRegistry {
    /// Build the registry from the algorithms registered by the provider.
    pub fn new(provider: &CryptoProvider) -> Self {
        let mut digests = HashMap::new();
        for &algorithm in provider.digest_algorithms() {
            match digest_implementation(algorithm) {
                Some(compute) => {
                    digests.insert(
                        algorithm.oid(),
                        DigestDescriptor {
                            algorithm,
                            oid: algorithm.oid(),
                            compute,
                        },
                    );
                },
                None => log::warn!(
                    "Provider {} lists {} but no implementation is available",
                    provider.name(),
                    algorithm
                ),
            }
        }

        let mut signatures = HashMap::new();
        for &algorithm in provider.signature_algorithms() {
            if !signature_implemented(algorithm) || !digests.contains_key(&algorithm.digest_algorithm().oid()) {
                log::warn!(
                    "Provider {} lists {} but it cannot be supported",
                    provider.name(),
                    algorithm
                );
                continue;
            }
            signatures.insert(
                algorithm.oid(),
                SignatureDescriptor {
                    algorithm,
                    oid: algorithm.oid(),
                    digest: algorithm.digest_algorithm(),
                },
            );
        }

        log::debug!(
            "Algorithm registry: {} digest(s), {} signature algorithm(s)",
            digests.len(),
            signatures.len()
        );
        Self { digests, signatures }
    }

    /// Look up a supported digest algorithm.
    pub fn digest(&self, algorithm: DigestAlgorithm) -> Result<&DigestDescriptor> {
        self.digests.get(&algorithm.oid()).ok_or_else(|| {
            Error::Configuration(format!("digest algorithm {} is not supported", algorithm))
        })
    }

    /// Look up a supported digest algorithm by OID.
    pub fn digest_by_oid(&self, oid: &ObjectIdentifier) -> Option<&DigestDescriptor> {
        self.digests.get(oid)
    }

    /// Look up a supported signature algorithm.
    pub fn signature(&self, algorithm: SignatureAlgorithm) -> Result<&SignatureDescriptor> {
        self.signatures.get(&algorithm.oid()).ok_or_else(|| {
            Error::Configuration(format!("signature algorithm {} is not supported", algorithm))
        })
    }

    /// Whether the algorithm is supported.
    pub fn supports(&self, algorithm: SignatureAlgorithm) -> bool {
        self.signatures.contains_key(&algorithm.oid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_algorithm_names() {
        assert_eq!(DigestAlgorithm::Sha256.name(), "SHA-256");
        assert_eq!(DigestAlgorithm::Sha1.name(), "SHA-1");
        assert_eq!(DigestAlgorithm::Sha384.to_string(), "SHA-384");
    }

    #[test]
    fn test_digest_from_oid() {
        assert_eq!(DigestAlgorithm::from_oid(&ID_SHA256), Some(DigestAlgorithm::Sha256));
        assert_eq!(DigestAlgorithm::from_oid(&ID_RSA_ENCRYPTION), None);
    }

    #[test]
    fn test_signature_from_oids() {
        assert_eq!(
            SignatureAlgorithm::from_oids(&ID_SHA256, &ID_RSA_ENCRYPTION),
            Some(SignatureAlgorithm::Sha256WithRsa)
        );
        assert_eq!(
            SignatureAlgorithm::from_oids(&ID_SHA256, &ID_SHA256_WITH_RSA),
            Some(SignatureAlgorithm::Sha256WithRsa)
        );
        // digest and combined OID disagree
        assert_eq!(SignatureAlgorithm::from_oids(&ID_SHA1, &ID_SHA256_WITH_RSA), None);
    }

    #[test]
    fn test_registry_only_supports_sha256() {
        let registry = AlgorithmRegistry::new(&CryptoProvider::register());
        assert!(registry.digest(DigestAlgorithm::Sha256).is_ok());
        for alg in [DigestAlgorithm::Sha1, DigestAlgorithm::Sha384, DigestAlgorithm::Sha512] {
            assert!(matches!(registry.digest(alg), Err(Error::Configuration(_))));
        }
        assert!(registry.supports(SignatureAlgorithm::Sha256WithRsa));
        assert!(!registry.supports(SignatureAlgorithm::Sha1WithRsa));
    }

    #[test]
    fn test_sha256_descriptor() {
        let registry = AlgorithmRegistry::new(&CryptoProvider::register());
        let digest = registry.digest(DigestAlgorithm::Sha256).unwrap().digest(b"abc");
        assert_eq!(digest.len(), 32);
        assert_eq!(&digest[..4], &[0xba, 0x78, 0x16, 0xbf]);
    }

    #[test]
    fn test_provider_cannot_enable_unimplemented_digest() {
        let provider = CryptoProvider::register()
            .with_digest_algorithms(vec![DigestAlgorithm::Sha256, DigestAlgorithm::Sha512]);
        let registry = AlgorithmRegistry::new(&provider);
        assert!(registry.digest(DigestAlgorithm::Sha512).is_err());
        assert!(registry.digest_by_oid(&ID_SHA256).is_some());
    }
}
