//! Signature verification.
//!
//! Every signer of a `SignedData` is checked on its own and ends up with a
//! [`SecurityLevel`]. A cryptographic mismatch is recorded as `Invalid` with a
//! message, it never aborts verification of the remaining signers.

use chrono::{DateTime, Utc};
use cms::signed_data::{SignedAttributes, SignedData, SignerInfo};
use der::asn1::OctetString;
use der::Encode;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use sha2::Sha256;
use signature::hazmat::PrehashVerifier;
use signature::Verifier;
use x509_cert::time::Time;
use x509_cert::Certificate;

use super::algorithms::{
    AlgorithmRegistry, DigestAlgorithm, SignatureAlgorithm, ID_SHA256_WITH_RSA,
};
use super::envelope::{
    self, SigningCertificateV2, ID_AA_SIGNING_CERTIFICATE_V2, ID_MESSAGE_DIGEST, ID_SIGNING_TIME,
};
use super::level::SecurityLevel;
use super::phases::{Cms, EmptySignature, VerifiedSignature};
use super::timestamp::{
    self, TimestampAuthority, TimestampDisposition, TimestampInfo, TimestampToken,
    VerifiedTimestamp,
};
use super::types::{
    CertificateChain, DigestInfo, SignDisposition, SignerVerification, TimestampReport,
};
use crate::error::{Error, Result};

/// Longest issuer path followed when looking for a trusted root.
const MAX_CHAIN_DEPTH: usize = 8;

/// What a signer check learned beyond its level.
struct SignerEvidence {
    algorithm: SignatureAlgorithm,
    chain: CertificateChain,
    digest: Vec<u8>,
    signing_time: Option<DateTime<Utc>>,
    signature: Vec<u8>,
}

/// Verifier for CMS signatures.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    registry: AlgorithmRegistry,
    /// Trusted root certificates
    trusted_roots: Vec<Certificate>,
}

impl SignatureVerifier {
    /// Create a verifier without trusted roots; signatures reach at most `Valid`.
    pub fn new(registry: AlgorithmRegistry) -> Self {
        Self {
            registry,
            trusted_roots: Vec::new(),
        }
    }

    /// Add a trusted root certificate (DER).
    pub fn add_trusted_root(&mut self, cert_der: &[u8]) -> Result<()> {
        let chain = CertificateChain::from_der_certificates([cert_der])?;
        self.trusted_roots.extend(chain.certificates().iter().cloned());
        Ok(())
    }

    /// Add multiple trusted root certificates (DER).
    pub fn add_trusted_roots(&mut self, certs: Vec<Vec<u8>>) -> Result<()> {
        for cert in certs {
            self.add_trusted_root(&cert)?;
        }
        Ok(())
    }

    /// Number of trusted roots.
    pub fn trusted_root_count(&self) -> usize {
        self.trusted_roots.len()
    }

    /// Check if a certificate chains up to a trusted root.
    ///
    /// Issuers are looked up among `pool` and the trusted roots; every link must carry
    /// a valid SHA256withRSA signature from its issuer, and every certificate on the
    /// path must be inside its validity period.
    pub fn is_certificate_trusted(&self, cert: &Certificate, pool: &[&Certificate]) -> bool {
        let mut current = cert;
        for _ in 0..MAX_CHAIN_DEPTH {
            if !within_validity(current) {
                log::debug!("{} is outside its validity period", subject(current));
                return false;
            }
            if self.trusted_roots.iter().any(|root| root == current) {
                return true;
            }
            if let Some(root) = self
                .trusted_roots
                .iter()
                .find(|root| is_issued_by(current, root))
            {
                return within_validity(root);
            }
            match pool
                .iter()
                .copied()
                .find(|candidate| *candidate != current && is_issued_by(current, candidate))
            {
                Some(issuer) => current = issuer,
                None => return false,
            }
        }
        false
    }

    /// Verify every signer of `signed_data` over `content`.
    ///
    /// `external` holds the already checked timestamps covering the whole envelope;
    /// any of them failing makes every signer `Invalid`. Attribute timestamps are
    /// checked with `tsa` when given, otherwise with the built-in token verification.
    pub fn verify_signed_data(
        &self,
        signed_data: &SignedData,
        content: &[u8],
        external: &[TimestampReport],
        tsa: Option<&dyn TimestampAuthority>,
    ) -> Vec<SignerVerification> {
        let disposition = match signed_data.encap_content_info.econtent {
            Some(_) => SignDisposition::Embedded,
            None => SignDisposition::Detached,
        };
        signed_data
            .signer_infos
            .0
            .iter()
            .map(|signer| {
                self.verify_signer(signed_data, signer, content, disposition, external, tsa)
            })
            .collect()
    }

    fn verify_signer(
        &self,
        signed_data: &SignedData,
        signer: &SignerInfo,
        content: &[u8],
        disposition: SignDisposition,
        external: &[TimestampReport],
        tsa: Option<&dyn TimestampAuthority>,
    ) -> SignerVerification {
        let (mut report, evidence) = self.check_signer(signed_data, signer, content);

        for ts_report in external.iter().filter(|r| r.level == SecurityLevel::Invalid) {
            report.downgrade(
                SecurityLevel::Invalid,
                format!("{} timestamp does not verify", ts_report.disposition.as_str()),
            );
        }

        let token = match envelope::timestamp_attribute(signer) {
            Ok(token) => token,
            Err(e) => {
                report.downgrade(
                    SecurityLevel::Invalid,
                    format!("unreadable timestamp attribute: {}", e),
                );
                None
            },
        };
        let mut applied = None;
        if let Some(token_der) = token {
            let ts_report = self.check_timestamp(
                &token_der,
                signer.signature.as_bytes(),
                TimestampDisposition::Attribute,
                tsa,
            );
            if ts_report.level == SecurityLevel::Invalid {
                report.downgrade(SecurityLevel::Invalid, "attribute timestamp does not verify");
            }
            if ts_report.timestamp.is_some() {
                applied = TimestampToken::from_der(&token_der).ok();
            }
            report.attribute_timestamp = Some(ts_report);
        }

        if let Some(evidence) = evidence {
            report.signature = Some(reconstruct_phase(evidence, disposition, applied, report.level));
        }
        report
    }

    /// Cryptographic checks of one signer, without timestamps.
    fn check_signer(
        &self,
        signed_data: &SignedData,
        signer: &SignerInfo,
        content: &[u8],
    ) -> (SignerVerification, Option<SignerEvidence>) {
        let mut report = SignerVerification::unverified();

        let algorithm = match SignatureAlgorithm::from_oids(
            &signer.digest_alg.oid,
            &signer.signature_algorithm.oid,
        ) {
            Some(algorithm) if self.registry.supports(algorithm) => algorithm,
            Some(algorithm) => {
                report
                    .messages
                    .push(format!("unsupported signature algorithm {}", algorithm));
                return (report, None);
            },
            None => {
                report.messages.push(format!(
                    "unrecognized algorithm pair {} / {}",
                    signer.digest_alg.oid, signer.signature_algorithm.oid
                ));
                return (report, None);
            },
        };
        report.signature_algorithm = Some(algorithm);

        let cert = match envelope::signer_certificate(signed_data, signer) {
            Some(cert) => cert,
            None => {
                report
                    .messages
                    .push("signer certificate not found in envelope".to_string());
                return (report, None);
            },
        };
        report.signer_subject = Some(subject(cert));

        let descriptor = match self.registry.digest(algorithm.digest_algorithm()) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                report.messages.push(e.to_string());
                return (report, None);
            },
        };
        let content_digest = descriptor.digest(content);

        let digest = match &signer.signed_attrs {
            Some(attrs) => {
                match check_signed_attributes(&self.registry, attrs, &content_digest, cert) {
                    Ok(signing_time) => report.signing_time = signing_time,
                    Err(message) => {
                        report.messages.push(message);
                        return (report, None);
                    },
                }
                match attrs.to_der() {
                    Ok(der) => descriptor.digest(&der),
                    Err(e) => {
                        report
                            .messages
                            .push(format!("cannot encode signed attributes: {}", e));
                        return (report, None);
                    },
                }
            },
            None => content_digest,
        };

        if let Err(message) = verify_rsa(cert, &digest, signer.signature.as_bytes()) {
            report.messages.push(message);
            return (report, None);
        }
        report.level = SecurityLevel::Valid;

        let pool = envelope::certificates(signed_data);
        if self.is_certificate_trusted(cert, &pool) {
            report.level = SecurityLevel::Trusted;
        } else {
            report
                .messages
                .push("certificate is not anchored in a trusted root".to_string());
        }

        let evidence = SignerEvidence {
            algorithm,
            chain: ordered_chain(cert, &pool),
            digest,
            signing_time: report.signing_time,
            signature: signer.signature.as_bytes().to_vec(),
        };
        (report, Some(evidence))
    }

    /// Check a timestamp token bound to `bound`.
    ///
    /// Never fails: problems are reported as an `Invalid` report.
    pub fn check_timestamp(
        &self,
        token_der: &[u8],
        bound: &[u8],
        disposition: TimestampDisposition,
        tsa: Option<&dyn TimestampAuthority>,
    ) -> TimestampReport {
        let mut report = TimestampReport {
            disposition,
            timestamp: None,
            level: SecurityLevel::Invalid,
            messages: Vec::new(),
        };
        let token = match TimestampToken::from_der(token_der) {
            Ok(token) => token,
            Err(e) => {
                report.messages.push(format!("unreadable timestamp token: {}", e));
                return report;
            },
        };
        let verified = match tsa {
            Some(tsa) => tsa.verify(&token, Some(bound)),
            None => self.verify_timestamp(&token, Some(bound)),
        };
        match verified {
            Ok(verified) => {
                log::debug!(
                    "{} timestamp {} verified, time {}",
                    disposition.as_str(),
                    verified.serial,
                    verified.time
                );
                report.level = verified.level;
                report.timestamp = Some(verified);
            },
            Err(e) => {
                log::warn!("{} timestamp rejected: {}", disposition.as_str(), e);
                report.messages.push(e.to_string());
            },
        }
        report
    }

    /// Verify a token's CMS signature, the signer's timeStamping usage and, when `bound`
    /// is given, its imprint.
    pub fn verify_timestamp(
        &self,
        token: &TimestampToken,
        bound: Option<&[u8]>,
    ) -> Result<VerifiedTimestamp> {
        let signed_data = envelope::decode_signed_data(&token.encoded)?;
        let tst_bytes = timestamp::tst_info_bytes(&signed_data)?;

        let mut signers = signed_data.signer_infos.0.iter();
        let signer = signers
            .next()
            .ok_or_else(|| Error::Encoding("timestamp token without signer".to_string()))?;
        let (report, _) = self.check_signer(&signed_data, signer, &tst_bytes);
        if report.level == SecurityLevel::Invalid {
            return Err(Error::ExternalService(format!(
                "timestamp token signature invalid: {}",
                report.messages.join("; ")
            )));
        }
        match envelope::signer_certificate(&signed_data, signer) {
            Some(cert) if has_time_stamping_usage(cert) => {},
            _ => {
                return Err(Error::ExternalService(
                    "timestamp token not signed by a timeStamping certificate".to_string(),
                ));
            },
        }

        if let Some(bound) = bound {
            if !token.imprint.matches(&self.registry, bound)? {
                return Err(Error::ExternalService(
                    "timestamp message imprint does not match the timestamped data".to_string(),
                ));
            }
        }

        Ok(VerifiedTimestamp {
            time: token.gen_time,
            issuer: token.issuer.clone(),
            serial: token.serial_hex(),
            level: report.level,
        })
    }
}

/// Check `messageDigest` and, when present, `signingCertificateV2`.
///
/// Returns the signing time on success and a message describing the first failure.
fn check_signed_attributes(
    registry: &AlgorithmRegistry,
    attrs: &SignedAttributes,
    content_digest: &[u8],
    cert: &Certificate,
) -> std::result::Result<Option<DateTime<Utc>>, String> {
    let message_digest: OctetString = envelope::attribute_value(attrs, &ID_MESSAGE_DIGEST)
        .map_err(|e| format!("unreadable messageDigest: {}", e))?
        .ok_or_else(|| "signed attributes without messageDigest".to_string())?;
    if message_digest.as_bytes() != content_digest {
        return Err("content digest does not match messageDigest".to_string());
    }

    let signing_cert: Option<SigningCertificateV2> =
        envelope::attribute_value(attrs, &ID_AA_SIGNING_CERTIFICATE_V2)
            .map_err(|e| format!("unreadable signingCertificateV2: {}", e))?;
    if let Some(signing_cert) = signing_cert {
        let cert_der = cert
            .to_der()
            .map_err(|e| format!("cannot encode signer certificate: {}", e))?;
        let first = signing_cert
            .certs
            .first()
            .ok_or_else(|| "empty signingCertificateV2".to_string())?;
        let descriptor = match &first.hash_algorithm {
            Some(alg) => registry.digest_by_oid(&alg.oid).ok_or_else(|| {
                format!("signingCertificateV2 uses an unsupported hash {}", alg.oid)
            })?,
            None => registry
                .digest(DigestAlgorithm::Sha256)
                .map_err(|e| e.to_string())?,
        };
        let cert_hash = descriptor.digest(&cert_der);
        if first.cert_hash.as_bytes() != cert_hash.as_slice() {
            return Err("signingCertificateV2 does not name the signer certificate".to_string());
        }
    }

    let signing_time: Option<Time> = envelope::attribute_value(attrs, &ID_SIGNING_TIME)
        .map_err(|e| format!("unreadable signingTime: {}", e))?;
    Ok(signing_time.as_ref().and_then(envelope::to_datetime))
}

fn public_key(cert: &Certificate) -> std::result::Result<RsaPublicKey, String> {
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| format!("cannot encode public key: {}", e))?;
    RsaPublicKey::from_public_key_der(&spki).map_err(|e| format!("not an RSA public key: {}", e))
}

fn verify_rsa(cert: &Certificate, digest: &[u8], signature: &[u8]) -> std::result::Result<(), String> {
    let key = VerifyingKey::<Sha256>::new(public_key(cert)?);
    let signature =
        Signature::try_from(signature).map_err(|e| format!("malformed signature: {}", e))?;
    key.verify_prehash(digest, &signature)
        .map_err(|_| "signature does not match the signed data".to_string())
}

/// Whether `issuer` issued and signed `cert`.
fn is_issued_by(cert: &Certificate, issuer: &Certificate) -> bool {
    if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return false;
    }
    if cert.signature_algorithm.oid != ID_SHA256_WITH_RSA {
        log::debug!(
            "certificate signature algorithm {} not supported",
            cert.signature_algorithm.oid
        );
        return false;
    }
    let Ok(key) = public_key(issuer) else {
        return false;
    };
    let Ok(tbs) = cert.tbs_certificate.to_der() else {
        return false;
    };
    let Some(raw) = cert.signature.as_bytes() else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(key).verify(&tbs, &signature).is_ok()
}

fn within_validity(cert: &Certificate) -> bool {
    let Ok(der) = cert.to_der() else {
        return false;
    };
    match x509_parser::parse_x509_certificate(&der) {
        Ok((_, parsed)) => parsed.validity().is_valid(),
        Err(_) => false,
    }
}

/// Whether the certificate's extended key usage allows timeStamping.
fn has_time_stamping_usage(cert: &Certificate) -> bool {
    let Ok(der) = cert.to_der() else {
        return false;
    };
    match x509_parser::parse_x509_certificate(&der) {
        Ok((_, parsed)) => {
            matches!(parsed.extended_key_usage(), Ok(Some(eku)) if eku.value.time_stamping)
        },
        Err(_) => false,
    }
}

/// Human-readable subject of a certificate.
pub fn subject(cert: &Certificate) -> String {
    cert.to_der()
        .ok()
        .and_then(|der| {
            x509_parser::parse_x509_certificate(&der)
                .ok()
                .map(|(_, parsed)| parsed.subject().to_string())
        })
        .unwrap_or_else(|| cert.tbs_certificate.subject.to_string())
}

/// Signer certificate followed by its issuers found in `pool`.
fn ordered_chain(leaf: &Certificate, pool: &[&Certificate]) -> CertificateChain {
    let mut chain = vec![leaf.clone()];
    let mut current = leaf;
    while chain.len() < MAX_CHAIN_DEPTH {
        match pool.iter().copied().find(|candidate| {
            candidate.tbs_certificate.subject == current.tbs_certificate.issuer
                && !chain.contains(candidate)
        }) {
            Some(issuer) => {
                chain.push(issuer.clone());
                current = issuer;
            },
            None => break,
        }
    }
    CertificateChain::new(chain)
}

/// Replay the signing phases for a verified signer.
fn reconstruct_phase(
    evidence: SignerEvidence,
    disposition: SignDisposition,
    timestamp: Option<TimestampToken>,
    level: SecurityLevel,
) -> VerifiedSignature<Cms> {
    let signed = EmptySignature::<Cms>::new(evidence.algorithm, evidence.algorithm.digest_algorithm())
        .to_chain_signature(evidence.chain, disposition)
        .to_digest_signature(
            DigestInfo::new(evidence.algorithm.digest_algorithm(), evidence.digest),
            evidence.signing_time,
        )
        .to_signed_signature(evidence.signature, None);
    let finalized = match timestamp {
        Some(token) => signed
            .to_marked_signature()
            .append_timestamp(TimestampInfo {
                disposition: TimestampDisposition::Attribute,
                token,
            })
            .finalize(),
        None => signed.finalize(),
    };
    finalized.to_verified_signature(level)
}
