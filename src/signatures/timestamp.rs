//! RFC 3161 timestamps.
//!
//! A timestamp binds a trusted time to a message imprint (a digest). Three
//! dispositions decide what the imprint covers and where the token ends up:
//!
//! - `Enveloping`: the imprint covers the encoded `SignedData`, and the token is
//!   enveloped together with it in a `MarkedData`.
//! - `Attribute`: one imprint per signer over that signer's signature bytes, and the
//!   token is stored as an unsigned attribute of the signer.
//! - `Detached`: a separate `.tsr` response over the envelope bytes. Accepted when
//!   verifying, rejected when applying.

use chrono::{DateTime, Utc};
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::{Decode, Encode};
use serde::{Deserialize, Serialize};
use spki::AlgorithmIdentifierOwned;
use x509_cert::ext::pkix::name::GeneralName;

use super::algorithms::{AlgorithmRegistry, DigestAlgorithm};
use super::envelope::{self, MarkedData, MessageImprintAsn1, TimeStampResp, TstInfo, ID_CT_TST_INFO};
use super::level::SecurityLevel;
use crate::error::{Error, Result};

/// How a timestamp is attached to a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimestampDisposition {
    /// Separate `.tsr` response
    Detached,
    /// Token enveloped with the `SignedData` in a `MarkedData`
    Enveloping,
    /// Token stored as an unsigned attribute of each signer
    Attribute,
}

impl TimestampDisposition {
    /// Upper-case name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampDisposition::Detached => "DETACHED",
            TimestampDisposition::Enveloping => "ENVELOPING",
            TimestampDisposition::Attribute => "ATTRIBUTE",
        }
    }
}

/// Request to timestamp a signature once it has been produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampRequest {
    /// Where the token goes
    pub disposition: TimestampDisposition,
    /// Digest used for the message imprint
    pub digest_algorithm: DigestAlgorithm,
}

impl TimestampRequest {
    /// Request with a SHA-256 imprint.
    pub fn new(disposition: TimestampDisposition) -> Self {
        Self {
            disposition,
            digest_algorithm: DigestAlgorithm::Sha256,
        }
    }

    /// Use another imprint digest.
    pub fn with_digest_algorithm(mut self, digest_algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = digest_algorithm;
        self
    }
}

/// Digest of the data being timestamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageImprint {
    /// Digest algorithm
    pub algorithm: DigestAlgorithm,
    /// Digest value
    pub digest: Vec<u8>,
}

impl MessageImprint {
    /// Digest `data` with a supported algorithm.
    pub fn compute(
        registry: &AlgorithmRegistry,
        algorithm: DigestAlgorithm,
        data: &[u8],
    ) -> Result<Self> {
        let descriptor = registry.digest(algorithm)?;
        Ok(Self {
            algorithm,
            digest: descriptor.digest(data),
        })
    }

    /// Whether this imprint covers `data`.
    pub fn matches(&self, registry: &AlgorithmRegistry, data: &[u8]) -> Result<bool> {
        Ok(registry.digest(self.algorithm)?.digest(data) == self.digest)
    }

    pub(crate) fn to_asn1(&self) -> Result<MessageImprintAsn1> {
        Ok(MessageImprintAsn1 {
            hash_algorithm: AlgorithmIdentifierOwned {
                oid: self.algorithm.oid(),
                parameters: None,
            },
            hashed_message: der::asn1::OctetString::new(self.digest.clone())?,
        })
    }

    fn from_asn1(asn1: &MessageImprintAsn1) -> Result<Self> {
        let algorithm = DigestAlgorithm::from_oid(&asn1.hash_algorithm.oid).ok_or_else(|| {
            Error::Encoding(format!(
                "unknown message imprint algorithm {}",
                asn1.hash_algorithm.oid
            ))
        })?;
        Ok(Self {
            algorithm,
            digest: asn1.hashed_message.as_bytes().to_vec(),
        })
    }
}

/// An RFC 3161 timestamp token with its `TSTInfo` fields decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampToken {
    /// DER `ContentInfo` of the token
    pub encoded: Vec<u8>,
    /// Trusted time
    pub gen_time: DateTime<Utc>,
    /// TSA identity
    pub issuer: String,
    /// Imprint the token covers
    pub imprint: MessageImprint,
    /// Serial number, big-endian
    pub serial: Vec<u8>,
}

impl TimestampToken {
    /// Decode a token from its DER `ContentInfo`.
    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let info = ContentInfo::from_der(bytes)
            .map_err(|e| Error::Encoding(format!("timestamp token is not a ContentInfo: {}", e)))?;
        let signed_data = envelope::signed_data_from_content_info(&info)?;
        let tst_info = tst_info(&signed_data)?;

        let gen_time = envelope::generalized_to_datetime(&tst_info.gen_time)
            .ok_or_else(|| Error::Encoding("timestamp genTime out of range".to_string()))?;
        let issuer = match &tst_info.tsa {
            Some(GeneralName::DirectoryName(name)) => name.to_string(),
            _ => signed_data
                .signer_infos
                .0
                .iter()
                .next()
                .and_then(|signer| envelope::signer_certificate(&signed_data, signer))
                .map(|cert| cert.tbs_certificate.subject.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        };

        Ok(Self {
            encoded: bytes.to_vec(),
            gen_time,
            issuer,
            imprint: MessageImprint::from_asn1(&tst_info.message_imprint)?,
            serial: tst_info.serial_number.as_bytes().to_vec(),
        })
    }

    /// Decode the token carried by an RFC 3161 `TimeStampResp` (`.tsr`).
    pub fn from_response(bytes: &[u8]) -> Result<Self> {
        let response = TimeStampResp::from_der(bytes)
            .map_err(|e| Error::Encoding(format!("not a TimeStampResp: {}", e)))?;
        // granted (0) or grantedWithMods (1)
        if response.status.status > 1 {
            let text = response
                .status
                .status_string
                .map(|lines| lines.join("; "))
                .unwrap_or_default();
            return Err(Error::ExternalService(format!(
                "timestamp request rejected with status {}: {}",
                response.status.status, text
            )));
        }
        let token = response
            .time_stamp_token
            .ok_or_else(|| Error::Encoding("TimeStampResp without token".to_string()))?;
        Self::from_der(&token.to_der()?)
    }

    /// Token as a CMS `ContentInfo`.
    pub fn content_info(&self) -> Result<ContentInfo> {
        Ok(ContentInfo::from_der(&self.encoded)?)
    }

    /// Serial number as lowercase hex.
    pub fn serial_hex(&self) -> String {
        envelope::hex(&self.serial)
    }
}

/// Decoded `TSTInfo` of a token's `SignedData`.
pub(crate) fn tst_info(signed_data: &SignedData) -> Result<TstInfo> {
    let tst_bytes = tst_info_bytes(signed_data)?;
    TstInfo::from_der(&tst_bytes).map_err(|e| Error::Encoding(format!("invalid TSTInfo: {}", e)))
}

/// Encoded `TSTInfo`, the content the TSA signed.
pub(crate) fn tst_info_bytes(signed_data: &SignedData) -> Result<Vec<u8>> {
    if signed_data.encap_content_info.econtent_type != ID_CT_TST_INFO {
        return Err(Error::Encoding(format!(
            "timestamp token content is {}, not TSTInfo",
            signed_data.encap_content_info.econtent_type
        )));
    }
    envelope::embedded_content(signed_data)?
        .ok_or_else(|| Error::Encoding("timestamp token without TSTInfo".to_string()))
}

/// A timestamp token that passed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedTimestamp {
    /// Trusted time
    pub time: DateTime<Utc>,
    /// TSA identity
    pub issuer: String,
    /// Serial number, hex
    pub serial: String,
    /// Level of the TSA certificate: `Trusted` when anchored in a trusted root
    pub level: SecurityLevel,
}

/// A timestamp applied during signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampInfo {
    /// Where the token went
    pub disposition: TimestampDisposition,
    /// The token
    pub token: TimestampToken,
}

/// Client of a timestamp authority.
pub trait TimestampAuthority: Send + Sync {
    /// Obtain a token for `imprint`.
    fn request(&self, imprint: &MessageImprint) -> Result<TimestampToken>;

    /// Check a token; when `bound` is given the imprint must cover it.
    fn verify(&self, token: &TimestampToken, bound: Option<&[u8]>) -> Result<VerifiedTimestamp>;
}

/// Ask the TSA for a token and make sure it covers `imprint`.
pub fn request_token(
    tsa: &dyn TimestampAuthority,
    imprint: &MessageImprint,
) -> Result<TimestampToken> {
    log::debug!(
        "Requesting timestamp for {} imprint {}",
        imprint.algorithm,
        envelope::hex(&imprint.digest)
    );
    let token = tsa.request(imprint).map_err(|e| match e {
        Error::ExternalService(_) => e,
        other => Error::ExternalService(format!("timestamp authority failed: {}", other)),
    })?;
    if token.imprint != *imprint {
        return Err(Error::ExternalService(
            "timestamp authority returned a token for a different message imprint".to_string(),
        ));
    }
    log::info!(
        "Timestamp {} issued by {} at {}",
        token.serial_hex(),
        token.issuer,
        token.gen_time
    );
    Ok(token)
}

/// Timestamp an encoded `SignedData` and envelope both into a `MarkedData`.
pub fn apply_enveloping(
    tsa: &dyn TimestampAuthority,
    registry: &AlgorithmRegistry,
    request: &TimestampRequest,
    signed_data: &[u8],
) -> Result<(MarkedData, TimestampToken)> {
    let imprint = MessageImprint::compute(registry, request.digest_algorithm, signed_data)?;
    let token = request_token(tsa, &imprint)?;
    let marked = MarkedData {
        signed_data: signed_data.to_vec(),
        token: token.encoded.clone(),
    };
    Ok((marked, token))
}

/// Timestamp every signer's signature bytes and store each token on its signer.
///
/// Tokens are returned in signer order.
pub fn apply_attribute(
    tsa: &dyn TimestampAuthority,
    registry: &AlgorithmRegistry,
    request: &TimestampRequest,
    signed_data: &mut SignedData,
) -> Result<Vec<TimestampToken>> {
    let mut tokens = Vec::new();
    envelope::map_signers(signed_data, |signer| {
        let imprint =
            MessageImprint::compute(registry, request.digest_algorithm, signer.signature.as_bytes())?;
        let token = request_token(tsa, &imprint)?;
        envelope::set_timestamp_attribute(signer, &token.content_info()?)?;
        tokens.push(token);
        Ok(())
    })?;
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoProvider;

    #[test]
    fn test_imprint_rejects_unsupported_digest() {
        let registry = AlgorithmRegistry::new(&CryptoProvider::register());
        let err = MessageImprint::compute(&registry, DigestAlgorithm::Sha1, b"data");
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_imprint_matches() {
        let registry = AlgorithmRegistry::new(&CryptoProvider::register());
        let imprint = MessageImprint::compute(&registry, DigestAlgorithm::Sha256, b"data").unwrap();
        assert!(imprint.matches(&registry, b"data").unwrap());
        assert!(!imprint.matches(&registry, b"date").unwrap());
        let asn1 = imprint.to_asn1().unwrap();
        assert_eq!(MessageImprint::from_asn1(&asn1).unwrap(), imprint);
    }

    #[test]
    fn test_disposition_serde() {
        assert_eq!(
            serde_json::to_string(&TimestampDisposition::Enveloping).unwrap(),
            "\"ENVELOPING\""
        );
        assert_eq!(TimestampDisposition::Attribute.as_str(), "ATTRIBUTE");
    }

    #[test]
    fn test_token_rejects_garbage() {
        assert!(matches!(TimestampToken::from_der(b"junk"), Err(Error::Encoding(_))));
        assert!(matches!(TimestampToken::from_response(b"junk"), Err(Error::Encoding(_))));
    }
}
