//! CMS envelope codec.
//!
//! Builds and parses the three envelope shapes:
//!
//! - `SignedData` (detached or with embedded content), wrapped in a `ContentInfo`
//! - `MarkedData`, an RFC 5544 `TimeStampedData` carrying an encoded `SignedData`
//!   together with a timestamp token
//! - RFC 3161 `TimeStampToken` / `TimeStampResp`
//!
//! The DER work itself is done by the `der`, `cms` and `x509-cert` crates; this module
//! only assembles their types the way the signing pipeline needs them.

use chrono::{DateTime, TimeZone, Utc};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedAttributes, SignedData, SignerIdentifier,
    SignerInfo, SignerInfos,
};
use der::asn1::{
    BitString, GeneralizedTime, Ia5String, Int, ObjectIdentifier, OctetString, SetOfVec, UtcTime,
};
use der::{Any, Decode, Encode, EncodeValue, Sequence, Tagged};
use sha2::{Digest, Sha256};
use spki::AlgorithmIdentifierOwned;
use x509_cert::attr::Attribute;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectKeyIdentifier;
use x509_cert::ext::Extension;
use x509_cert::time::Time;
use x509_cert::Certificate;

use super::algorithms::{DigestAlgorithm, DigestDescriptor, SignatureAlgorithm};
use super::types::CertificateChain;
use crate::error::{Error, Result};

/// id-data, 1.2.840.113549.1.7.1
pub const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
/// id-signedData, 1.2.840.113549.1.7.2
pub const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
/// id-contentType, 1.2.840.113549.1.9.3
pub const ID_CONTENT_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
/// id-messageDigest, 1.2.840.113549.1.9.4
pub const ID_MESSAGE_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
/// id-signingTime, 1.2.840.113549.1.9.5
pub const ID_SIGNING_TIME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.5");
/// id-aa-signingCertificateV2, 1.2.840.113549.1.9.16.2.47
pub const ID_AA_SIGNING_CERTIFICATE_V2: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.47");
/// id-aa-timeStampToken, 1.2.840.113549.1.9.16.2.14
pub const ID_AA_TIME_STAMP_TOKEN: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.14");
/// id-ct-TSTInfo, 1.2.840.113549.1.9.16.1.4
pub const ID_CT_TST_INFO: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.4");
/// id-ct-timestampedData, 1.2.840.113549.1.9.16.1.31
pub const ID_CT_TIMESTAMPED_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.31");
/// id-ce-subjectKeyIdentifier, 2.5.29.14
pub const ID_CE_SUBJECT_KEY_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.14");

/// ESS `ESSCertIDv2`; the hash algorithm defaults to SHA-256 when absent.
#[derive(Clone, Debug, Sequence)]
pub struct EssCertIdV2 {
    /// Hash algorithm, omitted for SHA-256
    pub hash_algorithm: Option<AlgorithmIdentifierOwned>,
    /// Hash of the whole encoded certificate
    pub cert_hash: OctetString,
    /// Issuer and serial, not produced here
    pub issuer_serial: Option<Any>,
}

/// ESS `SigningCertificateV2` (RFC 5035).
#[derive(Clone, Debug, Sequence)]
pub struct SigningCertificateV2 {
    /// One entry per certificate, signer first
    pub certs: Vec<EssCertIdV2>,
    /// Policies, not produced here
    pub policies: Option<Vec<Any>>,
}

/// RFC 5544 `TimeStampAndCRL`.
#[derive(Clone, Debug, Sequence)]
pub struct TimeStampAndCrl {
    /// The timestamp token (a `ContentInfo` holding a `SignedData`)
    pub time_stamp: ContentInfo,
    /// Optional CRL, kept opaque
    pub crl: Option<Any>,
}

/// RFC 5544 `TimeStampedData`, used for the `MarkedData` envelope.
#[derive(Clone, Debug, Sequence)]
pub struct TimeStampedData {
    /// Always 1
    pub version: u8,
    /// Optional URI of the data
    pub data_uri: Option<Ia5String>,
    /// The encoded `SignedData`
    pub content: Option<OctetString>,
    /// `tstEvidence`
    #[asn1(
        context_specific = "0",
        tag_mode = "IMPLICIT",
        constructed = "true",
        optional = "true"
    )]
    pub temporal_evidence: Option<Vec<TimeStampAndCrl>>,
}

/// RFC 3161 `MessageImprint`.
#[derive(Clone, Debug, Sequence)]
pub struct MessageImprintAsn1 {
    /// Hash algorithm
    pub hash_algorithm: AlgorithmIdentifierOwned,
    /// Hash value
    pub hashed_message: OctetString,
}

/// RFC 3161 `Accuracy`.
#[derive(Clone, Debug, Sequence)]
pub struct Accuracy {
    /// Seconds
    pub seconds: Option<u64>,
    /// Milliseconds
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
    pub millis: Option<u16>,
    /// Microseconds
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", optional = "true")]
    pub micros: Option<u16>,
}

/// RFC 3161 `TSTInfo`.
#[derive(Clone, Debug, Sequence)]
pub struct TstInfo {
    /// Always 1
    pub version: u8,
    /// TSA policy
    pub policy: ObjectIdentifier,
    /// Imprint of the timestamped data
    pub message_imprint: MessageImprintAsn1,
    /// Unique per TSA
    pub serial_number: Int,
    /// Trusted time
    pub gen_time: GeneralizedTime,
    /// Accuracy of `gen_time`
    pub accuracy: Option<Accuracy>,
    /// Ordering flag, DEFAULT FALSE
    pub ordering: Option<bool>,
    /// Nonce from the request
    pub nonce: Option<Int>,
    /// TSA name
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    pub tsa: Option<GeneralName>,
    /// Extensions
    #[asn1(
        context_specific = "1",
        tag_mode = "IMPLICIT",
        constructed = "true",
        optional = "true"
    )]
    pub extensions: Option<Vec<Extension>>,
}

/// RFC 3161 / RFC 4210 `PKIStatusInfo`.
#[derive(Clone, Debug, Sequence)]
pub struct PkiStatusInfo {
    /// 0 granted, 1 grantedWithMods, 2 rejection, ...
    pub status: u8,
    /// Free text
    pub status_string: Option<Vec<String>>,
    /// Failure bits
    pub fail_info: Option<BitString>,
}

/// RFC 3161 `TimeStampResp`, the `.tsr` file format.
#[derive(Clone, Debug, Sequence)]
pub struct TimeStampResp {
    /// Status
    pub status: PkiStatusInfo,
    /// Token, present when granted
    pub time_stamp_token: Option<ContentInfo>,
}

/// Decode a DER value held in an [`Any`].
pub fn decode_any<T>(any: &Any) -> Result<T>
where
    T: for<'a> Decode<'a>,
{
    Ok(T::from_der(&any.to_der()?)?)
}

/// SHA-256, the only digest the pipeline computes.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Convert a DER time into UTC.
pub fn to_datetime(time: &Time) -> Option<DateTime<Utc>> {
    unix_to_datetime(time.to_unix_duration())
}

/// Convert a `GeneralizedTime` into UTC.
pub fn generalized_to_datetime(time: &GeneralizedTime) -> Option<DateTime<Utc>> {
    unix_to_datetime(time.to_unix_duration())
}

fn unix_to_datetime(duration: std::time::Duration) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(duration.as_secs()).ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

fn unix_duration(time: DateTime<Utc>) -> Result<std::time::Duration> {
    let secs = u64::try_from(time.timestamp())
        .map_err(|_| Error::InvalidArgument(format!("time before 1970: {}", time)))?;
    Ok(std::time::Duration::from_secs(secs))
}

/// `UTCTime` until 2049, `GeneralizedTime` afterwards.
pub fn time_value(time: DateTime<Utc>) -> Result<Time> {
    let duration = unix_duration(time)?;
    match UtcTime::from_unix_duration(duration) {
        Ok(utc) => Ok(Time::UtcTime(utc)),
        Err(_) => Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(duration)?)),
    }
}

/// Encode a UTC time as `GeneralizedTime`.
pub fn generalized_time(time: DateTime<Utc>) -> Result<GeneralizedTime> {
    Ok(GeneralizedTime::from_unix_duration(unix_duration(time)?)?)
}

fn attribute<T: Tagged + EncodeValue>(oid: ObjectIdentifier, value: &T) -> Result<Attribute> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![Any::encode_from(value)?])?,
    })
}

/// First value of the attribute `oid`, decoded as `T`.
pub fn attribute_value<T>(attributes: &SetOfVec<Attribute>, oid: &ObjectIdentifier) -> Result<Option<T>>
where
    T: for<'a> Decode<'a>,
{
    match attributes.iter().find(|attr| attr.oid == *oid) {
        Some(attr) => match attr.values.iter().next() {
            Some(value) => decode_any(value).map(Some),
            None => Err(Error::Encoding(format!("attribute {} has no value", oid))),
        },
        None => Ok(None),
    }
}

/// CMS signed attributes over `content_digest`.
///
/// The set is `contentType`, `signingTime` (when given), `messageDigest` and
/// `signingCertificateV2` listing the SHA-256 of every certificate in the chain. Its DER
/// encoding is what gets hashed and signed, so the same inputs must always produce
/// the same bytes.
pub fn signed_attributes(
    content_type: ObjectIdentifier,
    content_digest: &[u8],
    chain: &CertificateChain,
    signing_time: Option<DateTime<Utc>>,
) -> Result<SignedAttributes> {
    let mut attributes = vec![
        attribute(ID_CONTENT_TYPE, &content_type)?,
        attribute(ID_MESSAGE_DIGEST, &OctetString::new(content_digest.to_vec())?)?,
    ];
    if let Some(time) = signing_time {
        attributes.push(attribute(ID_SIGNING_TIME, &time_value(time)?)?);
    }

    let certs = chain
        .to_der_certificates()?
        .iter()
        .map(|der| {
            Ok(EssCertIdV2 {
                hash_algorithm: None,
                cert_hash: OctetString::new(sha256(der))?,
                issuer_serial: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    attributes.push(attribute(
        ID_AA_SIGNING_CERTIFICATE_V2,
        &SigningCertificateV2 {
            certs,
            policies: None,
        },
    )?);

    Ok(SetOfVec::try_from(attributes)?)
}

/// Digest of the DER `SET OF Attribute`, the value the signer signs.
pub fn signed_attributes_digest(
    descriptor: &DigestDescriptor,
    attributes: &SignedAttributes,
) -> Result<Vec<u8>> {
    Ok(descriptor.digest(&attributes.to_der()?))
}

/// Build the `SignerInfo` for the chain's leaf certificate.
pub fn signer_info(
    chain: &CertificateChain,
    algorithm: SignatureAlgorithm,
    signed_attrs: SignedAttributes,
    signature: &[u8],
) -> Result<SignerInfo> {
    let leaf = chain
        .leaf()
        .ok_or_else(|| Error::InvalidArgument("certificate chain is empty".to_string()))?;
    Ok(SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: leaf.tbs_certificate.issuer.clone(),
            serial_number: leaf.tbs_certificate.serial_number.clone(),
        }),
        digest_alg: digest_identifier(algorithm.digest_algorithm()),
        signed_attrs: Some(signed_attrs),
        signature_algorithm: AlgorithmIdentifierOwned {
            oid: algorithm.encryption_oid(),
            parameters: Some(Any::null()),
        },
        signature: OctetString::new(signature.to_vec())?,
        unsigned_attrs: None,
    })
}

fn digest_identifier(algorithm: DigestAlgorithm) -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: algorithm.oid(),
        parameters: None,
    }
}

/// Assemble a `SignedData`; `content` is embedded when given.
pub fn signed_data(
    econtent_type: ObjectIdentifier,
    content: Option<&[u8]>,
    chain: &CertificateChain,
    signers: Vec<SignerInfo>,
) -> Result<SignedData> {
    let digest_algorithms = signers
        .iter()
        .map(|signer| signer.digest_alg.clone())
        .collect::<Vec<_>>();
    let mut unique = Vec::new();
    for alg in digest_algorithms {
        if !unique.contains(&alg) {
            unique.push(alg);
        }
    }

    let econtent = match content {
        Some(bytes) => Some(Any::encode_from(&OctetString::new(bytes.to_vec())?)?),
        None => None,
    };

    let certificates = chain
        .certificates()
        .iter()
        .cloned()
        .map(CertificateChoices::Certificate)
        .collect::<Vec<_>>();

    Ok(SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::try_from(unique)?,
        encap_content_info: EncapsulatedContentInfo {
            econtent_type,
            econtent,
        },
        certificates: Some(CertificateSet(SetOfVec::try_from(certificates)?)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::try_from(signers)?),
    })
}

/// Encode a `SignedData` inside its `ContentInfo`.
pub fn encode_signed_data(signed_data: &SignedData) -> Result<Vec<u8>> {
    let info = ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(signed_data)?,
    };
    Ok(info.to_der()?)
}

/// Decode a `SignedData` from its `ContentInfo` wrapping.
pub fn decode_signed_data(bytes: &[u8]) -> Result<SignedData> {
    let info = ContentInfo::from_der(bytes)
        .map_err(|e| Error::Encoding(format!("not a CMS ContentInfo: {}", e)))?;
    signed_data_from_content_info(&info)
}

/// Extract the `SignedData` of a `ContentInfo`.
pub fn signed_data_from_content_info(info: &ContentInfo) -> Result<SignedData> {
    if info.content_type != ID_SIGNED_DATA {
        return Err(Error::Encoding(format!(
            "expected SignedData content, found {}",
            info.content_type
        )));
    }
    decode_any(&info.content).map_err(|e| Error::Encoding(format!("invalid SignedData: {}", e)))
}

/// Embedded content of a `SignedData`, if any.
pub fn embedded_content(signed_data: &SignedData) -> Result<Option<Vec<u8>>> {
    match &signed_data.encap_content_info.econtent {
        Some(any) => {
            let octets: OctetString = decode_any(any)?;
            Ok(Some(octets.into_bytes()))
        },
        None => Ok(None),
    }
}

/// All certificates carried by a `SignedData`.
pub fn certificates(signed_data: &SignedData) -> Vec<&Certificate> {
    signed_data
        .certificates
        .as_ref()
        .map(|set| {
            set.0
                .iter()
                .filter_map(|choice| match choice {
                    CertificateChoices::Certificate(cert) => Some(cert),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Certificate named by a signer's identifier.
pub fn signer_certificate<'a>(
    signed_data: &'a SignedData,
    signer: &SignerInfo,
) -> Option<&'a Certificate> {
    match &signer.sid {
        SignerIdentifier::IssuerAndSerialNumber(id) => {
            certificates(signed_data).into_iter().find(|cert| {
                cert.tbs_certificate.issuer == id.issuer
                    && cert.tbs_certificate.serial_number == id.serial_number
            })
        },
        SignerIdentifier::SubjectKeyIdentifier(id) => certificates(signed_data)
            .into_iter()
            .find(|cert| subject_key_identifier(cert).as_ref() == Some(id)),
    }
}

/// `SubjectKeyIdentifier` extension of a certificate.
pub fn subject_key_identifier(cert: &Certificate) -> Option<SubjectKeyIdentifier> {
    cert.tbs_certificate
        .extensions
        .as_ref()?
        .iter()
        .find(|ext| ext.extn_id == ID_CE_SUBJECT_KEY_IDENTIFIER)
        .and_then(|ext| SubjectKeyIdentifier::from_der(ext.extn_value.as_bytes()).ok())
}

/// Replace the timestamp token attribute of a signer.
pub fn set_timestamp_attribute(signer: &mut SignerInfo, token: &ContentInfo) -> Result<()> {
    let mut attributes: Vec<Attribute> = signer
        .unsigned_attrs
        .take()
        .map(|attrs| attrs.into_vec())
        .unwrap_or_default()
        .into_iter()
        .filter(|attr| attr.oid != ID_AA_TIME_STAMP_TOKEN)
        .collect();
    attributes.push(attribute(ID_AA_TIME_STAMP_TOKEN, token)?);
    signer.unsigned_attrs = Some(SetOfVec::try_from(attributes)?);
    Ok(())
}

/// Timestamp token carried as an unsigned attribute, DER encoded.
pub fn timestamp_attribute(signer: &SignerInfo) -> Result<Option<Vec<u8>>> {
    match &signer.unsigned_attrs {
        Some(attrs) => Ok(attribute_value::<ContentInfo>(attrs, &ID_AA_TIME_STAMP_TOKEN)?
            .map(|info| info.to_der())
            .transpose()?),
        None => Ok(None),
    }
}

/// Rewrite every signer of a `SignedData` with `f`.
pub fn map_signers<F>(signed_data: &mut SignedData, mut f: F) -> Result<()>
where
    F: FnMut(&mut SignerInfo) -> Result<()>,
{
    let mut signers = signed_data.signer_infos.0.clone().into_vec();
    for signer in signers.iter_mut() {
        f(signer)?;
    }
    signed_data.signer_infos = SignerInfos(SetOfVec::try_from(signers)?);
    Ok(())
}

/// A `SignedData` enveloped together with one timestamp token over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedData {
    /// Encoded `SignedData` (`ContentInfo`)
    pub signed_data: Vec<u8>,
    /// Encoded timestamp token (`ContentInfo`)
    pub token: Vec<u8>,
}

impl MarkedData {
    /// Encode as an RFC 5544 `TimeStampedData` `ContentInfo`.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let data = TimeStampedData {
            version: 1,
            data_uri: None,
            content: Some(OctetString::new(self.signed_data.clone())?),
            temporal_evidence: Some(vec![TimeStampAndCrl {
                time_stamp: ContentInfo::from_der(&self.token)?,
                crl: None,
            }]),
        };
        let info = ContentInfo {
            content_type: ID_CT_TIMESTAMPED_DATA,
            content: Any::encode_from(&data)?,
        };
        Ok(info.to_der()?)
    }

    /// Decode from an RFC 5544 `TimeStampedData` `ContentInfo`.
    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let info = ContentInfo::from_der(bytes)
            .map_err(|e| Error::Encoding(format!("not a CMS ContentInfo: {}", e)))?;
        if info.content_type != ID_CT_TIMESTAMPED_DATA {
            return Err(Error::Encoding(format!(
                "expected TimeStampedData content, found {}",
                info.content_type
            )));
        }
        let data: TimeStampedData = decode_any(&info.content)?;
        let signed_data = data
            .content
            .ok_or_else(|| Error::Encoding("TimeStampedData without content".to_string()))?
            .into_bytes();
        let token = data
            .temporal_evidence
            .and_then(|evidence| evidence.into_iter().next())
            .ok_or_else(|| Error::Encoding("TimeStampedData without timestamp".to_string()))?
            .time_stamp
            .to_der()?;
        Ok(Self { signed_data, token })
    }
}

/// Hex rendering of a serial or digest.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
