//! Signature service: pre-sign, post-sign, timestamp application and verification.
//!
//! The service drives a signature through its phases. The private-key operation is
//! not part of it: between [`SignatureService::pre_sign`] and
//! [`SignatureService::post_sign`] the caller takes the digest to an
//! [`ExternalSigner`](super::ExternalSigner) and attaches the result with
//! [`DigestSignature::to_signed_signature`].
//!
//! Outputs are written as soon as they are ready. If a later step fails (typically
//! the timestamp authority), outputs already written are not rolled back.

use std::fmt;
use std::io::{Read, Write};

use chrono::{TimeZone, Utc};
use cms::signed_data::SignedData;
use der::Encode;

use super::algorithms::AlgorithmRegistry;
use super::envelope::{self, MarkedData, ID_DATA};
use super::level::SecurityLevel;
use super::phases::{
    ChainSignature, Cms, DigestSignature, EmptySignature, FinalizedSignature, SignatureFamily,
    SignedSignature,
};
use super::timestamp::{
    self, TimestampAuthority, TimestampDisposition, TimestampInfo, TimestampRequest,
    TimestampToken,
};
use super::types::{DigestInfo, SignDisposition, TimestampReport, VerifyInfo};
use super::verifier::SignatureVerifier;
use crate::config::{CryptoProvider, SignatureConfig};
use crate::error::{Error, Result};

/// Where post-sign writes its results.
#[derive(Default)]
pub struct PostSignOutputs<'a> {
    /// SignedData without content (required for `Detached`)
    pub detached: Option<&'a mut dyn Write>,
    /// SignedData with content (required for `Embedded`)
    pub embedded: Option<&'a mut dyn Write>,
    /// Raw timestamp token, optional
    pub timestamp: Option<&'a mut dyn Write>,
    /// Timestamped envelope (required when a timestamp is requested)
    pub marked: Option<&'a mut dyn Write>,
}

impl<'a> PostSignOutputs<'a> {
    /// Write the detached SignedData to `out`.
    pub fn with_detached(mut self, out: &'a mut dyn Write) -> Self {
        self.detached = Some(out);
        self
    }

    /// Write the embedded SignedData to `out`.
    pub fn with_embedded(mut self, out: &'a mut dyn Write) -> Self {
        self.embedded = Some(out);
        self
    }

    /// Write the raw timestamp token to `out`.
    pub fn with_timestamp(mut self, out: &'a mut dyn Write) -> Self {
        self.timestamp = Some(out);
        self
    }

    /// Write the timestamped envelope to `out`.
    pub fn with_marked(mut self, out: &'a mut dyn Write) -> Self {
        self.marked = Some(out);
        self
    }
}

/// Encoded signatures a timestamp can be applied to.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampSources<'a> {
    /// Content of a detached signature
    pub content: Option<&'a [u8]>,
    /// Detached SignedData
    pub detached_signature: Option<&'a [u8]>,
    /// SignedData with embedded content
    pub embedded_signature: Option<&'a [u8]>,
}

/// Where timestamp application writes its results.
#[derive(Default)]
pub struct TimestampOutputs<'a> {
    /// Raw timestamp token, optional
    pub timestamp: Option<&'a mut dyn Write>,
    /// Timestamped envelope, required
    pub marked: Option<&'a mut dyn Write>,
}

/// Signature lifecycle operations of one signature family.
pub trait SignatureService {
    /// Signature family handled.
    type Family: SignatureFamily;

    /// Compute the digest the external signer has to sign.
    fn pre_sign(
        &self,
        chain: ChainSignature<Self::Family>,
        content: &mut dyn Read,
    ) -> Result<DigestSignature<Self::Family>>;

    /// Assemble the envelope around the raw signature and apply a requested timestamp.
    fn post_sign(
        &self,
        signed: SignedSignature<Self::Family>,
        content: &mut dyn Read,
        outputs: PostSignOutputs<'_>,
    ) -> Result<FinalizedSignature<Self::Family>>;

    /// Timestamp an existing envelope; returns the token of the last signer processed.
    fn apply_timestamp(
        &self,
        request: &TimestampRequest,
        sources: TimestampSources<'_>,
        outputs: TimestampOutputs<'_>,
    ) -> Result<TimestampToken>;

    /// Verify an envelope and release its content when it reaches `required`.
    fn verify(
        &self,
        content: Option<&mut dyn Read>,
        timestamp_response: Option<&mut dyn Read>,
        envelope: &mut dyn Read,
        required: SecurityLevel,
        content_out: &mut dyn Write,
    ) -> Result<VerifyInfo>;
}

/// Envelope shapes, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopeShape {
    Marked,
    Embedded,
    Detached,
}

impl fmt::Display for EnvelopeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnvelopeShape::Marked => "MARKED",
            EnvelopeShape::Embedded => "EMBEDDED",
            EnvelopeShape::Detached => "DETACHED",
        })
    }
}

/// A recognized envelope.
struct ParsedEnvelope {
    shape: EnvelopeShape,
    signed_data: SignedData,
    /// Encoded SignedData the signers live in
    signed_bytes: Vec<u8>,
    content: Vec<u8>,
    enveloping_token: Option<Vec<u8>>,
}

type EnvelopeAttempt = fn(&[u8], Option<&[u8]>) -> Result<ParsedEnvelope>;

const ENVELOPE_ATTEMPTS: [(EnvelopeShape, EnvelopeAttempt); 3] = [
    (EnvelopeShape::Marked, parse_marked),
    (EnvelopeShape::Embedded, parse_embedded),
    (EnvelopeShape::Detached, parse_detached),
];

fn parse_marked(bytes: &[u8], content: Option<&[u8]>) -> Result<ParsedEnvelope> {
    let marked = MarkedData::from_der(bytes)?;
    let inner = parse_embedded(&marked.signed_data, content)
        .or_else(|_| parse_detached(&marked.signed_data, content))?;
    Ok(ParsedEnvelope {
        shape: EnvelopeShape::Marked,
        enveloping_token: Some(marked.token),
        ..inner
    })
}

fn parse_embedded(bytes: &[u8], _content: Option<&[u8]>) -> Result<ParsedEnvelope> {
    let signed_data = envelope::decode_signed_data(bytes)?;
    let content = envelope::embedded_content(&signed_data)?
        .ok_or_else(|| Error::Encoding("SignedData carries no content".to_string()))?;
    Ok(ParsedEnvelope {
        shape: EnvelopeShape::Embedded,
        signed_data,
        signed_bytes: bytes.to_vec(),
        content,
        enveloping_token: None,
    })
}

fn parse_detached(bytes: &[u8], content: Option<&[u8]>) -> Result<ParsedEnvelope> {
    let signed_data = envelope::decode_signed_data(bytes)?;
    let content = content.ok_or_else(|| {
        Error::InvalidArgument("detached SignedData needs the content".to_string())
    })?;
    Ok(ParsedEnvelope {
        shape: EnvelopeShape::Detached,
        signed_data,
        signed_bytes: bytes.to_vec(),
        content: content.to_vec(),
        enveloping_token: None,
    })
}

/// Try every envelope shape in order; the first that parses wins.
fn sniff_envelope(bytes: &[u8], content: Option<&[u8]>) -> Result<ParsedEnvelope> {
    let mut failures = Vec::new();
    for (shape, attempt) in ENVELOPE_ATTEMPTS {
        match attempt(bytes, content) {
            Ok(parsed) => {
                log::debug!("Envelope recognized as {}", shape);
                return Ok(parsed);
            },
            Err(e) => {
                log::debug!("Envelope is not {}: {}", shape, e);
                failures.push(format!("{}: {}", shape, e));
            },
        }
    }
    Err(Error::UnreadableEnvelope(failures.join("; ")))
}

fn read_all(reader: &mut dyn Read) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

/// CMS implementation of [`SignatureService`].
pub struct CmsSignatureService {
    config: SignatureConfig,
    registry: AlgorithmRegistry,
    verifier: SignatureVerifier,
    timestamp_authority: Option<Box<dyn TimestampAuthority>>,
}

impl CmsSignatureService {
    /// Service with default configuration and no trusted roots.
    pub fn new(provider: &CryptoProvider) -> Self {
        let registry = AlgorithmRegistry::new(provider);
        Self {
            config: SignatureConfig::default(),
            verifier: SignatureVerifier::new(registry.clone()),
            registry,
            timestamp_authority: None,
        }
    }

    /// Service configured from `config`, loading its trusted roots.
    pub fn from_config(provider: &CryptoProvider, config: SignatureConfig) -> Result<Self> {
        let mut service = Self::new(provider);
        service.verifier.add_trusted_roots(config.load_trusted_roots()?)?;
        log::info!(
            "Signature service ready: {} trusted root(s), required level {}",
            service.verifier.trusted_root_count(),
            config.required_level
        );
        service.config = config;
        Ok(service)
    }

    /// Use `tsa` to obtain and check timestamps.
    pub fn with_timestamp_authority(mut self, tsa: impl TimestampAuthority + 'static) -> Self {
        self.timestamp_authority = Some(Box::new(tsa));
        self
    }

    /// Trust an additional root certificate (DER).
    pub fn add_trusted_root(&mut self, cert_der: &[u8]) -> Result<()> {
        self.verifier.add_trusted_root(cert_der)
    }

    /// Active configuration.
    pub fn config(&self) -> &SignatureConfig {
        &self.config
    }

    /// Start a signature with the configured algorithms.
    pub fn new_signature(&self) -> EmptySignature<Cms> {
        EmptySignature::new(self.config.signature_algorithm, self.config.digest_algorithm)
    }

    /// Timestamp request with the configured imprint digest.
    pub fn timestamp_request(&self, disposition: TimestampDisposition) -> TimestampRequest {
        TimestampRequest::new(disposition).with_digest_algorithm(self.config.timestamp_digest_algorithm)
    }

    fn timestamp_authority(&self) -> Result<&dyn TimestampAuthority> {
        self.timestamp_authority
            .as_deref()
            .ok_or_else(|| Error::Configuration("no timestamp authority configured".to_string()))
    }

    /// Checks that do not need any I/O before a timestamp is applied.
    fn check_timestamp_request(&self, request: &TimestampRequest, has_marked_output: bool) -> Result<()> {
        if request.disposition == TimestampDisposition::Detached {
            return Err(Error::UnsupportedDisposition(
                "DETACHED timestamps cannot be applied".to_string(),
            ));
        }
        self.registry.digest(request.digest_algorithm)?;
        self.timestamp_authority()?;
        if !has_marked_output {
            return Err(Error::InvalidArgument(format!(
                "{} timestamp requires a marked output",
                request.disposition.as_str()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for CmsSignatureService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmsSignatureService")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("trusted_roots", &self.verifier.trusted_root_count())
            .field("timestamp_authority", &self.timestamp_authority.is_some())
            .finish()
    }
}

impl SignatureService for CmsSignatureService {
    type Family = Cms;

    fn pre_sign(
        &self,
        chain: ChainSignature<Cms>,
        content: &mut dyn Read,
    ) -> Result<DigestSignature<Cms>> {
        let descriptor = self.registry.digest(chain.digest_algorithm())?;
        if chain.signature_algorithm().digest_algorithm() != chain.digest_algorithm() {
            return Err(Error::Configuration(format!(
                "{} does not use {}",
                chain.signature_algorithm(),
                chain.digest_algorithm()
            )));
        }
        if chain.certificate_chain().is_empty() {
            return Err(Error::InvalidArgument("certificate chain is empty".to_string()));
        }

        let content = read_all(content)?;
        let signing_time = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .ok_or_else(|| Error::InvalidArgument("system clock out of range".to_string()))?;
        let attrs = envelope::signed_attributes(
            ID_DATA,
            &descriptor.digest(&content),
            chain.certificate_chain(),
            Some(signing_time),
        )?;
        let digest = envelope::signed_attributes_digest(descriptor, &attrs)?;

        log::info!(
            "{} pre-sign: {} bytes of content, {} certificate(s), signing time {}",
            Cms::NAME,
            content.len(),
            chain.certificate_chain().len(),
            signing_time
        );
        let digest_info = DigestInfo::new(descriptor.algorithm, digest);
        Ok(chain.to_digest_signature(digest_info, Some(signing_time)))
    }

    fn post_sign(
        &self,
        signed: SignedSignature<Cms>,
        content: &mut dyn Read,
        mut outputs: PostSignOutputs<'_>,
    ) -> Result<FinalizedSignature<Cms>> {
        self.registry.signature(signed.signature_algorithm()).map_err(|_| {
            Error::Unsupported(format!(
                "signature algorithm {} is not supported",
                signed.signature_algorithm()
            ))
        })?;
        match signed.disposition() {
            SignDisposition::Detached if outputs.detached.is_none() => {
                return Err(Error::InvalidArgument(
                    "DETACHED signature requires a detached output".to_string(),
                ));
            },
            SignDisposition::Embedded if outputs.embedded.is_none() => {
                return Err(Error::InvalidArgument(
                    "EMBEDDED signature requires an embedded output".to_string(),
                ));
            },
            _ => {},
        }
        if let Some(request) = signed.timestamp_request() {
            self.check_timestamp_request(request, outputs.marked.is_some())?;
        }

        let content = read_all(content)?;
        let descriptor = self.registry.digest(signed.digest_algorithm())?;
        let attrs = envelope::signed_attributes(
            ID_DATA,
            &descriptor.digest(&content),
            signed.certificate_chain(),
            signed.signing_time(),
        )?;
        if envelope::signed_attributes_digest(descriptor, &attrs)? != signed.digest_info().digest {
            return Err(Error::InvalidArgument(
                "content differs from the content digested at pre-sign".to_string(),
            ));
        }

        let signer_info = envelope::signer_info(
            signed.certificate_chain(),
            signed.signature_algorithm(),
            attrs,
            signed.signature(),
        )?;
        let embedded = signed.disposition() == SignDisposition::Embedded;
        let signed_data = envelope::signed_data(
            ID_DATA,
            embedded.then_some(content.as_slice()),
            signed.certificate_chain(),
            vec![signer_info],
        )?;
        let encoded = envelope::encode_signed_data(&signed_data)?;

        let out = if embedded {
            outputs.embedded.as_mut()
        } else {
            outputs.detached.as_mut()
        };
        if let Some(out) = out {
            out.write_all(&encoded)?;
            out.flush()?;
        }
        log::info!(
            "Post-sign: {} SignedData, {} bytes",
            signed.disposition().as_str(),
            encoded.len()
        );

        let request = match signed.timestamp_request() {
            Some(request) => *request,
            None => return Ok(signed.finalize()),
        };
        let sources = if embedded {
            TimestampSources {
                embedded_signature: Some(&encoded),
                ..TimestampSources::default()
            }
        } else {
            TimestampSources {
                content: Some(&content),
                detached_signature: Some(&encoded),
                ..TimestampSources::default()
            }
        };
        let token = self.apply_timestamp(
            &request,
            sources,
            TimestampOutputs {
                timestamp: outputs.timestamp,
                marked: outputs.marked,
            },
        )?;
        Ok(signed
            .to_marked_signature()
            .append_timestamp(TimestampInfo {
                disposition: request.disposition,
                token,
            })
            .finalize())
    }

    fn apply_timestamp(
        &self,
        request: &TimestampRequest,
        sources: TimestampSources<'_>,
        outputs: TimestampOutputs<'_>,
    ) -> Result<TimestampToken> {
        self.check_timestamp_request(request, outputs.marked.is_some())?;
        let tsa = self.timestamp_authority()?;

        let signed_bytes = match (sources.embedded_signature, sources.detached_signature) {
            (Some(embedded), _) => embedded,
            (None, Some(detached)) => {
                if sources.content.is_none() {
                    return Err(Error::InvalidArgument(
                        "detached signature needs its content".to_string(),
                    ));
                }
                detached
            },
            (None, None) => {
                return Err(Error::InvalidArgument(
                    "no signature to timestamp".to_string(),
                ));
            },
        };
        let mut signed_data = envelope::decode_signed_data(signed_bytes)?;

        let (marked, token) = match request.disposition {
            TimestampDisposition::Enveloping => {
                let (marked, token) =
                    timestamp::apply_enveloping(tsa, &self.registry, request, signed_bytes)?;
                (marked.to_der()?, token)
            },
            TimestampDisposition::Attribute => {
                let tokens =
                    timestamp::apply_attribute(tsa, &self.registry, request, &mut signed_data)?;
                let token = tokens.into_iter().last().ok_or_else(|| {
                    Error::InvalidArgument("SignedData has no signers".to_string())
                })?;
                (envelope::encode_signed_data(&signed_data)?, token)
            },
            TimestampDisposition::Detached => {
                return Err(Error::UnsupportedDisposition(
                    "DETACHED timestamps cannot be applied".to_string(),
                ));
            },
        };

        if let Some(out) = outputs.marked {
            out.write_all(&marked)?;
            out.flush()?;
        }
        if let Some(out) = outputs.timestamp {
            out.write_all(&token.encoded)?;
            out.flush()?;
        }
        log::info!(
            "{} timestamp applied at {}",
            request.disposition.as_str(),
            token.gen_time
        );
        Ok(token)
    }

    fn verify(
        &self,
        content: Option<&mut dyn Read>,
        timestamp_response: Option<&mut dyn Read>,
        envelope: &mut dyn Read,
        required: SecurityLevel,
        content_out: &mut dyn Write,
    ) -> Result<VerifyInfo> {
        let envelope_bytes = read_all(envelope)?;
        let content = content.map(read_all).transpose()?;
        let response = timestamp_response.map(read_all).transpose()?;
        let tsa = self.timestamp_authority.as_deref();

        let parsed = sniff_envelope(&envelope_bytes, content.as_deref())?;

        let mut external = Vec::new();
        if let Some(token) = &parsed.enveloping_token {
            external.push(self.verifier.check_timestamp(
                token,
                &parsed.signed_bytes,
                TimestampDisposition::Enveloping,
                tsa,
            ));
        }
        if let Some(response) = response {
            let report = match TimestampToken::from_response(&response)
                .or_else(|_| TimestampToken::from_der(&response))
            {
                Ok(token) => self.verifier.check_timestamp(
                    &token.encoded,
                    &envelope_bytes,
                    TimestampDisposition::Detached,
                    tsa,
                ),
                Err(e) => TimestampReport {
                    disposition: TimestampDisposition::Detached,
                    timestamp: None,
                    level: SecurityLevel::Invalid,
                    messages: vec![format!("unreadable timestamp response: {}", e)],
                },
            };
            external.push(report);
        }

        let signers =
            self.verifier
                .verify_signed_data(&parsed.signed_data, &parsed.content, &external, tsa);
        let min_level = SecurityLevel::aggregate(signers.iter().map(|signer| signer.level));

        let content_released = min_level.satisfies(required);
        if content_released {
            content_out.write_all(&parsed.content)?;
            content_out.flush()?;
        } else {
            log::warn!(
                "Content withheld: level {} is below required {}",
                min_level,
                required
            );
        }
        log::info!(
            "Verified {} envelope: {} signer(s), level {}",
            parsed.shape,
            signers.len(),
            min_level
        );

        Ok(VerifyInfo {
            envelope: parsed.shape.to_string(),
            signers,
            external_timestamps: external,
            min_level,
            content_released,
        })
    }
}
