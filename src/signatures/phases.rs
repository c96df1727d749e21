//! Signature protocol phases.
//!
//! A signature moves through
//! `Empty -> Chain -> Digest -> Signed -> [Marked] -> Finalized -> Verified`.
//! Each phase is its own type wrapping the previous one by value, so a transition
//! that does not exist for the current phase cannot be written, and a phase can never
//! be modified after it has been produced. Accessors of earlier phases are reachable
//! through `Deref`.
//!
//! [`SignaturePhase`] erases the phase type for callers that park a signature between
//! requests; pulling the wrong phase out of it fails with [`Error::ProtocolOrder`].

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

use chrono::{DateTime, Utc};

use super::algorithms::{DigestAlgorithm, SignatureAlgorithm};
use super::level::SecurityLevel;
use super::timestamp::{TimestampInfo, TimestampRequest};
use super::types::{CertificateChain, DigestInfo, SignDisposition};
use crate::error::{Error, Result};

/// A family of signature envelopes sharing one phase protocol.
pub trait SignatureFamily: fmt::Debug + Clone + Send + Sync + 'static {
    /// Family name used in logs.
    const NAME: &'static str;

    /// Where the content lives relative to the signature.
    type Disposition: fmt::Debug + Clone + Copy + PartialEq + Send + Sync;

    /// Result of verifying a signature of this family.
    type Level: fmt::Debug + Clone + Copy + Ord + Send + Sync;
}

/// CMS / PKCS#7 signatures.
#[derive(Debug, Clone)]
pub enum Cms {}

impl SignatureFamily for Cms {
    const NAME: &'static str = "CMS";
    type Disposition = SignDisposition;
    type Level = SecurityLevel;
}

/// Phase 1: algorithms chosen.
#[derive(Debug, Clone)]
pub struct EmptySignature<F: SignatureFamily> {
    signature_algorithm: SignatureAlgorithm,
    digest_algorithm: DigestAlgorithm,
    family: PhantomData<F>,
}

impl<F: SignatureFamily> EmptySignature<F> {
    /// Start a new signature.
    pub fn new(signature_algorithm: SignatureAlgorithm, digest_algorithm: DigestAlgorithm) -> Self {
        Self {
            signature_algorithm,
            digest_algorithm,
            family: PhantomData,
        }
    }

    /// Signature algorithm.
    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.signature_algorithm
    }

    /// Digest algorithm.
    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    /// Capture the signer's certificate chain.
    pub fn to_chain_signature(
        self,
        chain: CertificateChain,
        disposition: F::Disposition,
    ) -> ChainSignature<F> {
        ChainSignature {
            empty: self,
            chain,
            disposition,
        }
    }
}

/// Phase 2: certificate chain and disposition captured.
#[derive(Debug, Clone)]
pub struct ChainSignature<F: SignatureFamily> {
    empty: EmptySignature<F>,
    chain: CertificateChain,
    disposition: F::Disposition,
}

impl<F: SignatureFamily> ChainSignature<F> {
    /// Certificate chain, leaf first.
    pub fn certificate_chain(&self) -> &CertificateChain {
        &self.chain
    }

    /// Content disposition.
    pub fn disposition(&self) -> F::Disposition {
        self.disposition
    }

    /// Record the digest to be signed.
    pub fn to_digest_signature(
        self,
        digest_info: DigestInfo,
        signing_time: Option<DateTime<Utc>>,
    ) -> DigestSignature<F> {
        DigestSignature {
            chain: self,
            digest_info,
            signing_time,
        }
    }
}

impl<F: SignatureFamily> Deref for ChainSignature<F> {
    type Target = EmptySignature<F>;

    fn deref(&self) -> &Self::Target {
        &self.empty
    }
}

/// Phase 3: digest computed, waiting for the external signer.
#[derive(Debug, Clone)]
pub struct DigestSignature<F: SignatureFamily> {
    chain: ChainSignature<F>,
    digest_info: DigestInfo,
    signing_time: Option<DateTime<Utc>>,
}

impl<F: SignatureFamily> DigestSignature<F> {
    /// Digest to hand to the signer.
    pub fn digest_info(&self) -> &DigestInfo {
        &self.digest_info
    }

    /// Signing time captured with the digest.
    pub fn signing_time(&self) -> Option<DateTime<Utc>> {
        self.signing_time
    }

    /// Attach the raw signature returned by the signer.
    pub fn to_signed_signature(
        self,
        signature: Vec<u8>,
        timestamp_request: Option<TimestampRequest>,
    ) -> SignedSignature<F> {
        SignedSignature {
            digest: self,
            signature,
            timestamp_request,
        }
    }
}

impl<F: SignatureFamily> Deref for DigestSignature<F> {
    type Target = ChainSignature<F>;

    fn deref(&self) -> &Self::Target {
        &self.chain
    }
}

/// Phase 4: raw signature bytes attached.
#[derive(Debug, Clone)]
pub struct SignedSignature<F: SignatureFamily> {
    digest: DigestSignature<F>,
    signature: Vec<u8>,
    timestamp_request: Option<TimestampRequest>,
}

impl<F: SignatureFamily> SignedSignature<F> {
    /// Raw signature bytes.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Timestamp to apply after post-sign, if any.
    pub fn timestamp_request(&self) -> Option<&TimestampRequest> {
        self.timestamp_request.as_ref()
    }

    /// Open the signature for timestamps.
    pub fn to_marked_signature(self) -> MarkedSignature<F> {
        MarkedSignature {
            signed: self,
            timestamps: Vec::new(),
        }
    }

    /// Finish without timestamps.
    pub fn finalize(self) -> FinalizedSignature<F> {
        FinalizedSignature {
            signed: self,
            timestamps: Vec::new(),
        }
    }
}

impl<F: SignatureFamily> Deref for SignedSignature<F> {
    type Target = DigestSignature<F>;

    fn deref(&self) -> &Self::Target {
        &self.digest
    }
}

/// Phase 5: timestamps being applied.
#[derive(Debug, Clone)]
pub struct MarkedSignature<F: SignatureFamily> {
    signed: SignedSignature<F>,
    timestamps: Vec<TimestampInfo>,
}

impl<F: SignatureFamily> MarkedSignature<F> {
    /// Timestamps applied so far.
    pub fn timestamps(&self) -> &[TimestampInfo] {
        &self.timestamps
    }

    /// Record one more applied timestamp.
    pub fn append_timestamp(mut self, timestamp: TimestampInfo) -> Self {
        self.timestamps.push(timestamp);
        self
    }

    /// Finish with the timestamps applied so far.
    pub fn finalize(self) -> FinalizedSignature<F> {
        FinalizedSignature {
            signed: self.signed,
            timestamps: self.timestamps,
        }
    }
}

impl<F: SignatureFamily> Deref for MarkedSignature<F> {
    type Target = SignedSignature<F>;

    fn deref(&self) -> &Self::Target {
        &self.signed
    }
}

/// Phase 6: terminal for signing.
#[derive(Debug, Clone)]
pub struct FinalizedSignature<F: SignatureFamily> {
    signed: SignedSignature<F>,
    timestamps: Vec<TimestampInfo>,
}

impl<F: SignatureFamily> FinalizedSignature<F> {
    /// Timestamps applied before finalization.
    pub fn timestamps(&self) -> &[TimestampInfo] {
        &self.timestamps
    }

    /// Record the verification outcome.
    pub fn to_verified_signature(self, level: F::Level) -> VerifiedSignature<F> {
        VerifiedSignature {
            finalized: self,
            level,
        }
    }
}

impl<F: SignatureFamily> Deref for FinalizedSignature<F> {
    type Target = SignedSignature<F>;

    fn deref(&self) -> &Self::Target {
        &self.signed
    }
}

/// Phase 7: verification outcome attached.
#[derive(Debug, Clone)]
pub struct VerifiedSignature<F: SignatureFamily> {
    finalized: FinalizedSignature<F>,
    level: F::Level,
}

impl<F: SignatureFamily> VerifiedSignature<F> {
    /// Verification outcome.
    pub fn level(&self) -> F::Level {
        self.level
    }
}

impl<F: SignatureFamily> Deref for VerifiedSignature<F> {
    type Target = FinalizedSignature<F>;

    fn deref(&self) -> &Self::Target {
        &self.finalized
    }
}

/// Any phase, with the type erased.
#[derive(Debug, Clone)]
pub enum SignaturePhase<F: SignatureFamily> {
    /// See [`EmptySignature`]
    Empty(EmptySignature<F>),
    /// See [`ChainSignature`]
    Chain(ChainSignature<F>),
    /// See [`DigestSignature`]
    Digest(DigestSignature<F>),
    /// See [`SignedSignature`]
    Signed(SignedSignature<F>),
    /// See [`MarkedSignature`]
    Marked(MarkedSignature<F>),
    /// See [`FinalizedSignature`]
    Finalized(FinalizedSignature<F>),
    /// See [`VerifiedSignature`]
    Verified(VerifiedSignature<F>),
}

macro_rules! erased_phase {
    ($variant:ident, $ty:ident, $into:ident) => {
        impl<F: SignatureFamily> From<$ty<F>> for SignaturePhase<F> {
            fn from(phase: $ty<F>) -> Self {
                SignaturePhase::$variant(phase)
            }
        }

        impl<F: SignatureFamily> SignaturePhase<F> {
            #[doc = concat!("Take the phase out as [`", stringify!($ty), "`].")]
            pub fn $into(self) -> Result<$ty<F>> {
                match self {
                    SignaturePhase::$variant(phase) => Ok(phase),
                    other => Err(Error::ProtocolOrder {
                        expected: stringify!($variant),
                        found: other.name(),
                    }),
                }
            }
        }
    };
}

erased_phase!(Empty, EmptySignature, into_empty);
erased_phase!(Chain, ChainSignature, into_chain);
erased_phase!(Digest, DigestSignature, into_digest);
erased_phase!(Signed, SignedSignature, into_signed);
erased_phase!(Marked, MarkedSignature, into_marked);
erased_phase!(Finalized, FinalizedSignature, into_finalized);
erased_phase!(Verified, VerifiedSignature, into_verified);

impl<F: SignatureFamily> SignaturePhase<F> {
    /// Name of the held phase.
    pub fn name(&self) -> &'static str {
        match self {
            SignaturePhase::Empty(_) => "Empty",
            SignaturePhase::Chain(_) => "Chain",
            SignaturePhase::Digest(_) => "Digest",
            SignaturePhase::Signed(_) => "Signed",
            SignaturePhase::Marked(_) => "Marked",
            SignaturePhase::Finalized(_) => "Finalized",
            SignaturePhase::Verified(_) => "Verified",
        }
    }
}
