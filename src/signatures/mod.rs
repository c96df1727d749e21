//! CMS Digital Signatures module.
//!
//! This module issues and verifies long-term CMS/PKCS#7 signatures over arbitrary
//! content, optionally bound to an RFC 3161 timestamp.
//!
//! ## Features
//!
//! - **Signing pipeline**: type-state phases from algorithm choice to finalized envelope
//! - **External signing**: the private-key operation is handed to an [`ExternalSigner`]
//! - **Timestamps**: enveloping (`.tsa`) and per-signer attribute (`.m7m`) timestamps
//! - **Verification**: per-signer [`SecurityLevel`] with a worst-case aggregate
//!
//! ## Envelope Shapes
//!
//! - SignedData without content (DETACHED, `.p7m`)
//! - SignedData with content (EMBEDDED, `.p7m`)
//! - TimeStampedData around a SignedData (MarkedData, `.tsa`)
//! - SignedData with timestamp attributes (`.m7m`)
//!
//! ## Example
//!
//! ```ignore
//! use cms_seal::config::CryptoProvider;
//! use cms_seal::signatures::*;
//!
//! let provider = CryptoProvider::register();
//! let service = CmsSignatureService::new(&provider);
//!
//! let chain = service
//!     .new_signature()
//!     .to_chain_signature(credentials.chain.clone(), SignDisposition::Embedded);
//! let digest = service.pre_sign(chain, &mut content.as_slice())?;
//! let raw = credentials.signer.sign(digest.signature_algorithm(), digest.digest_info())?;
//!
//! let mut p7m = Vec::new();
//! service.post_sign(
//!     digest.to_signed_signature(raw, None),
//!     &mut content.as_slice(),
//!     PostSignOutputs::default().with_embedded(&mut p7m),
//! )?;
//! ```
//!
//! ## Standards Reference
//!
//! - RFC 5652 - Cryptographic Message Syntax
//! - RFC 5035 - ESS signingCertificateV2
//! - RFC 3161 - Time-Stamp Protocol
//! - RFC 5544 - TimeStampedData

mod algorithms;
pub mod envelope;
mod level;
mod phases;
mod service;
mod signer;
mod timestamp;
mod tsa;
mod types;
mod verifier;

pub use algorithms::{
    AlgorithmRegistry, DigestAlgorithm, DigestDescriptor, SignatureAlgorithm, SignatureDescriptor,
};
pub use envelope::MarkedData;
pub use level::SecurityLevel;
pub use phases::{
    ChainSignature, Cms, DigestSignature, EmptySignature, FinalizedSignature, MarkedSignature,
    SignatureFamily, SignaturePhase, SignedSignature, VerifiedSignature,
};
pub use service::{
    CmsSignatureService, PostSignOutputs, SignatureService, TimestampOutputs, TimestampSources,
};
pub use signer::{ExternalSigner, SigningCredentials, SoftwareSigner};
pub use timestamp::{
    MessageImprint, TimestampAuthority, TimestampDisposition, TimestampInfo, TimestampRequest,
    TimestampToken, VerifiedTimestamp,
};
pub use tsa::LocalTimestampAuthority;
pub use types::{
    CertificateChain, CertificateSource, DigestInfo, PemFileSource, SignDisposition,
    SignerVerification, TimestampReport, VerifyInfo,
};
pub use verifier::SignatureVerifier;
