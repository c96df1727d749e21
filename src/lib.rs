// Allow some clippy lints that are too pedantic for this project
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::wrong_self_convention)]
// Allow unused for tests
#![cfg_attr(test, allow(dead_code))]
#![cfg_attr(test, allow(unused_variables))]

//! # CMS Seal
//!
//! Long-term digital signatures over arbitrary content, following CMS/PKCS#7 envelope
//! conventions, with optional RFC 3161 timestamps.
//!
//! ## Core Features
//!
//! ### Signing
//! - **Phase pipeline**: Empty → Chain → Digest → Signed → Marked → Finalized, one type
//!   per phase, so steps cannot be skipped or reordered
//! - **External signer handoff**: the digest leaves the library, a smart card or HSM
//!   signs it, the raw signature comes back
//! - **Envelopes**: detached or embedded SignedData with CAdES signed attributes
//!
//! ### Timestamping
//! - **Enveloping**: SignedData and token together in an RFC 5544 TimeStampedData
//! - **Attribute**: one token per signer as an unsigned attribute
//! - **Local TSA**: in-process authority for tests and self-hosted deployments
//!
//! ### Verification
//! - **Shape sniffing**: MarkedData, embedded and detached SignedData tried in order
//! - **Security levels**: INVALID < VALID < TRUSTED per signer, aggregated by minimum
//! - **Content gate**: content is released only at or above the required level
//!
//! ## Quick Start
//!
//! ```ignore
//! use cms_seal::config::CryptoProvider;
//! use cms_seal::signatures::{CmsSignatureService, SignatureService, SecurityLevel};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = CryptoProvider::register();
//! let service = CmsSignatureService::new(&provider);
//!
//! let envelope = std::fs::read("document.p7m")?;
//! let mut content = Vec::new();
//! let info = service.verify(None, None, &mut envelope.as_slice(), SecurityLevel::Valid, &mut content)?;
//! println!("{}", info.to_json()?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

// Error handling
pub mod error;

// Configuration
pub mod config;

// Signing, timestamping and verification
pub mod signatures;

pub use error::{Error, Result};
