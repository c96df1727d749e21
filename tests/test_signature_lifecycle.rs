//! Integration tests for the signing pipeline and verification.
//!
//! Covers:
//! - Embedded and detached signatures through pre-sign, external signing and post-sign
//! - Per-signer levels, aggregation and the content release gate
//! - Chains anchored in a trusted root
//! - Failures raised before any I/O

use cms::signed_data::SignerIdentifier;
use cms_seal::config::{CryptoProvider, SignatureConfig};
use cms_seal::signatures::envelope::{self, ID_DATA};
use cms_seal::signatures::{
    CertificateChain, CertificateSource, Cms, CmsSignatureService, DigestAlgorithm, EmptySignature,
    ExternalSigner, PemFileSource, PostSignOutputs, SecurityLevel, SignDisposition,
    SignatureAlgorithm, SignaturePhase, SignatureService, SigningCredentials, SoftwareSigner,
};
use cms_seal::Error;
use proptest::prelude::*;
use std::io::{self, Read};
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn credentials(key: &str, chain: &str) -> SigningCredentials {
    SigningCredentials::from_files(fixture(key), fixture(chain)).unwrap()
}

fn alice() -> SigningCredentials {
    credentials("alice.key.der", "alice.crt.pem")
}

fn service() -> CmsSignatureService {
    CmsSignatureService::new(&CryptoProvider::register())
}

/// Run the whole pipeline and return the encoded SignedData.
fn sign(
    service: &CmsSignatureService,
    credentials: &SigningCredentials,
    content: &[u8],
    disposition: SignDisposition,
) -> Vec<u8> {
    let chain = service
        .new_signature()
        .to_chain_signature(credentials.chain.clone(), disposition);
    let digest = service.pre_sign(chain, &mut &content[..]).unwrap();
    let raw = credentials
        .signer
        .sign(digest.signature_algorithm(), digest.digest_info())
        .unwrap();

    let mut out = Vec::new();
    let outputs = match disposition {
        SignDisposition::Embedded => PostSignOutputs::default().with_embedded(&mut out),
        SignDisposition::Detached => PostSignOutputs::default().with_detached(&mut out),
    };
    service
        .post_sign(digest.to_signed_signature(raw, None), &mut &content[..], outputs)
        .unwrap();
    out
}

/// Reader that fails the test if anything reads from it.
struct UntouchedReader;

impl Read for UntouchedReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        panic!("content must not be read");
    }
}

mod embedded_tests {
    use super::*;

    #[test]
    fn test_hello_world_embedded() {
        let service = service();
        let p7m = sign(&service, &alice(), b"hello world", SignDisposition::Embedded);

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out)
            .unwrap();

        assert_eq!(info.envelope, "EMBEDDED");
        assert_eq!(info.signers.len(), 1);
        assert_eq!(info.signers[0].level, SecurityLevel::Valid);
        assert_eq!(info.min_level, SecurityLevel::Valid);
        assert!(info.content_released);
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_signer_details_reported() {
        let service = service();
        let p7m = sign(&service, &alice(), b"report me", SignDisposition::Embedded);

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out)
            .unwrap();

        let signer = &info.signers[0];
        assert!(signer.signer_subject.as_deref().unwrap().contains("Alice Signer"));
        assert_eq!(signer.signature_algorithm, Some(SignatureAlgorithm::Sha256WithRsa));
        assert!(signer.signing_time.is_some());
        assert!(signer.attribute_timestamp.is_none());

        let phase = signer.signature.as_ref().unwrap();
        assert_eq!(phase.level(), SecurityLevel::Valid);
        assert_eq!(phase.disposition(), SignDisposition::Embedded);
        assert!(phase.timestamps().is_empty());
    }

    #[test]
    fn test_json_report() {
        let service = service();
        let p7m = sign(&service, &alice(), b"hello world", SignDisposition::Embedded);

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out)
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&info.to_json().unwrap()).unwrap();

        assert_eq!(json["min_level"], "VALID");
        assert_eq!(json["signers"][0]["level"], "VALID");
        assert_eq!(json["content_released"], true);
    }

    #[test]
    fn test_pkcs1_key_signs() {
        let service = service();
        let bob = credentials("bob.key.rsa.der", "bob.crt.pem");
        let p7m = sign(&service, &bob, b"pkcs1", SignDisposition::Embedded);

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out)
            .unwrap();
        assert_eq!(info.min_level, SecurityLevel::Valid);
    }

    #[test]
    fn test_level_below_required_withholds_content() {
        let service = service();
        let p7m = sign(&service, &alice(), b"secret", SignDisposition::Embedded);

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Trusted, &mut out)
            .unwrap();

        assert_eq!(info.min_level, SecurityLevel::Valid);
        assert!(!info.content_released);
        assert!(out.is_empty());
    }
}

mod detached_tests {
    use super::*;

    #[test]
    fn test_detached_needs_content() {
        let service = service();
        let content = b"detached content".to_vec();
        let p7m = sign(&service, &alice(), &content, SignDisposition::Detached);

        let mut out = Vec::new();
        let result = service.verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out);
        assert!(matches!(result, Err(Error::UnreadableEnvelope(_))));

        let info = service
            .verify(
                Some(&mut content.as_slice()),
                None,
                &mut p7m.as_slice(),
                SecurityLevel::Valid,
                &mut out,
            )
            .unwrap();
        assert_eq!(info.envelope, "DETACHED");
        assert_eq!(info.min_level, SecurityLevel::Valid);
        assert_eq!(out, content);
    }

    #[test]
    fn test_detached_envelope_has_no_content() {
        let service = service();
        let p7m = sign(&service, &alice(), b"not inside", SignDisposition::Detached);
        let signed_data = envelope::decode_signed_data(&p7m).unwrap();
        assert!(envelope::embedded_content(&signed_data).unwrap().is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_flipped_content_byte_is_invalid(index in 0usize..32, mask in 1u8..=255) {
            let service = service();
            let content = b"thirty-two bytes of signed data!".to_vec();
            let p7m = sign(&service, &alice(), &content, SignDisposition::Detached);

            let mut tampered = content.clone();
            tampered[index] ^= mask;

            let mut out = Vec::new();
            let info = service
                .verify(
                    Some(&mut tampered.as_slice()),
                    None,
                    &mut p7m.as_slice(),
                    SecurityLevel::Valid,
                    &mut out,
                )
                .unwrap();

            prop_assert_eq!(info.signers[0].level, SecurityLevel::Invalid);
            prop_assert_eq!(info.min_level, SecurityLevel::Invalid);
            prop_assert!(!info.content_released);
            prop_assert!(out.is_empty());
        }

        #[test]
        fn test_flipped_embedded_byte_is_invalid(index in 0usize..32, mask in 1u8..=255) {
            let service = service();
            let content = b"thirty-two bytes of signed data!".to_vec();
            let mut p7m = sign(&service, &alice(), &content, SignDisposition::Embedded);

            let start = p7m
                .windows(content.len())
                .position(|window| window == content.as_slice())
                .unwrap();
            p7m[start + index] ^= mask;

            let mut out = Vec::new();
            let info = service
                .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out)
                .unwrap();

            prop_assert_eq!(info.envelope.as_str(), "EMBEDDED");
            prop_assert_eq!(info.signers[0].level, SecurityLevel::Invalid);
            prop_assert!(!info.content_released);
            prop_assert!(out.is_empty());
        }
    }
}

mod multi_signer_tests {
    use super::*;

    #[test]
    fn test_two_signers_aggregate() {
        let service = service();
        let content = b"co-signed agreement";
        let alice = alice();
        let bob = credentials("bob.key.der", "bob.crt.pem");

        let first = envelope::decode_signed_data(&sign(
            &service,
            &alice,
            content,
            SignDisposition::Embedded,
        ))
        .unwrap();
        let second = envelope::decode_signed_data(&sign(
            &service,
            &bob,
            content,
            SignDisposition::Embedded,
        ))
        .unwrap();

        let mut certs = alice.chain.certificates().to_vec();
        certs.extend(bob.chain.certificates().iter().cloned());
        let signers = first
            .signer_infos
            .0
            .iter()
            .chain(second.signer_infos.0.iter())
            .cloned()
            .collect::<Vec<_>>();
        let merged = envelope::signed_data(
            ID_DATA,
            Some(content),
            &CertificateChain::new(certs),
            signers,
        )
        .unwrap();
        let p7m = envelope::encode_signed_data(&merged).unwrap();

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out)
            .unwrap();
        assert_eq!(info.signers.len(), 2);
        assert!(info.signers.iter().all(|s| s.level == SecurityLevel::Valid));
        assert_eq!(out, content);

        // Swap one signer's signature for the other's: that signer alone drops.
        let mut forged = merged.clone();
        let mut infos = forged.signer_infos.0.clone().into_vec();
        let stolen = infos[1].signature.clone();
        infos[0].signature = stolen;
        forged.signer_infos.0 = infos.try_into().unwrap();
        let p7m = envelope::encode_signed_data(&forged).unwrap();

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out)
            .unwrap();
        let levels = info.signers.iter().map(|s| s.level).collect::<Vec<_>>();
        assert!(levels.contains(&SecurityLevel::Invalid));
        assert!(levels.contains(&SecurityLevel::Valid));
        assert_eq!(info.min_level, SecurityLevel::Invalid);
        assert!(out.is_empty());
    }
}

mod trust_tests {
    use super::*;

    #[test]
    fn test_chain_anchored_in_trusted_root() {
        let carol = credentials("carol.key.der", "carol-chain.pem");
        let config = SignatureConfig::new().with_trusted_root(fixture("root.crt.pem"));
        let service = CmsSignatureService::from_config(&CryptoProvider::register(), config).unwrap();
        let p7m = sign(&service, &carol, b"trusted", SignDisposition::Embedded);

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Trusted, &mut out)
            .unwrap();
        assert_eq!(info.min_level, SecurityLevel::Trusted);
        assert!(info.content_released);
        assert_eq!(out, b"trusted");
    }

    #[test]
    fn test_self_signed_stays_valid() {
        let mut service = service();
        service
            .add_trusted_root(&std::fs::read(fixture("root.crt.der")).unwrap())
            .unwrap();
        let p7m = sign(&service, &alice(), b"alone", SignDisposition::Embedded);

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out)
            .unwrap();
        assert_eq!(info.min_level, SecurityLevel::Valid);
    }

    #[test]
    fn test_signer_identified_by_key_identifier() {
        let service = service();
        let alice = alice();
        let p7m = sign(&service, &alice, b"by key id", SignDisposition::Embedded);

        let mut signed_data = envelope::decode_signed_data(&p7m).unwrap();
        let ski = envelope::subject_key_identifier(alice.chain.leaf().unwrap()).unwrap();
        let mut infos = signed_data.signer_infos.0.clone().into_vec();
        infos[0].sid = SignerIdentifier::SubjectKeyIdentifier(ski);
        signed_data.signer_infos.0 = infos.try_into().unwrap();
        let p7m = envelope::encode_signed_data(&signed_data).unwrap();

        let mut out = Vec::new();
        let info = service
            .verify(None, None, &mut p7m.as_slice(), SecurityLevel::Valid, &mut out)
            .unwrap();
        assert!(info.signers[0].signer_subject.as_deref().unwrap().contains("Alice Signer"));
        assert_eq!(info.min_level, SecurityLevel::Valid);
        assert_eq!(out, b"by key id");
    }

    #[test]
    fn test_certificate_source_from_pem_file() {
        let chain = PemFileSource::new(fixture("carol-chain.pem"))
            .certificate_chain()
            .unwrap();
        assert_eq!(chain.len(), 2);
    }
}

mod error_tests {
    use super::*;

    #[test]
    fn test_provider_without_signature_algorithm() {
        let provider = CryptoProvider::register().with_signature_algorithms(Vec::new());
        let service = CmsSignatureService::new(&provider);
        let alice = alice();
        let chain = service
            .new_signature()
            .to_chain_signature(alice.chain.clone(), SignDisposition::Embedded);
        let digest = service.pre_sign(chain, &mut &b"content"[..]).unwrap();
        let raw = alice
            .signer
            .sign(digest.signature_algorithm(), digest.digest_info())
            .unwrap();

        let mut out = Vec::new();
        let result = service.post_sign(
            digest.to_signed_signature(raw, None),
            &mut UntouchedReader,
            PostSignOutputs::default().with_embedded(&mut out),
        );
        assert!(matches!(result, Err(Error::Unsupported(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_non_sha256_digest_rejected_before_reading() {
        let service = service();
        let chain = EmptySignature::<Cms>::new(SignatureAlgorithm::Sha1WithRsa, DigestAlgorithm::Sha1)
            .to_chain_signature(alice().chain, SignDisposition::Embedded);

        let result = service.pre_sign(chain, &mut UntouchedReader);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_config_digest_rejected_before_reading() {
        let config = SignatureConfig::new().with_digest_algorithm(DigestAlgorithm::Sha512);
        let service = CmsSignatureService::from_config(&CryptoProvider::register(), config).unwrap();
        let chain = service
            .new_signature()
            .to_chain_signature(alice().chain, SignDisposition::Detached);

        let result = service.pre_sign(chain, &mut UntouchedReader);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_empty_chain_rejected() {
        let service = service();
        let chain = service
            .new_signature()
            .to_chain_signature(CertificateChain::new(Vec::new()), SignDisposition::Detached);
        let result = service.pre_sign(chain, &mut UntouchedReader);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_content_changed_after_pre_sign() {
        let service = service();
        let alice = alice();
        let chain = service
            .new_signature()
            .to_chain_signature(alice.chain.clone(), SignDisposition::Embedded);
        let digest = service.pre_sign(chain, &mut &b"original"[..]).unwrap();
        let raw = alice
            .signer
            .sign(digest.signature_algorithm(), digest.digest_info())
            .unwrap();

        let mut out = Vec::new();
        let result = service.post_sign(
            digest.to_signed_signature(raw, None),
            &mut &b"replaced"[..],
            PostSignOutputs::default().with_embedded(&mut out),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_missing_output_rejected_before_reading() {
        let service = service();
        let alice = alice();
        let chain = service
            .new_signature()
            .to_chain_signature(alice.chain.clone(), SignDisposition::Detached);
        let digest = service.pre_sign(chain, &mut &b"content"[..]).unwrap();
        let raw = alice
            .signer
            .sign(digest.signature_algorithm(), digest.digest_info())
            .unwrap();

        let mut embedded = Vec::new();
        let result = service.post_sign(
            digest.to_signed_signature(raw, None),
            &mut UntouchedReader,
            PostSignOutputs::default().with_embedded(&mut embedded),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_software_signer_rejects_foreign_digest() {
        let service = service();
        let alice = alice();
        let chain = service
            .new_signature()
            .to_chain_signature(alice.chain.clone(), SignDisposition::Detached);
        let digest = service.pre_sign(chain, &mut &b"content"[..]).unwrap();

        let result = alice
            .signer
            .sign(SignatureAlgorithm::Sha512WithRsa, digest.digest_info());
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_erased_phase_out_of_order() {
        let service = service();
        let chain = service
            .new_signature()
            .to_chain_signature(alice().chain, SignDisposition::Embedded);
        let parked: SignaturePhase<_> = chain.into();

        match parked.into_signed() {
            Err(Error::ProtocolOrder { expected, found }) => {
                assert_eq!(expected, "Signed");
                assert_eq!(found, "Chain");
            },
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("phase extracted out of order"),
        }
    }

    #[test]
    fn test_erased_phase_in_order() {
        let service = service();
        let chain = service
            .new_signature()
            .to_chain_signature(alice().chain, SignDisposition::Embedded);
        let parked: SignaturePhase<_> = chain.into();
        let chain = parked.into_chain().unwrap();
        assert!(service.pre_sign(chain, &mut &b"resumed"[..]).is_ok());
    }

    #[test]
    fn test_garbage_envelope_unreadable() {
        let service = service();
        let mut out = Vec::new();
        let result = service.verify(
            Some(&mut &b"content"[..]),
            None,
            &mut &b"\x30\x03\x02\x01\x01"[..],
            SecurityLevel::Invalid,
            &mut out,
        );
        assert!(matches!(result, Err(Error::UnreadableEnvelope(_))));
    }

    #[test]
    fn test_software_signer_from_pem() {
        let pem = std::fs::read_to_string(fixture("alice.key.pem")).unwrap();
        let signer = SoftwareSigner::from_pem(&pem).unwrap();
        assert_eq!(signer.key_size(), 128);
    }
}
