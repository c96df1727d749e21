//! Sign and verify CMS envelopes
//!
//! Usage:
//!   cms_seal sign --key signer.key --chain signer.pem --content doc.txt --out doc.p7m
//!   cms_seal sign ... --embedded --tsa-key tsa.key --tsa-cert tsa.pem --timestamp enveloping --marked doc.tsa
//!   cms_seal verify --envelope doc.p7m --content doc.txt --required VALID --out doc.out
//!
//! Set RUST_LOG=debug for progress output.

use cms_seal::config::{CryptoProvider, SignatureConfig};
use cms_seal::signatures::{
    AlgorithmRegistry, CmsSignatureService, ExternalSigner, LocalTimestampAuthority,
    PostSignOutputs, SecurityLevel, SignDisposition, SignatureService, SigningCredentials,
    TimestampDisposition,
};
use cms_seal::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

const USAGE: &str = "\
Usage:
  cms_seal sign --key FILE --chain FILE --content FILE --out FILE
                [--embedded|--detached] [--tsa-key FILE --tsa-cert FILE]
                [--timestamp enveloping|attribute --marked FILE] [--config FILE]
  cms_seal verify --envelope FILE [--content FILE] [--tsr FILE]
                  [--required INVALID|VALID|TRUSTED] [--out FILE]
                  [--trusted-root FILE]... [--tsa-key FILE --tsa-cert FILE]
                  [--config FILE]";

#[derive(Debug, Default)]
struct SignArgs {
    key: Option<PathBuf>,
    chain: Option<PathBuf>,
    content: Option<PathBuf>,
    out: Option<PathBuf>,
    embedded: bool,
    tsa_key: Option<PathBuf>,
    tsa_cert: Option<PathBuf>,
    timestamp: Option<TimestampDisposition>,
    marked: Option<PathBuf>,
    config: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct VerifyArgs {
    envelope: Option<PathBuf>,
    content: Option<PathBuf>,
    tsr: Option<PathBuf>,
    required: Option<SecurityLevel>,
    out: Option<PathBuf>,
    trusted_roots: Vec<PathBuf>,
    tsa_key: Option<PathBuf>,
    tsa_cert: Option<PathBuf>,
    config: Option<PathBuf>,
}

enum Command {
    Sign(SignArgs),
    Verify(VerifyArgs),
}

fn value(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| Error::InvalidArgument(format!("{} needs a value", flag)))
}

fn parse_timestamp(value: &str) -> Result<TimestampDisposition> {
    match value.to_ascii_lowercase().as_str() {
        "enveloping" => Ok(TimestampDisposition::Enveloping),
        "attribute" => Ok(TimestampDisposition::Attribute),
        "detached" => Ok(TimestampDisposition::Detached),
        other => Err(Error::InvalidArgument(format!("unknown timestamp disposition: {}", other))),
    }
}

fn parse_args(args: &[String]) -> Result<Command> {
    let command = args
        .get(1)
        .ok_or_else(|| Error::InvalidArgument("missing command".to_string()))?;

    let mut i = 2;
    match command.as_str() {
        "sign" => {
            let mut sign = SignArgs::default();
            while i < args.len() {
                match args[i].as_str() {
                    "--key" => sign.key = Some(value(args, &mut i, "--key")?.into()),
                    "--chain" => sign.chain = Some(value(args, &mut i, "--chain")?.into()),
                    "--content" => sign.content = Some(value(args, &mut i, "--content")?.into()),
                    "--out" => sign.out = Some(value(args, &mut i, "--out")?.into()),
                    "--embedded" => sign.embedded = true,
                    "--detached" => sign.embedded = false,
                    "--tsa-key" => sign.tsa_key = Some(value(args, &mut i, "--tsa-key")?.into()),
                    "--tsa-cert" => sign.tsa_cert = Some(value(args, &mut i, "--tsa-cert")?.into()),
                    "--timestamp" => {
                        sign.timestamp = Some(parse_timestamp(&value(args, &mut i, "--timestamp")?)?)
                    },
                    "--marked" => sign.marked = Some(value(args, &mut i, "--marked")?.into()),
                    "--config" => sign.config = Some(value(args, &mut i, "--config")?.into()),
                    other => {
                        return Err(Error::InvalidArgument(format!("unknown option: {}", other)))
                    },
                }
                i += 1;
            }
            Ok(Command::Sign(sign))
        },
        "verify" => {
            let mut verify = VerifyArgs::default();
            while i < args.len() {
                match args[i].as_str() {
                    "--envelope" => {
                        verify.envelope = Some(value(args, &mut i, "--envelope")?.into())
                    },
                    "--content" => verify.content = Some(value(args, &mut i, "--content")?.into()),
                    "--tsr" => verify.tsr = Some(value(args, &mut i, "--tsr")?.into()),
                    "--required" => {
                        verify.required = Some(value(args, &mut i, "--required")?.parse()?)
                    },
                    "--out" => verify.out = Some(value(args, &mut i, "--out")?.into()),
                    "--trusted-root" => verify
                        .trusted_roots
                        .push(value(args, &mut i, "--trusted-root")?.into()),
                    "--tsa-key" => verify.tsa_key = Some(value(args, &mut i, "--tsa-key")?.into()),
                    "--tsa-cert" => {
                        verify.tsa_cert = Some(value(args, &mut i, "--tsa-cert")?.into())
                    },
                    "--config" => verify.config = Some(value(args, &mut i, "--config")?.into()),
                    other => {
                        return Err(Error::InvalidArgument(format!("unknown option: {}", other)))
                    },
                }
                i += 1;
            }
            Ok(Command::Verify(verify))
        },
        other => Err(Error::InvalidArgument(format!("unknown command: {}", other))),
    }
}

fn required(path: Option<PathBuf>, flag: &str) -> Result<PathBuf> {
    path.ok_or_else(|| Error::InvalidArgument(format!("{} is required", flag)))
}

fn load_config(path: Option<&PathBuf>) -> Result<SignatureConfig> {
    match path {
        Some(path) => SignatureConfig::from_file(path),
        None => Ok(SignatureConfig::default()),
    }
}

fn build_service(
    provider: &CryptoProvider,
    config: SignatureConfig,
    tsa_key: Option<PathBuf>,
    tsa_cert: Option<PathBuf>,
) -> Result<CmsSignatureService> {
    let policy = config.timestamp_policy.clone();
    let service = CmsSignatureService::from_config(provider, config)?;
    match (tsa_key, tsa_cert) {
        (Some(key), Some(cert)) => {
            let tsa =
                LocalTimestampAuthority::from_files(key, cert, AlgorithmRegistry::new(provider))?
                    .with_policy(&policy)?;
            Ok(service.with_timestamp_authority(tsa))
        },
        (None, None) => Ok(service),
        _ => Err(Error::InvalidArgument(
            "--tsa-key and --tsa-cert must be given together".to_string(),
        )),
    }
}

fn run_sign(provider: &CryptoProvider, args: SignArgs) -> Result<()> {
    let key = required(args.key, "--key")?;
    let chain = required(args.chain, "--chain")?;
    let content_path = required(args.content, "--content")?;
    let out_path = required(args.out, "--out")?;

    let config = load_config(args.config.as_ref())?;
    let service = build_service(provider, config, args.tsa_key, args.tsa_cert)?;
    let credentials = SigningCredentials::from_files(key, chain)?;
    let content = fs::read(&content_path)?;

    let disposition = if args.embedded {
        SignDisposition::Embedded
    } else {
        SignDisposition::Detached
    };
    let request = args.timestamp.map(|d| service.timestamp_request(d));
    if request.is_some() && args.marked.is_none() {
        return Err(Error::InvalidArgument("--timestamp needs --marked".to_string()));
    }

    let chain_phase = service
        .new_signature()
        .to_chain_signature(credentials.chain.clone(), disposition);
    let digest = service.pre_sign(chain_phase, &mut content.as_slice())?;
    let raw = credentials
        .signer
        .sign(digest.signature_algorithm(), digest.digest_info())?;

    // Nothing touches the filesystem until post-sign succeeds.
    let timestamped = request.is_some();
    let mut out = Vec::new();
    let mut marked = Vec::new();
    let mut outputs = PostSignOutputs::default();
    outputs = if args.embedded {
        outputs.with_embedded(&mut out)
    } else {
        outputs.with_detached(&mut out)
    };
    if timestamped {
        outputs = outputs.with_marked(&mut marked);
    }

    let finalized =
        service.post_sign(digest.to_signed_signature(raw, request), &mut content.as_slice(), outputs)?;
    fs::write(&out_path, &out)?;
    if let Some(path) = args.marked.as_ref().filter(|_| timestamped) {
        fs::write(path, &marked)?;
    }

    println!("Signed {} ({} bytes)", content_path.display(), content.len());
    println!("  {} envelope: {}", disposition.as_str(), out_path.display());
    for timestamp in finalized.timestamps() {
        println!(
            "  {} timestamp at {} from {}",
            timestamp.disposition.as_str(),
            timestamp.token.gen_time,
            timestamp.token.issuer
        );
    }
    if let Some(path) = args.marked.as_ref().filter(|_| timestamped) {
        println!("  marked envelope: {}", path.display());
    }
    Ok(())
}

fn run_verify(provider: &CryptoProvider, args: VerifyArgs) -> Result<bool> {
    let envelope_path = required(args.envelope, "--envelope")?;

    let mut config = load_config(args.config.as_ref())?;
    for root in args.trusted_roots {
        config = config.with_trusted_root(root);
    }
    let level = args.required.unwrap_or(config.required_level);
    let service = build_service(provider, config, args.tsa_key, args.tsa_cert)?;

    let mut envelope = File::open(&envelope_path)?;
    let mut content = args.content.as_ref().map(File::open).transpose()?;
    let mut tsr = args.tsr.as_ref().map(File::open).transpose()?;

    let mut released = Vec::new();
    let info = service.verify(
        content.as_mut().map(|f| f as &mut dyn io::Read),
        tsr.as_mut().map(|f| f as &mut dyn io::Read),
        &mut envelope,
        level,
        &mut released,
    )?;

    println!("{}", info.to_json()?);
    if info.content_released {
        match &args.out {
            Some(path) => fs::write(path, &released)?,
            None => io::stderr().write_all(b"content released; use --out to save it\n")?,
        }
    }
    Ok(info.content_released)
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}\n\n{}", e, USAGE);
            return ExitCode::from(2);
        },
    };

    let provider = CryptoProvider::register();
    let result = match command {
        Command::Sign(sign) => run_sign(&provider, sign).map(|_| true),
        Command::Verify(verify) => run_verify(&provider, verify),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        },
    }
}
