//! Package signing.
//!
//! `sign` runs the schemes picked by a [`SchemePolicy`] in order: v1 writes a
//! JAR-signed copy of the input next to the output, v2 and v3 splice an APK
//! Signing Block into it, and v4 hashes the finished file into an `.idsig`.

pub mod block;
pub mod identity;
pub mod jar;
mod pkcs7;
pub mod policy;
pub mod v4;

pub use block::SdkRange;
pub use identity::{load_identity, parse_certificate, CertificateFraming, SigningIdentity};
pub use policy::{select_schemes, SchemePolicy, SchemeSet, SigningScheme};

use self::block::BlockScheme;
use self::jar::JarOptions;
use crate::error::SigningError;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, SecretDocument};
use rsa::{PaddingScheme, RsaPublicKey};
use sha2::{Digest as _, Sha256};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Base name of the JAR signature files.
pub const DEFAULT_SIGNER_NAME: &str = "CERT";
pub const DEFAULT_CREATED_BY: &str = concat!("apkpatch ", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignOptions {
    /// Lowest platform API level the package has to install on.
    pub min_sdk: u32,
    pub policy: SchemePolicy,
    pub signer_name: String,
    /// `Created-By` of the JAR manifest and signature file.
    pub created_by: String,
}

impl SignOptions {
    pub fn new(min_sdk: u32) -> Self {
        Self {
            min_sdk,
            policy: SchemePolicy::default(),
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            created_by: DEFAULT_CREATED_BY.to_string(),
        }
    }

    fn apk_signed(schemes: &SchemeSet) -> Option<String> {
        match (schemes.v2, schemes.v3) {
            (true, true) => Some("2, 3".to_string()),
            (true, false) => Some("2".to_string()),
            (false, true) => Some("3".to_string()),
            (false, false) => None,
        }
    }

    fn v3_range(&self) -> SdkRange {
        SdkRange {
            min_sdk: self.min_sdk.max(policy::V3_MIN_API),
            max_sdk: i32::MAX as u32,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignReport {
    pub schemes: SchemeSet,
    /// Path of the `.idsig` file when v4 was applied.
    pub v4_signature: Option<PathBuf>,
}

/// An identity whose private key was checked against its certificate.
pub(crate) struct Signer<'a> {
    identity: &'a SigningIdentity,
    public_key: RsaPublicKey,
}

impl<'a> Signer<'a> {
    pub fn new(identity: &'a SigningIdentity) -> Result<Self, SigningError> {
        let spki =
            rasn::der::encode(&identity.certificate().tbs_certificate.subject_public_key_info)
                .map_err(|err| SigningError::Certificate(err.to_string()))?;
        let cert_key = RsaPublicKey::from_public_key_der(&spki).map_err(|err| {
            SigningError::Certificate(format!("certificate key is not RSA: {}", err))
        })?;
        let public_key = RsaPublicKey::from(identity.key());
        if cert_key != public_key {
            return Err(SigningError::KeyMismatch);
        }
        Ok(Self {
            identity,
            public_key,
        })
    }

    pub fn sign_sha256(&self, bytes: &[u8]) -> Result<Vec<u8>, SigningError> {
        let digest = Sha256::digest(bytes);
        let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
        self.identity
            .key()
            .sign(padding, &digest)
            .map_err(|err| SigningError::Crypto(err.to_string()))
    }

    /// PKCS#8 DER of the private key.
    pub fn private_key_der(&self) -> Result<SecretDocument, SigningError> {
        self.identity
            .key()
            .to_pkcs8_der()
            .map_err(|err| SigningError::Crypto(err.to_string()))
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>, SigningError> {
        let der = self
            .public_key
            .to_public_key_der()
            .map_err(|err| SigningError::Crypto(err.to_string()))?;
        Ok(der.as_ref().to_vec())
    }

    pub fn certificate_der(&self) -> &[u8] {
        self.identity.certificate_der()
    }
}

/// Signs `input` into `output` for packages installing on `api_level` and above.
pub fn sign(
    input: &Path,
    output: &Path,
    identity: &SigningIdentity,
    api_level: u32,
) -> Result<SignReport, SigningError> {
    sign_with_options(input, output, identity, &SignOptions::new(api_level))
}

pub fn sign_with_options(
    input: &Path,
    output: &Path,
    identity: &SigningIdentity,
    options: &SignOptions,
) -> Result<SignReport, SigningError> {
    let signer = Signer::new(identity)?;
    let schemes = options.policy.select(options.min_sdk);
    if options.min_sdk < policy::SHA256_V1_MIN_API {
        tracing::warn!(
            "JAR signature uses SHA-256, which API {} does not verify",
            options.min_sdk
        );
    }
    tracing::info!(
        "signing `{}` for API {} with {}",
        input.display(),
        options.min_sdk,
        schemes
    );

    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let jar_signed = tempfile::Builder::new()
        .prefix(".apkpatch-v1-")
        .suffix(".apk")
        .tempfile_in(dir)
        .map_err(|err| SigningError::io(dir, err))?;
    let jar_options = JarOptions {
        signer_name: &options.signer_name,
        created_by: &options.created_by,
        apk_signed: SignOptions::apk_signed(&schemes),
    };
    jar::sign_jar(
        input,
        BufWriter::new(jar_signed.as_file()),
        jar_signed.path(),
        &signer,
        &jar_options,
    )?
    .flush()
    .map_err(|err| SigningError::io(jar_signed.path(), err))?;

    let mut block_schemes = vec![];
    if schemes.v2 {
        block_schemes.push(BlockScheme::V2 {
            v3_present: schemes.v3,
        });
    }
    if schemes.v3 {
        block_schemes.push(BlockScheme::V3(options.v3_range()));
    }

    let digest = if block_schemes.is_empty() {
        jar_signed
            .persist(output)
            .map_err(|err| SigningError::io(output, err.error))?;
        None
    } else {
        Some(block::sign_apk(
            jar_signed.path(),
            output,
            &signer,
            &block_schemes,
        )?)
    };

    let v4_signature = match digest {
        Some(digest) if schemes.v4 => {
            let idsig = v4::idsig_path(output);
            v4::write_v4_signature(output, &idsig, &signer, &digest)?;
            Some(idsig)
        }
        _ => None,
    };

    tracing::info!("signed `{}`", output.display());
    Ok(SignReport {
        schemes,
        v4_signature,
    })
}
