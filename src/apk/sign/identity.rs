//! Loading of the signing key and certificate from a key store directory.

use crate::error::{CertificateFormatError, KeyLoadError};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use std::fs;
use std::path::Path;

pub type Certificate = rasn_pkix::Certificate;

/// Raw PKCS#8 DER private key inside the key store.
pub const PRIVATE_KEY_FILE: &str = "app_key.pk8";
/// Certificate inside the key store, PEM or bare Base64.
pub const CERTIFICATE_FILE: &str = "app_cert.pem";

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Export tools disagree on trailing `=` padding.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Private key and certificate used for one signing call.
#[derive(Clone)]
pub struct SigningIdentity {
    key: RsaPrivateKey,
    cert: Certificate,
    cert_der: Vec<u8>,
}

impl SigningIdentity {
    pub fn new(key: RsaPrivateKey, cert_der: Vec<u8>) -> Result<Self, CertificateFormatError> {
        let cert = decode_certificate(&cert_der).map_err(CertificateFormatError::Undecodable)?;
        Ok(Self {
            key,
            cert,
            cert_der,
        })
    }

    pub fn key(&self) -> &RsaPrivateKey {
        &self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    /// The certificate exactly as it was read from disk.
    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("cert", &self.cert)
            .finish_non_exhaustive()
    }
}

/// Reads `app_key.pk8` and `app_cert.pem` from `key_store`.
///
/// Nothing is cached: every call hits the filesystem again.
pub fn load_identity(key_store: &Path) -> Result<SigningIdentity, KeyLoadError> {
    let key_path = key_store.join(PRIVATE_KEY_FILE);
    let key_der = fs::read(&key_path).map_err(|source| KeyLoadError::Read {
        path: key_path.clone(),
        source,
    })?;
    let key = RsaPrivateKey::from_pkcs8_der(&key_der).map_err(|err| KeyLoadError::PrivateKey {
        path: key_path.clone(),
        reason: err.to_string(),
    })?;

    let cert_path = key_store.join(CERTIFICATE_FILE);
    let text = fs::read_to_string(&cert_path).map_err(|source| KeyLoadError::Read {
        path: cert_path.clone(),
        source,
    })?;
    let (cert, cert_der, framing) =
        parse_certificate(&text).map_err(|source| KeyLoadError::Certificate {
            path: cert_path.clone(),
            source,
        })?;
    tracing::debug!(
        "loaded signing identity from `{}` ({:?} certificate)",
        key_store.display(),
        framing
    );

    Ok(SigningIdentity {
        key,
        cert,
        cert_der,
    })
}

/// Ways a certificate file may be framed, in the order they are tried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertificateFraming {
    /// `-----BEGIN CERTIFICATE-----` ... `-----END CERTIFICATE-----`.
    Pem,
    /// Base64 DER with the markers, if any, and all whitespace removed.
    Base64,
}

impl CertificateFraming {
    pub const ORDER: [CertificateFraming; 2] = [Self::Pem, Self::Base64];

    /// DER bytes this framing finds in `text`, `None` when it does not apply.
    fn extract(self, text: &str) -> Option<Result<Vec<u8>, String>> {
        match self {
            Self::Pem => {
                let begin = text.find(PEM_BEGIN)?;
                let body_start = begin + PEM_BEGIN.len();
                let body_end = body_start + text[body_start..].find(PEM_END)?;
                if text[body_start..body_end].trim().is_empty() {
                    return None;
                }
                let framed = &text[begin..body_end + PEM_END.len()];
                Some(
                    pem::parse(framed)
                        .map(|pem| pem.contents)
                        .map_err(|err| err.to_string()),
                )
            }
            Self::Base64 => {
                let body: String = text
                    .replace(PEM_BEGIN, "")
                    .replace(PEM_END, "")
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect();
                if body.is_empty() {
                    return None;
                }
                Some(LENIENT_BASE64.decode(body).map_err(|err| err.to_string()))
            }
        }
    }
}

/// Runs every [`CertificateFraming`] in order until one yields an X.509 certificate.
pub fn parse_certificate(
    text: &str,
) -> Result<(Certificate, Vec<u8>, CertificateFraming), CertificateFormatError> {
    let mut failures = vec![];
    for framing in CertificateFraming::ORDER {
        let der = match framing.extract(text) {
            None => continue,
            Some(Ok(der)) if der.is_empty() => continue,
            Some(Ok(der)) => der,
            Some(Err(reason)) => {
                failures.push(format!("{:?}: {}", framing, reason));
                continue;
            }
        };
        match decode_certificate(&der) {
            Ok(cert) => return Ok((cert, der, framing)),
            Err(reason) => failures.push(format!("{:?}: {}", framing, reason)),
        }
    }
    if failures.is_empty() {
        Err(CertificateFormatError::Empty)
    } else {
        Err(CertificateFormatError::Undecodable(failures.join("; ")))
    }
}

fn decode_certificate(der: &[u8]) -> Result<Certificate, String> {
    rasn::der::decode::<Certificate>(der).map_err(|err| err.to_string())
}
