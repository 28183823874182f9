//! Detached PKCS#7 `SignedData` over the `.SF` file of a JAR signature.

use super::Signer;
use crate::error::SigningError;
use cryptographic_message_syntax::{SignedDataBuilder, SignerBuilder};
use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair};

/// Signs `content` with SHA-256 and RSA and embeds the signer's certificate.
pub(crate) fn signed_data(signer: &Signer, content: &[u8]) -> Result<Vec<u8>, SigningError> {
    let key = InMemorySigningKeyPair::from_pkcs8_der(signer.private_key_der()?.as_bytes())
        .map_err(|err| SigningError::Crypto(format!("unusable signing key: {}", err)))?;
    let cert = CapturedX509Certificate::from_der(signer.certificate_der().to_vec())
        .map_err(|err| SigningError::Certificate(err.to_string()))?;

    SignedDataBuilder::default()
        .content_external(content.to_vec())
        .signer(SignerBuilder::new(&key, cert))
        .build_der()
        .map_err(|err| SigningError::Crypto(format!("failed to build PKCS#7 signature: {}", err)))
}
