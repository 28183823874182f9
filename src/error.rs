//! Error types for patching and signing.
//!
//! Each component reports its own typed error. [`enum@Error`] aggregates them
//! for the repack pipeline so callers can still match on the component that
//! failed.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::result::ZipError;

/// Failure of [`crate::apk::patch::patch`].
#[derive(Debug, Error)]
pub enum PatchError {
    /// Opening, reading or writing one of the two archives failed.
    #[error("I/O error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The source archive has an unreadable ZIP structure.
    #[error("malformed archive `{}`: {reason}", path.display())]
    MalformedArchive { path: PathBuf, reason: String },
}

impl PatchError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn zip(path: &Path, err: ZipError) -> Self {
        match err {
            ZipError::Io(source) => Self::io(path, source),
            other => Self::MalformedArchive {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }
}

/// The certificate file held no certificate in any accepted framing.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CertificateFormatError {
    /// Nothing was left after stripping PEM markers and whitespace.
    #[error("no certificate content found")]
    Empty,

    /// Content was present but no framing produced a decodable X.509 certificate.
    #[error("certificate content could not be decoded: {0}")]
    Undecodable(String),
}

/// Failure of [`crate::apk::sign::identity::load_identity`].
#[derive(Debug, Error)]
pub enum KeyLoadError {
    #[error("failed to read `{}`: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed PKCS#8 private key `{}`: {reason}", path.display())]
    PrivateKey { path: PathBuf, reason: String },

    #[error("invalid certificate `{}`: {source}", path.display())]
    Certificate {
        path: PathBuf,
        #[source]
        source: CertificateFormatError,
    },
}

/// Failure of [`crate::apk::sign::sign`].
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("I/O error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot sign malformed archive `{}`: {reason}", path.display())]
    MalformedArchive { path: PathBuf, reason: String },

    /// The private key does not belong to the certificate's public key.
    #[error("private key does not match the certificate's public key")]
    KeyMismatch,

    #[error("certificate cannot be used for signing: {0}")]
    Certificate(String),

    #[error("signature generation failed: {0}")]
    Crypto(String),
}

impl SigningError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn zip(path: &Path, err: ZipError) -> Self {
        match err {
            ZipError::Io(source) => Self::io(path, source),
            other => Self::malformed(path, other),
        }
    }

    pub(crate) fn malformed(path: &Path, reason: impl ToString) -> Self {
        Self::MalformedArchive {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Error of the repack pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    KeyLoad(#[from] KeyLoadError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    /// Scratch files for the intermediate archive could not be created.
    #[error("I/O error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no entries to replace")]
    NothingToReplace,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
