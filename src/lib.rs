//! Replace entries of an Android package and sign it again.
//!
//! [`patch`] rewrites an archive with a replacement set applied, [`sign`]
//! signs an archive with the schemes a target platform needs, and [`repack`]
//! runs both through scratch files.

pub mod apk;
pub mod core;
pub mod error;

#[cfg(test)]
mod test_support;

pub use crate::apk::sign::{
    load_identity, parse_certificate, select_schemes, CertificateFraming, SchemePolicy, SchemeSet,
    SigningIdentity, SigningScheme,
};
pub use crate::apk::{
    patch, repack, sign, sign_with_options, PatchReport, Patcher, RepackReport,
    ReplacementLayout, Replacements, SignOptions, SignReport,
};
pub use crate::core::config::{parse_config, RepackConfig};
pub use crate::error::{
    CertificateFormatError, Error, KeyLoadError, PatchError, Result, SigningError,
};
