//! Patching and re-signing of Android packages.

pub mod archive;
pub mod patch;
pub mod sign;

pub use archive::{EntryLayout, ReplacementLayout};
pub use patch::{patch, PatchReport, Patcher, Replacements};
pub use sign::{sign, sign_with_options, SignOptions, SignReport};

use crate::core::config::RepackConfig;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RepackReport {
    pub patch: PatchReport,
    pub sign: SignReport,
}

fn scratch_file(dir: &Path, prefix: &str) -> Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".apk")
        .tempfile_in(dir)
        .map_err(|source| Error::Io {
            path: dir.to_path_buf(),
            source,
        })
}

fn copy(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to).map_err(|source| Error::Io {
        path: to.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Applies `replacements` to `source`, signs the result with the identity in
/// `config.signing.key_store` and writes it to `output`.
///
/// Intermediate archives live in `scratch_dir` and are removed whether or not
/// the pipeline succeeds. The identity is loaded again on every call.
pub fn repack(
    source: &Path,
    output: &Path,
    replacements: &Replacements,
    config: &RepackConfig,
    scratch_dir: &Path,
) -> Result<RepackReport> {
    if replacements.is_empty() {
        return Err(Error::NothingToReplace);
    }

    let unsigned = scratch_file(scratch_dir, "unsigned_")?;
    let signed = scratch_file(scratch_dir, "signed_")?;

    let patched = Patcher::new(config.replacement_layout()).patch(
        source,
        unsigned.path(),
        replacements,
    )?;
    let identity = sign::load_identity(&config.signing.key_store)?;
    let mut signing = sign::sign_with_options(
        unsigned.path(),
        signed.path(),
        &identity,
        &config.sign_options(),
    )?;
    drop(identity);

    copy(signed.path(), output)?;
    if let Some(idsig) = signing.v4_signature.take() {
        let target = sign::v4::idsig_path(output);
        let moved = copy(&idsig, &target);
        if let Err(err) = fs::remove_file(&idsig) {
            tracing::warn!("could not remove `{}`: {}", idsig.display(), err);
        }
        moved?;
        signing.v4_signature = Some(target);
    }
    tracing::info!(
        "repacked `{}` into `{}` ({} replaced, {} appended)",
        source.display(),
        output.display(),
        patched.replaced.len(),
        patched.appended.len()
    );
    Ok(RepackReport {
        patch: patched,
        sign: signing,
    })
}
