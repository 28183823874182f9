//! Rewrites an archive with a set of entries replaced.
//!
//! Entries that are kept are copied raw: the compressed bytes, the method and
//! for STORED entries the sizes and CRC-32 travel unchanged, so nothing is
//! inflated and deflated again. STORED entries keep their data aligned.
//! Replacements are written last as fresh entries laid out by a
//! [`ReplacementLayout`].

use super::archive::{copy_entry, ReplacementLayout};
use crate::error::PatchError;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// Path inside the archive mapped to the bytes that replace it.
pub type Replacements = BTreeMap<String, Vec<u8>>;

/// What a patch pass did with every source entry and replacement.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PatchReport {
    /// Source entries copied unchanged, in output order.
    pub copied: Vec<String>,
    /// Replacement paths that were present in the source.
    pub replaced: Vec<String>,
    /// Replacement paths that were new to the archive.
    pub appended: Vec<String>,
    pub skipped_directories: Vec<String>,
    /// Later occurrences of a path already written.
    pub skipped_duplicates: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Patcher {
    layout: ReplacementLayout,
}

impl Patcher {
    pub fn new(layout: ReplacementLayout) -> Self {
        Self { layout }
    }

    pub fn patch(
        &self,
        source: &Path,
        destination: &Path,
        replacements: &Replacements,
    ) -> Result<PatchReport, PatchError> {
        let input = File::open(source).map_err(|err| PatchError::io(source, err))?;
        let mut archive =
            ZipArchive::new(BufReader::new(input)).map_err(|err| PatchError::zip(source, err))?;
        let output = File::create(destination).map_err(|err| PatchError::io(destination, err))?;
        let mut zip = ZipWriter::new(BufWriter::new(output));

        let mut report = PatchReport::default();
        let mut written = HashSet::new();
        let mut present = HashSet::new();

        for index in 0..archive.len() {
            let (name, is_dir) = {
                let file = archive
                    .by_index_raw(index)
                    .map_err(|err| PatchError::zip(source, err))?;
                (file.name().to_string(), file.is_dir())
            };

            if replacements.contains_key(&name) {
                tracing::debug!("replacing `{}`", name);
                present.insert(name);
                continue;
            }
            if is_dir {
                tracing::debug!("dropping directory entry `{}`", name);
                report.skipped_directories.push(name);
                continue;
            }
            if written.contains(&name) {
                tracing::warn!("dropping duplicate entry `{}` at index {}", name, index);
                report.skipped_duplicates.push(name);
                continue;
            }

            copy_entry(&mut archive, index, &mut zip)
                .map_err(|err| PatchError::zip(destination, err))?;
            written.insert(name.clone());
            report.copied.push(name);
        }

        for (path, contents) in replacements {
            let layout = self.layout.layout_for(path);
            let options = FileOptions::default().compression_method(layout.compression_method());
            zip.start_file_aligned(path.as_str(), options, layout.alignment())
                .map_err(|err| PatchError::zip(destination, err))?;
            zip.write_all(contents)
                .map_err(|err| PatchError::io(destination, err))?;
            if present.contains(path) {
                report.replaced.push(path.clone());
            } else {
                report.appended.push(path.clone());
            }
        }

        let mut output = zip
            .finish()
            .map_err(|err| PatchError::zip(destination, err))?;
        output
            .flush()
            .map_err(|err| PatchError::io(destination, err))?;

        tracing::info!(
            "patched `{}` into `{}`: {} copied, {} replaced, {} appended",
            source.display(),
            destination.display(),
            report.copied.len(),
            report.replaced.len(),
            report.appended.len()
        );
        Ok(report)
    }
}

/// Patches `source` into `destination` with the default [`ReplacementLayout`].
pub fn patch(
    source: &Path,
    destination: &Path,
    replacements: &Replacements,
) -> Result<PatchReport, PatchError> {
    Patcher::default().patch(source, destination, replacements)
}
