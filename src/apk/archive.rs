use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read, Seek, SeekFrom, Write};
use zip::result::ZipResult;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x06054b50;
/// Size of the end of central directory record without its comment.
pub(crate) const CDE_HEADER_SIZE: u64 = 22;
/// Offset of the central directory start field inside the end record.
pub(crate) const CDE_CD_OFFSET_FIELD: usize = 16;

/// How a freshly written entry is laid out in the archive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryLayout {
    Compressed,
    Aligned(u16),
}

impl EntryLayout {
    pub fn alignment(self) -> u16 {
        match self {
            Self::Aligned(align) => align,
            Self::Compressed => 1,
        }
    }

    pub fn compression_method(self) -> CompressionMethod {
        match self {
            Self::Compressed => CompressionMethod::Deflated,
            Self::Aligned(_) => CompressionMethod::Stored,
        }
    }
}

/// Picks the [`EntryLayout`] of replacement entries from their path.
///
/// Android memory-maps `resources.arsc` and native libraries straight out of
/// the package, so those are stored uncompressed at a 4 byte boundary, and
/// `.so` files at a page boundary. Everything else is deflated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplacementLayout {
    stored_suffixes: Vec<String>,
}

pub const DEFAULT_STORED_SUFFIXES: &[&str] = &["resources.arsc", ".so"];
const STORED_ALIGNMENT: u16 = 4;
const NATIVE_LIBRARY_ALIGNMENT: u16 = 4096;

impl Default for ReplacementLayout {
    fn default() -> Self {
        Self::new(DEFAULT_STORED_SUFFIXES.iter().map(|s| s.to_string()))
    }
}

impl ReplacementLayout {
    pub fn new(stored_suffixes: impl IntoIterator<Item = String>) -> Self {
        Self {
            stored_suffixes: stored_suffixes.into_iter().collect(),
        }
    }

    /// Deflate every replacement.
    pub fn compressed() -> Self {
        Self::new(std::iter::empty())
    }

    pub fn layout_for(&self, path: &str) -> EntryLayout {
        if !self.stored_suffixes.iter().any(|s| path.ends_with(s.as_str())) {
            return EntryLayout::Compressed;
        }
        EntryLayout::Aligned(stored_alignment(path))
    }
}

/// Boundary the data of a STORED entry starts on.
pub fn stored_alignment(path: &str) -> u16 {
    if path.ends_with(".so") {
        NATIVE_LIBRARY_ALIGNMENT
    } else {
        STORED_ALIGNMENT
    }
}

/// Copies entry `index` of `archive` into `zip`.
///
/// Compressed entries travel raw. The zip writer drops the extra field of a
/// raw copy, and with it any alignment padding, so a STORED entry is written
/// again at [`stored_alignment`] from its bytes. Method, size and CRC-32 come
/// out the same.
pub(crate) fn copy_entry<R, W>(
    archive: &mut ZipArchive<R>,
    index: usize,
    zip: &mut ZipWriter<W>,
) -> ZipResult<()>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let file = archive.by_index_raw(index)?;
    if file.compression() != CompressionMethod::Stored {
        return zip.raw_copy_file(file);
    }
    let name = file.name().to_string();
    let mut options = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(file.last_modified())
        .large_file(file.size() > u32::MAX as u64);
    if let Some(mode) = file.unix_mode() {
        options = options.unix_permissions(mode);
    }
    drop(file);

    let mut file = archive.by_index(index)?;
    zip.start_file_aligned(name.as_str(), options, stored_alignment(&name))?;
    io::copy(&mut file, zip)?;
    Ok(())
}

/// Offsets of the trailing ZIP structures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ZipInfo {
    pub cde_start: u64,
    pub cd_start: u64,
}

impl ZipInfo {
    pub fn new<R: Read + Seek>(r: &mut R) -> io::Result<Self> {
        let cde_start = find_cde_start_pos(r)?;
        r.seek(SeekFrom::Start(cde_start + CDE_CD_OFFSET_FIELD as u64))?;
        let cd_start = r.read_u32::<LittleEndian>()? as u64;
        if cd_start > cde_start {
            return Err(invalid_data("central directory starts after its end record"));
        }
        Ok(Self {
            cde_start,
            cd_start,
        })
    }
}

fn find_cde_start_pos<R: Read + Seek>(reader: &mut R) -> io::Result<u64> {
    let file_length = reader.seek(SeekFrom::End(0))?;
    if file_length < CDE_HEADER_SIZE {
        return Err(invalid_data("archive is shorter than an end of central directory"));
    }
    let search_upper_bound = file_length.saturating_sub(CDE_HEADER_SIZE + u16::MAX as u64);
    let mut pos = file_length - CDE_HEADER_SIZE;
    while pos >= search_upper_bound {
        reader.seek(SeekFrom::Start(pos))?;
        if reader.read_u32::<LittleEndian>()? == CENTRAL_DIRECTORY_END_SIGNATURE {
            return Ok(pos);
        }
        pos = match pos.checked_sub(1) {
            Some(p) => p,
            None => break,
        };
    }
    Err(invalid_data("could not find central directory end"))
}

pub(crate) fn invalid_data(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}
