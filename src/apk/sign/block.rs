//! APK Signing Block with the v2 and v3 signature schemes.

use super::Signer;
use crate::apk::archive::{invalid_data, ZipInfo, CDE_CD_OFFSET_FIELD};
use crate::error::SigningError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const APK_SIGNING_BLOCK_MAGIC: &[u8] = b"APK Sig Block 42";
pub const APK_SIGNING_BLOCK_V2_ID: u32 = 0x7109871a;
pub const APK_SIGNING_BLOCK_V3_ID: u32 = 0xf05368c0;
/// v2 attribute telling verifiers a v3 block must also be present.
pub const STRIPPING_PROTECTION_ATTR_ID: u32 = 0xbeeff00d;
const STRIPPING_PROTECTION_V3: u32 = 3;
pub const RSA_PKCS1V15_SHA2_256: u32 = 0x0103;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;
/// Trailing size field and magic.
const BLOCK_FOOTER_SIZE: u64 = 8 + 16;

/// Platform range a v3 signer declares.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SdkRange {
    pub min_sdk: u32,
    pub max_sdk: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BlockScheme {
    V2 { v3_present: bool },
    V3(SdkRange),
}

impl BlockScheme {
    fn id(self) -> u32 {
        match self {
            Self::V2 { .. } => APK_SIGNING_BLOCK_V2_ID,
            Self::V3(_) => APK_SIGNING_BLOCK_V3_ID,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ApkSignatureBlock {
    pub pairs: Vec<ApkOpaqueBlock>,
    pub sb_start: u64,
    pub cd_start: u64,
    pub cde_start: u64,
}

impl ApkSignatureBlock {
    pub fn ids(&self) -> Vec<u32> {
        self.pairs.iter().map(|pair| pair.id).collect()
    }
}

/// One id-value pair; `start` is the offset of the value.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ApkOpaqueBlock {
    pub id: u32,
    pub start: u64,
    pub len: u64,
}

pub(crate) fn parse_apk_signing_block<R: Read + Seek>(r: &mut R) -> io::Result<ApkSignatureBlock> {
    let info = ZipInfo::new(r)?;
    let mut block = ApkSignatureBlock {
        cde_start: info.cde_start,
        cd_start: info.cd_start,
        sb_start: info.cd_start,
        ..Default::default()
    };
    if block.cd_start < BLOCK_FOOTER_SIZE {
        return Ok(block);
    }
    r.seek(SeekFrom::Start(block.cd_start - BLOCK_FOOTER_SIZE))?;
    let size = r.read_u64::<LittleEndian>()?;
    let mut magic = [0; 16];
    r.read_exact(&mut magic)?;
    if magic != APK_SIGNING_BLOCK_MAGIC {
        return Ok(block);
    }
    if size < BLOCK_FOOTER_SIZE || size > block.cd_start - 8 {
        return Err(invalid_data("signing block size out of range"));
    }
    block.sb_start = block.cd_start - size - 8;
    r.seek(SeekFrom::Start(block.sb_start))?;
    if r.read_u64::<LittleEndian>()? != size {
        return Err(invalid_data("signing block sizes disagree"));
    }

    let pairs_end = block.cd_start - BLOCK_FOOTER_SIZE;
    let mut pos = block.sb_start + 8;
    while pos < pairs_end {
        let remaining = pairs_end - pos;
        if remaining < 12 {
            return Err(invalid_data("signing block pair header truncated"));
        }
        let length = r.read_u64::<LittleEndian>()?;
        if length < 4 || length > remaining - 8 {
            return Err(invalid_data("signing block pair out of range"));
        }
        let id = r.read_u32::<LittleEndian>()?;
        block.pairs.push(ApkOpaqueBlock {
            id,
            start: pos + 8 + 4,
            len: length - 4,
        });
        pos = r.seek(SeekFrom::Start(pos + 8 + length))?;
    }
    Ok(block)
}

/// Chunked SHA-256 over contents, central directory and end record, the
/// latter with its central directory offset pointing at `sb_start`.
pub(crate) fn compute_digest<R: Read + Seek>(
    r: &mut R,
    block: &ApkSignatureBlock,
) -> io::Result<[u8; 32]> {
    let mut chunks = vec![];
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; MAX_CHUNK_SIZE];

    // chunk contents
    r.rewind()?;
    let mut pos = 0;
    while pos < block.sb_start {
        hash_chunk(&mut chunks, r, block.sb_start, &mut hasher, &mut chunk, &mut pos)?;
    }

    // chunk cd
    let mut pos = r.seek(SeekFrom::Start(block.cd_start))?;
    while pos < block.cde_start {
        hash_chunk(&mut chunks, r, block.cde_start, &mut hasher, &mut chunk, &mut pos)?;
    }

    // chunk cde
    chunk.clear();
    r.read_to_end(&mut chunk)?;
    patch_cd_offset(&mut chunk, block.sb_start)?;
    hasher.update([0xa5]);
    hasher.update((chunk.len() as u32).to_le_bytes());
    hasher.update(&chunk);
    chunks.push(hasher.finalize_reset().into());

    // compute root
    hasher.update([0x5a]);
    hasher.update((chunks.len() as u32).to_le_bytes());
    for chunk in &chunks {
        hasher.update(chunk);
    }
    Ok(hasher.finalize().into())
}

fn hash_chunk<R: Read + Seek>(
    chunks: &mut Vec<[u8; 32]>,
    r: &mut R,
    size: u64,
    hasher: &mut Sha256,
    buffer: &mut Vec<u8>,
    pos: &mut u64,
) -> io::Result<()> {
    let end = std::cmp::min(*pos + MAX_CHUNK_SIZE as u64, size);
    let len = (end - *pos) as usize;
    buffer.resize(len, 0);
    r.read_exact(buffer)?;
    hasher.update([0xa5]);
    hasher.update((len as u32).to_le_bytes());
    hasher.update(buffer);
    chunks.push(hasher.finalize_reset().into());
    *pos = end;
    Ok(())
}

fn patch_cd_offset(cde: &mut [u8], cd_start: u64) -> io::Result<()> {
    let offset = u32::try_from(cd_start)
        .map_err(|_| invalid_data("central directory offset exceeds 4 GiB"))?;
    let mut cursor = Cursor::new(cde);
    cursor.seek(SeekFrom::Start(CDE_CD_OFFSET_FIELD as u64))?;
    cursor.write_u32::<LittleEndian>(offset)
}

#[derive(Debug, Default)]
struct Digest {
    pub algorithm: u32,
    pub digest: Vec<u8>,
}

impl Digest {
    fn new(hash: [u8; 32]) -> Self {
        Self {
            algorithm: RSA_PKCS1V15_SHA2_256,
            digest: hash.to_vec(),
        }
    }

    fn size(&self) -> u32 {
        self.digest.len() as u32 + 12
    }

    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.digest.len() as u32 + 8)?;
        w.write_u32::<LittleEndian>(self.algorithm)?;
        w.write_u32::<LittleEndian>(self.digest.len() as u32)?;
        w.write_all(&self.digest)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SignedData {
    pub digests: Vec<Digest>,
    pub certificates: Vec<Vec<u8>>,
    /// Only present in v3 signed data.
    pub sdk: Option<SdkRange>,
    pub additional_attributes: Vec<(u32, Vec<u8>)>,
}

impl SignedData {
    fn new(hash: [u8; 32], signer: &Signer, scheme: BlockScheme) -> Self {
        let mut signed_data = Self {
            digests: vec![Digest::new(hash)],
            certificates: vec![signer.certificate_der().to_vec()],
            ..Default::default()
        };
        match scheme {
            BlockScheme::V2 { v3_present: true } => signed_data.additional_attributes.push((
                STRIPPING_PROTECTION_ATTR_ID,
                STRIPPING_PROTECTION_V3.to_le_bytes().to_vec(),
            )),
            BlockScheme::V2 { v3_present: false } => {}
            BlockScheme::V3(sdk) => signed_data.sdk = Some(sdk),
        }
        signed_data
    }

    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.digests.iter().map(|d| d.size()).sum())?;
        for digest in &self.digests {
            digest.write(w)?;
        }
        w.write_u32::<LittleEndian>(self.certificates.iter().map(|c| c.len() as u32 + 4).sum())?;
        for cert in &self.certificates {
            w.write_u32::<LittleEndian>(cert.len() as u32)?;
            w.write_all(cert)?;
        }
        if let Some(sdk) = self.sdk {
            w.write_u32::<LittleEndian>(sdk.min_sdk)?;
            w.write_u32::<LittleEndian>(sdk.max_sdk)?;
        }
        w.write_u32::<LittleEndian>(
            self.additional_attributes
                .iter()
                .map(|(_, v)| v.len() as u32 + 8)
                .sum(),
        )?;
        for (id, value) in &self.additional_attributes {
            w.write_u32::<LittleEndian>(value.len() as u32 + 4)?;
            w.write_u32::<LittleEndian>(*id)?;
            w.write_all(value)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ApkSigner {
    pub signed_data: Vec<u8>,
    pub sdk: Option<SdkRange>,
    pub signatures: Vec<ApkSignature>,
    pub public_key: Vec<u8>,
}

#[derive(Debug)]
struct ApkSignature {
    pub algorithm: u32,
    pub signature: Vec<u8>,
}

/// Value of a v2 or v3 pair: a sequence holding one signer.
#[derive(Debug)]
struct ApkSignatureScheme {
    pub signers: Vec<ApkSigner>,
}

impl ApkSignatureScheme {
    fn new(hash: [u8; 32], signer: &Signer, scheme: BlockScheme) -> Result<Self, SigningError> {
        let mut signed_data = vec![];
        SignedData::new(hash, signer, scheme)
            .write(&mut signed_data)
            .map_err(|err| SigningError::Crypto(err.to_string()))?;
        let signature = signer.sign_sha256(&signed_data)?;
        let sdk = match scheme {
            BlockScheme::V3(sdk) => Some(sdk),
            BlockScheme::V2 { .. } => None,
        };
        Ok(Self {
            signers: vec![ApkSigner {
                signed_data,
                sdk,
                signatures: vec![ApkSignature {
                    algorithm: RSA_PKCS1V15_SHA2_256,
                    signature,
                }],
                public_key: signer.public_key_der()?,
            }],
        })
    }

    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        let mut buffer = vec![];
        for signer in &self.signers {
            let mut signer_buffer = vec![];
            signer_buffer.write_u32::<LittleEndian>(signer.signed_data.len() as u32)?;
            signer_buffer.write_all(&signer.signed_data)?;
            if let Some(sdk) = signer.sdk {
                signer_buffer.write_u32::<LittleEndian>(sdk.min_sdk)?;
                signer_buffer.write_u32::<LittleEndian>(sdk.max_sdk)?;
            }
            let mut sig_buffer = vec![];
            for sig in &signer.signatures {
                sig_buffer.write_u32::<LittleEndian>(sig.signature.len() as u32 + 8)?;
                sig_buffer.write_u32::<LittleEndian>(sig.algorithm)?;
                sig_buffer.write_u32::<LittleEndian>(sig.signature.len() as u32)?;
                sig_buffer.write_all(&sig.signature)?;
            }
            signer_buffer.write_u32::<LittleEndian>(sig_buffer.len() as u32)?;
            signer_buffer.write_all(&sig_buffer)?;
            signer_buffer.write_u32::<LittleEndian>(signer.public_key.len() as u32)?;
            signer_buffer.write_all(&signer.public_key)?;
            buffer.write_u32::<LittleEndian>(signer_buffer.len() as u32)?;
            buffer.write_all(&signer_buffer)?;
        }
        w.write_u32::<LittleEndian>(buffer.len() as u32)?;
        w.write_all(&buffer)?;
        Ok(())
    }
}

fn write_apk_signing_block(w: &mut impl Write, pairs: &[(u32, Vec<u8>)]) -> io::Result<()> {
    let size = pairs
        .iter()
        .map(|(_, value)| value.len() as u64 + 12)
        .sum::<u64>()
        + BLOCK_FOOTER_SIZE;
    w.write_u64::<LittleEndian>(size)?;
    for (id, value) in pairs {
        w.write_u64::<LittleEndian>(value.len() as u64 + 4)?;
        w.write_u32::<LittleEndian>(*id)?;
        w.write_all(value)?;
    }
    w.write_u64::<LittleEndian>(size)?;
    w.write_all(APK_SIGNING_BLOCK_MAGIC)?;
    Ok(())
}

/// Writes `input` to `output` with a new APK Signing Block holding `schemes`,
/// replacing any block already present. Returns the content digest.
pub(crate) fn sign_apk(
    input: &Path,
    output: &Path,
    signer: &Signer,
    schemes: &[BlockScheme],
) -> Result<[u8; 32], SigningError> {
    let file = File::open(input).map_err(|err| SigningError::io(input, err))?;
    let mut r = BufReader::new(file);
    let block = parse_apk_signing_block(&mut r).map_err(|err| archive_error(input, err))?;
    let zip_hash = compute_digest(&mut r, &block).map_err(|err| archive_error(input, err))?;

    let mut pairs = vec![];
    for scheme in schemes {
        let mut value = vec![];
        ApkSignatureScheme::new(zip_hash, signer, *scheme)?
            .write(&mut value)
            .map_err(|err| SigningError::Crypto(err.to_string()))?;
        pairs.push((scheme.id(), value));
    }
    let mut nblock = vec![];
    write_apk_signing_block(&mut nblock, &pairs)
        .map_err(|err| SigningError::Crypto(err.to_string()))?;

    let out = File::create(output).map_err(|err| SigningError::io(output, err))?;
    let mut w = BufWriter::new(out);
    splice(&mut r, &mut w, &block, &nblock).map_err(|err| archive_error(output, err))?;
    w.flush().map_err(|err| SigningError::io(output, err))?;
    tracing::debug!(
        "wrote {} byte signing block with {} scheme(s)",
        nblock.len(),
        pairs.len()
    );
    Ok(zip_hash)
}

fn splice<R: Read + Seek, W: Write>(
    r: &mut R,
    w: &mut W,
    block: &ApkSignatureBlock,
    nblock: &[u8],
) -> io::Result<()> {
    r.rewind()?;
    io::copy(&mut r.by_ref().take(block.sb_start), w)?;
    w.write_all(nblock)?;
    let cd_start = block.sb_start + nblock.len() as u64;
    r.seek(SeekFrom::Start(block.cd_start))?;
    io::copy(&mut r.by_ref().take(block.cde_start - block.cd_start), w)?;
    let mut cde = vec![];
    r.read_to_end(&mut cde)?;
    patch_cd_offset(&mut cde, cd_start)?;
    w.write_all(&cde)
}

fn archive_error(path: &Path, err: io::Error) -> SigningError {
    if err.kind() == io::ErrorKind::InvalidData || err.kind() == io::ErrorKind::UnexpectedEof {
        SigningError::malformed(path, err)
    } else {
        SigningError::io(path, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::debug_identity;
    use rsa::pkcs8::DecodePublicKey;
    use rsa::{PaddingScheme, PublicKey, RsaPublicKey};
    use sha2::Digest as _;
    use std::io::Cursor;
    use tempfile::tempdir;
    use zip::write::FileOptions;
    use zip::{ZipArchive, ZipWriter};

    fn small_zip(path: &Path) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        zip.start_file("a.txt", FileOptions::default()).unwrap();
        zip.write_all(&[b'a'; 3000]).unwrap();
        zip.start_file("b.txt", FileOptions::default()).unwrap();
        zip.write_all(b"bee").unwrap();
        zip.finish().unwrap();
    }

    fn read_value(bytes: &[u8], pos: &mut usize) -> Vec<u8> {
        let len = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap()) as usize;
        let value = bytes[*pos + 4..*pos + 4 + len].to_vec();
        *pos += 4 + len;
        value
    }

    fn read_u32(bytes: &[u8], pos: &mut usize) -> u32 {
        let value = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
        *pos += 4;
        value
    }

    fn pair_value(bytes: &[u8], pair: &ApkOpaqueBlock) -> Vec<u8> {
        bytes[pair.start as usize..(pair.start + pair.len) as usize].to_vec()
    }

    const V3_RANGE: SdkRange = SdkRange {
        min_sdk: 28,
        max_sdk: i32::MAX as u32,
    };

    fn sign_small(schemes: &[BlockScheme]) -> (Vec<u8>, [u8; 32]) {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        let output = dir.path().join("out.apk");
        small_zip(&input);
        let identity = debug_identity();
        let signer = Signer::new(&identity).unwrap();
        let hash = sign_apk(&input, &output, &signer, schemes).unwrap();
        (std::fs::read(&output).unwrap(), hash)
    }

    #[test]
    fn unsigned_archive_has_no_block() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        small_zip(&input);
        let block = parse_apk_signing_block(&mut File::open(&input).unwrap()).unwrap();
        assert!(block.pairs.is_empty());
        assert_eq!(block.sb_start, block.cd_start);
    }

    #[test]
    fn block_holds_requested_schemes() {
        let (bytes, _) = sign_small(&[
            BlockScheme::V2 { v3_present: true },
            BlockScheme::V3(V3_RANGE),
        ]);
        let block = parse_apk_signing_block(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(
            block.ids(),
            vec![APK_SIGNING_BLOCK_V2_ID, APK_SIGNING_BLOCK_V3_ID]
        );

        let (bytes, _) = sign_small(&[BlockScheme::V2 { v3_present: false }]);
        let block = parse_apk_signing_block(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(block.ids(), vec![APK_SIGNING_BLOCK_V2_ID]);
    }

    #[test]
    fn central_directory_offset_points_past_the_block() {
        let (bytes, _) = sign_small(&[BlockScheme::V2 { v3_present: false }]);
        let info = ZipInfo::new(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(&bytes[info.cd_start as usize..][..4], b"PK\x01\x02");
        assert_eq!(
            &bytes[info.cd_start as usize - 16..info.cd_start as usize],
            APK_SIGNING_BLOCK_MAGIC
        );

        // Still a readable archive.
        let archive = ZipArchive::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn digest_survives_resigning() {
        let (bytes, hash) = sign_small(&[BlockScheme::V2 { v3_present: false }]);
        let block = parse_apk_signing_block(&mut Cursor::new(&bytes)).unwrap();
        let recomputed = compute_digest(&mut Cursor::new(&bytes), &block).unwrap();
        assert_eq!(hash, recomputed);
    }

    #[test]
    fn v2_signature_verifies_against_signed_data() {
        let (bytes, hash) = sign_small(&[BlockScheme::V2 { v3_present: false }]);
        let block = parse_apk_signing_block(&mut Cursor::new(&bytes)).unwrap();
        let value = pair_value(&bytes, &block.pairs[0]);

        let mut pos = 0;
        let signers = read_value(&value, &mut pos);
        let mut pos = 0;
        let signer = read_value(&signers, &mut pos);
        let mut pos = 0;
        let signed_data = read_value(&signer, &mut pos);
        let signatures = read_value(&signer, &mut pos);
        let public_key = read_value(&signer, &mut pos);

        let mut sig_pos = 0;
        let signature = read_value(&signatures, &mut sig_pos);
        let mut p = 0;
        assert_eq!(read_u32(&signature, &mut p), RSA_PKCS1V15_SHA2_256);
        let sig = read_value(&signature, &mut p);

        let key = RsaPublicKey::from_public_key_der(&public_key).unwrap();
        let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
        key.verify(padding, &Sha256::digest(&signed_data), &sig)
            .unwrap();

        // The digest inside the signed data is the content digest.
        let mut p = 0;
        let digests = read_value(&signed_data, &mut p);
        let mut d = 0;
        let digest = read_value(&digests, &mut d);
        let mut q = 0;
        assert_eq!(read_u32(&digest, &mut q), RSA_PKCS1V15_SHA2_256);
        assert_eq!(read_value(&digest, &mut q), hash.to_vec());
    }

    #[test]
    fn v2_carries_stripping_protection_when_v3_is_present() {
        let (bytes, _) = sign_small(&[
            BlockScheme::V2 { v3_present: true },
            BlockScheme::V3(V3_RANGE),
        ]);
        let block = parse_apk_signing_block(&mut Cursor::new(&bytes)).unwrap();

        let value = pair_value(&bytes, &block.pairs[0]);
        let mut pos = 0;
        let signers = read_value(&value, &mut pos);
        let mut pos = 0;
        let signer = read_value(&signers, &mut pos);
        let mut pos = 0;
        let signed_data = read_value(&signer, &mut pos);
        let mut p = 0;
        read_value(&signed_data, &mut p);
        read_value(&signed_data, &mut p);
        let attrs = read_value(&signed_data, &mut p);
        let mut a = 0;
        let attr = read_value(&attrs, &mut a);
        let mut q = 0;
        assert_eq!(read_u32(&attr, &mut q), STRIPPING_PROTECTION_ATTR_ID);
        assert_eq!(read_u32(&attr, &mut q), STRIPPING_PROTECTION_V3);

        // v3 signer declares its platform range after the signed data.
        let value = pair_value(&bytes, &block.pairs[1]);
        let mut pos = 0;
        let signers = read_value(&value, &mut pos);
        let mut pos = 0;
        let signer = read_value(&signers, &mut pos);
        let mut pos = 0;
        read_value(&signer, &mut pos);
        assert_eq!(read_u32(&signer, &mut pos), 28);
        assert_eq!(read_u32(&signer, &mut pos), i32::MAX as u32);
    }

    #[test]
    fn existing_block_is_replaced() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        let once = dir.path().join("once.apk");
        let twice = dir.path().join("twice.apk");
        small_zip(&input);
        let identity = debug_identity();
        let signer = Signer::new(&identity).unwrap();

        let first = sign_apk(&input, &once, &signer, &[BlockScheme::V2 { v3_present: false }])
            .unwrap();
        let second = sign_apk(&once, &twice, &signer, &[BlockScheme::V2 { v3_present: false }])
            .unwrap();
        assert_eq!(first, second);

        let block = parse_apk_signing_block(&mut File::open(&twice).unwrap()).unwrap();
        assert_eq!(block.pairs.len(), 1);
    }

    #[test]
    fn truncated_block_is_malformed() {
        let mut bytes = {
            let (bytes, _) = sign_small(&[BlockScheme::V2 { v3_present: false }]);
            bytes
        };
        let info = ZipInfo::new(&mut Cursor::new(&bytes)).unwrap();
        // Claim a block larger than everything before the central directory.
        let size_at = info.cd_start as usize - 24;
        bytes[size_at..size_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        let err = parse_apk_signing_block(&mut Cursor::new(&bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
