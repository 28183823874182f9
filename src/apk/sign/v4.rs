//! APK Signature Scheme v4: a detached `.idsig` file carrying an fs-verity
//! style Merkle tree of the signed package.

use super::Signer;
use crate::error::SigningError;
use byteorder::{LittleEndian, WriteBytesExt};
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const V4_VERSION: u32 = 2;
const HASH_ALGORITHM_SHA256: u32 = 1;
const LOG2_BLOCK_SIZE: u8 = 12;
const BLOCK_SIZE: usize = 1 << LOG2_BLOCK_SIZE;
const RSA_PKCS1V15_SHA2_256: u32 = super::block::RSA_PKCS1V15_SHA2_256;

/// `app.apk` becomes `app.apk.idsig`.
pub fn idsig_path(apk: &Path) -> PathBuf {
    let mut name = apk.as_os_str().to_os_string();
    name.push(".idsig");
    PathBuf::from(name)
}

#[derive(Debug)]
pub(crate) struct MerkleTree {
    pub root: [u8; 32],
    /// Levels top to bottom, each padded to a whole block.
    pub tree: Vec<u8>,
}

/// Fills `buf` unless the reader runs dry first; returns the bytes read.
fn read_block(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn pad_to_block(level: &mut Vec<u8>) {
    let padded = level.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    level.resize(padded, 0);
}

fn hash_level(data: &[u8]) -> Vec<u8> {
    let mut level = Vec::with_capacity(data.len() / BLOCK_SIZE * 32);
    for block in data.chunks(BLOCK_SIZE) {
        level.extend_from_slice(&Sha256::digest(block));
    }
    pad_to_block(&mut level);
    level
}

pub(crate) fn merkle_tree(r: &mut impl Read) -> io::Result<MerkleTree> {
    let mut bottom = vec![];
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let n = read_block(r, &mut block)?;
        if n == 0 {
            break;
        }
        block[n..].fill(0);
        bottom.extend_from_slice(&Sha256::digest(&block));
        if n < BLOCK_SIZE {
            break;
        }
    }
    pad_to_block(&mut bottom);

    let mut levels = vec![bottom];
    while let Some(level) = levels.last().filter(|level| level.len() > BLOCK_SIZE) {
        let next = hash_level(level);
        levels.push(next);
    }
    let root = match levels.last() {
        Some(top) if !top.is_empty() => Sha256::digest(&top[..BLOCK_SIZE]).into(),
        _ => Sha256::digest([0u8; BLOCK_SIZE]).into(),
    };
    let tree = levels.into_iter().rev().flatten().collect();
    Ok(MerkleTree { root, tree })
}

fn write_bytes(w: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)
}

struct V4Signature<'a> {
    file_size: u64,
    root: [u8; 32],
    apk_digest: &'a [u8],
    certificate: &'a [u8],
    public_key: Vec<u8>,
    signature: Vec<u8>,
}

impl V4Signature<'_> {
    /// Bytes the v4 signature is computed over.
    fn signed_data(
        file_size: u64,
        root: &[u8],
        apk_digest: &[u8],
        certificate: &[u8],
    ) -> io::Result<Vec<u8>> {
        let salt: &[u8] = &[];
        let additional_data: &[u8] = &[];
        let size = 4
            + 8
            + 4
            + 1
            + (4 + salt.len())
            + (4 + root.len())
            + (4 + apk_digest.len())
            + (4 + certificate.len())
            + (4 + additional_data.len());
        let mut w = Vec::with_capacity(size);
        w.write_u32::<LittleEndian>(size as u32)?;
        w.write_u64::<LittleEndian>(file_size)?;
        w.write_u32::<LittleEndian>(HASH_ALGORITHM_SHA256)?;
        w.write_u8(LOG2_BLOCK_SIZE)?;
        write_bytes(&mut w, salt)?;
        write_bytes(&mut w, root)?;
        write_bytes(&mut w, apk_digest)?;
        write_bytes(&mut w, certificate)?;
        write_bytes(&mut w, additional_data)?;
        Ok(w)
    }

    fn write(&self, w: &mut impl Write, tree: &[u8]) -> io::Result<()> {
        let mut hashing_info = vec![];
        hashing_info.write_u32::<LittleEndian>(HASH_ALGORITHM_SHA256)?;
        hashing_info.write_u8(LOG2_BLOCK_SIZE)?;
        write_bytes(&mut hashing_info, &[])?;
        write_bytes(&mut hashing_info, &self.root)?;

        let mut signing_info = vec![];
        write_bytes(&mut signing_info, self.apk_digest)?;
        write_bytes(&mut signing_info, self.certificate)?;
        write_bytes(&mut signing_info, &[])?;
        write_bytes(&mut signing_info, &self.public_key)?;
        signing_info.write_u32::<LittleEndian>(RSA_PKCS1V15_SHA2_256)?;
        write_bytes(&mut signing_info, &self.signature)?;

        w.write_u32::<LittleEndian>(V4_VERSION)?;
        write_bytes(w, &hashing_info)?;
        write_bytes(w, &signing_info)?;
        write_bytes(w, tree)
    }
}

/// Writes the v4 signature of the finished package at `apk` to `idsig`.
pub(crate) fn write_v4_signature(
    apk: &Path,
    idsig: &Path,
    signer: &Signer,
    apk_digest: &[u8],
) -> Result<(), SigningError> {
    let file = File::open(apk).map_err(|err| SigningError::io(apk, err))?;
    let file_size = file
        .metadata()
        .map_err(|err| SigningError::io(apk, err))?
        .len();
    let MerkleTree { root, tree } =
        merkle_tree(&mut BufReader::new(file)).map_err(|err| SigningError::io(apk, err))?;

    let certificate = signer.certificate_der();
    let signed_data = V4Signature::signed_data(file_size, &root, apk_digest, certificate)
        .map_err(|err| SigningError::Crypto(err.to_string()))?;
    let signature = V4Signature {
        file_size,
        root,
        apk_digest,
        certificate,
        public_key: signer.public_key_der()?,
        signature: signer.sign_sha256(&signed_data)?,
    };

    let out = File::create(idsig).map_err(|err| SigningError::io(idsig, err))?;
    let mut w = BufWriter::new(out);
    signature
        .write(&mut w, &tree)
        .and_then(|()| w.flush())
        .map_err(|err| SigningError::io(idsig, err))?;
    tracing::debug!(
        "v4: {} byte tree over {} bytes",
        tree.len(),
        signature.file_size
    );
    Ok(())
}
