//! Fixtures shared by the unit tests.

use crate::apk::sign::identity::{
    parse_certificate, SigningIdentity, CERTIFICATE_FILE, PRIVATE_KEY_FILE,
};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// PKCS#8 DER key matching [`DEBUG_CERT_PEM`].
pub const DEBUG_KEY_PK8: &[u8] = include_bytes!("../testdata/app_key.pk8");
pub const DEBUG_CERT_PEM: &str = include_str!("../testdata/app_cert.pem");
/// Unrelated PKCS#8 DER key.
pub const OTHER_KEY_PK8: &[u8] = include_bytes!("../testdata/other_key.pk8");

pub enum Fixture<'a> {
    File(&'a str, CompressionMethod, &'a [u8]),
    Dir(&'a str),
}

pub fn write_archive(path: &Path, entries: &[Fixture]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    for entry in entries {
        match entry {
            Fixture::File(name, method, contents) => {
                let options = FileOptions::default().compression_method(*method);
                zip.start_file(*name, options).unwrap();
                zip.write_all(contents).unwrap();
            }
            Fixture::Dir(name) => {
                zip.add_directory(*name, FileOptions::default()).unwrap();
            }
        }
    }
    zip.finish().unwrap();
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryInfo {
    pub name: String,
    pub method: CompressionMethod,
    pub size: u64,
    pub compressed_size: u64,
    pub crc32: u32,
    pub contents: Vec<u8>,
}

pub fn read_entries(path: &Path) -> Vec<EntryInfo> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entries = vec![];
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        let mut contents = vec![];
        file.read_to_end(&mut contents).unwrap();
        entries.push(EntryInfo {
            name: file.name().to_string(),
            method: file.compression(),
            size: file.size(),
            compressed_size: file.compressed_size(),
            crc32: file.crc32(),
            contents,
        });
    }
    entries
}

/// Offset of the first data byte of `name` inside the archive at `path`.
pub fn data_start(path: &Path, name: &str) -> u64 {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let file = archive.by_name(name).unwrap();
    file.data_start()
}

pub fn entry<'a>(entries: &'a [EntryInfo], name: &str) -> &'a EntryInfo {
    entries
        .iter()
        .find(|e| e.name == name)
        .unwrap_or_else(|| panic!("missing entry {name}"))
}

/// The debug certificate paired with an arbitrary PKCS#8 key.
pub fn identity_with_key(key: &[u8]) -> SigningIdentity {
    let key = RsaPrivateKey::from_pkcs8_der(key).unwrap();
    let (_, der, _) = parse_certificate(DEBUG_CERT_PEM).unwrap();
    SigningIdentity::new(key, der).unwrap()
}

pub fn debug_identity() -> SigningIdentity {
    identity_with_key(DEBUG_KEY_PK8)
}

pub fn write_key_store(dir: &Path, key: &[u8], cert: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(PRIVATE_KEY_FILE), key).unwrap();
    fs::write(dir.join(CERTIFICATE_FILE), cert).unwrap();
}

/// A small APK-shaped archive mixing stored and deflated entries.
pub fn sample_apk(path: &Path) {
    write_archive(
        path,
        &[
            Fixture::File(
                "AndroidManifest.xml",
                CompressionMethod::Deflated,
                b"\x03\x00\x08\x00manifest",
            ),
            Fixture::File("resources.arsc", CompressionMethod::Stored, &[7u8; 300]),
            Fixture::Dir("assets/"),
            Fixture::File(
                "assets/flutter_assets/config.json",
                CompressionMethod::Deflated,
                br#"{"theme":"dark"}"#,
            ),
            Fixture::File("classes.dex", CompressionMethod::Deflated, &[0x64u8; 5000]),
        ],
    );
}
