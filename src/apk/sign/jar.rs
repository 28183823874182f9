//! JAR (v1) signing.
//!
//! Entries are copied, STORED ones realigned, while their bytes are hashed into
//! `META-INF/MANIFEST.MF`. `<NAME>.SF` then digests the manifest and each of
//! its sections, and `<NAME>.RSA` holds the PKCS#7 signature over the `.SF`.

use super::{pkcs7, Signer};
use crate::apk::archive::copy_entry;
use crate::error::SigningError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest as _, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
const META_INF: &str = "META-INF/";
const SIGNATURE_EXTENSIONS: &[&str] = &[".SF", ".RSA", ".DSA", ".EC"];
/// Line length limit of the manifest format, without the line break.
const MAX_LINE_LENGTH: usize = 72;
const DIGEST_ATTRIBUTE: &str = "SHA-256-Digest";

fn digest_reader(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    io::copy(r, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

#[derive(Clone, Debug)]
pub(crate) struct JarOptions<'a> {
    /// Base name of the `.SF` and `.RSA` files.
    pub signer_name: &'a str,
    pub created_by: &'a str,
    /// Value of `X-Android-APK-Signed`, naming the APK schemes also applied.
    pub apk_signed: Option<String>,
}

/// Manifest and previous signature files, which are regenerated on signing.
pub fn is_signature_file(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    if upper == MANIFEST_NAME {
        return true;
    }
    match upper.strip_prefix(META_INF) {
        Some(file) if !file.contains('/') => {
            SIGNATURE_EXTENSIONS.iter().any(|ext| file.ends_with(ext))
        }
        _ => false,
    }
}

/// Appends `name: value` to `out`, wrapped at [`MAX_LINE_LENGTH`] bytes.
fn write_attribute(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{}: {}", name, value);
    let mut rest = line.as_bytes();
    let mut limit = MAX_LINE_LENGTH;
    loop {
        let (head, tail) = rest.split_at(rest.len().min(limit));
        out.extend_from_slice(head);
        out.extend_from_slice(b"\r\n");
        if tail.is_empty() {
            break;
        }
        out.push(b' ');
        rest = tail;
        limit = MAX_LINE_LENGTH - 1;
    }
}

struct Manifest {
    bytes: Vec<u8>,
    /// Entry name and the bytes of its section, blank line included.
    sections: Vec<(String, Vec<u8>)>,
}

impl Manifest {
    fn new(created_by: &str) -> Self {
        let mut bytes = vec![];
        write_attribute(&mut bytes, "Manifest-Version", "1.0");
        write_attribute(&mut bytes, "Created-By", created_by);
        bytes.extend_from_slice(b"\r\n");
        Self {
            bytes,
            sections: vec![],
        }
    }

    fn add(&mut self, name: &str, hash: &[u8]) {
        let mut section = vec![];
        write_attribute(&mut section, "Name", name);
        write_attribute(&mut section, DIGEST_ATTRIBUTE, &BASE64.encode(hash));
        section.extend_from_slice(b"\r\n");
        self.bytes.extend_from_slice(&section);
        self.sections.push((name.to_string(), section));
    }

    fn signature_file(&self, options: &JarOptions) -> Vec<u8> {
        let mut sf = vec![];
        write_attribute(&mut sf, "Signature-Version", "1.0");
        write_attribute(&mut sf, "Created-By", options.created_by);
        write_attribute(
            &mut sf,
            &format!("{}-Manifest", DIGEST_ATTRIBUTE),
            &BASE64.encode(Sha256::digest(&self.bytes)),
        );
        if let Some(schemes) = &options.apk_signed {
            write_attribute(&mut sf, "X-Android-APK-Signed", schemes);
        }
        sf.extend_from_slice(b"\r\n");
        for (name, section) in &self.sections {
            write_attribute(&mut sf, "Name", name);
            write_attribute(
                &mut sf,
                DIGEST_ATTRIBUTE,
                &BASE64.encode(Sha256::digest(section)),
            );
            sf.extend_from_slice(b"\r\n");
        }
        sf
    }
}

/// Copies `input` into `out` with a fresh JAR signature.
pub(crate) fn sign_jar<W: Write + Seek>(
    input: &Path,
    out: W,
    out_path: &Path,
    signer: &Signer,
    options: &JarOptions,
) -> Result<W, SigningError> {
    let file = File::open(input).map_err(|err| SigningError::io(input, err))?;
    let mut archive =
        ZipArchive::new(BufReader::new(file)).map_err(|err| SigningError::zip(input, err))?;
    let mut zip = ZipWriter::new(out);
    let mut manifest = Manifest::new(options.created_by);
    let mut seen = HashSet::new();

    for index in 0..archive.len() {
        let (name, hash) = {
            let mut file = archive
                .by_index(index)
                .map_err(|err| SigningError::zip(input, err))?;
            let name = file.name().to_string();
            if file.is_dir() || is_signature_file(&name) || seen.contains(&name) {
                tracing::debug!("v1: not signing `{}`", name);
                continue;
            }
            let hash = digest_reader(&mut file).map_err(|err| SigningError::io(input, err))?;
            (name, hash)
        };
        copy_entry(&mut archive, index, &mut zip)
            .map_err(|err| SigningError::zip(out_path, err))?;
        manifest.add(&name, &hash);
        seen.insert(name);
    }

    let sf = manifest.signature_file(options);
    let rsa = pkcs7::signed_data(signer, &sf)?;
    let meta = [
        (MANIFEST_NAME.to_string(), &manifest.bytes),
        (format!("{}{}.SF", META_INF, options.signer_name), &sf),
        (format!("{}{}.RSA", META_INF, options.signer_name), &rsa),
    ];
    let file_options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, contents) in meta {
        zip.start_file(name, file_options)
            .map_err(|err| SigningError::zip(out_path, err))?;
        zip.write_all(contents)
            .map_err(|err| SigningError::io(out_path, err))?;
    }
    tracing::debug!("v1: signed {} entries", manifest.sections.len());

    zip.finish().map_err(|err| SigningError::zip(out_path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        debug_identity, entry, read_entries, sample_apk, write_archive, Fixture,
    };
    use std::io::BufWriter;
    use tempfile::tempdir;

    fn attributes(text: &str) -> Vec<(String, String)> {
        // Unfold continuation lines first.
        let unfolded = text.replace("\r\n ", "");
        unfolded
            .split("\r\n")
            .filter_map(|line| line.split_once(": "))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sign_sample(
        apk_signed: Option<&str>,
        entries: &[Fixture],
    ) -> Vec<crate::test_support::EntryInfo> {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        let output = dir.path().join("out.apk");
        if entries.is_empty() {
            sample_apk(&input);
        } else {
            write_archive(&input, entries);
        }
        let identity = debug_identity();
        let signer = Signer::new(&identity).unwrap();
        let options = JarOptions {
            signer_name: "CERT",
            created_by: "apkpatch",
            apk_signed: apk_signed.map(str::to_string),
        };
        let out = BufWriter::new(File::create(&output).unwrap());
        sign_jar(&input, out, &output, &signer, &options)
            .unwrap()
            .flush()
            .unwrap();
        read_entries(&output)
    }

    #[test]
    fn recognises_signature_files() {
        assert!(is_signature_file("META-INF/MANIFEST.MF"));
        assert!(is_signature_file("META-INF/CERT.SF"));
        assert!(is_signature_file("META-INF/ANDROIDD.RSA"));
        assert!(is_signature_file("META-INF/key.ec"));
        assert!(is_signature_file("META-INF/OLD.DSA"));
        assert!(!is_signature_file("META-INF/services/java.sql.Driver"));
        assert!(!is_signature_file("META-INF/nested/CERT.SF"));
        assert!(!is_signature_file("assets/CERT.SF"));
    }

    #[test]
    fn long_attributes_wrap_at_72_bytes() {
        let name = format!("assets/{}.txt", "x".repeat(150));
        let mut out = vec![];
        write_attribute(&mut out, "Name", &name);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.split_terminator("\r\n").collect();
        assert!(lines.len() > 2);
        assert_eq!(lines[0].len(), 72);
        for line in &lines[1..] {
            assert!(line.starts_with(' '));
            assert!(line.len() <= 72);
        }
        assert_eq!(
            attributes(&text),
            vec![("Name".to_string(), name.clone())]
        );
    }

    #[test]
    fn short_attribute_is_one_line() {
        let mut out = vec![];
        write_attribute(&mut out, "Manifest-Version", "1.0");
        assert_eq!(out, b"Manifest-Version: 1.0\r\n");
    }

    #[test]
    fn manifest_digests_match_entry_contents() {
        let after = sign_sample(None, &[]);
        let manifest = String::from_utf8(entry(&after, MANIFEST_NAME).contents.clone()).unwrap();
        let attrs = attributes(&manifest);

        for name in ["AndroidManifest.xml", "resources.arsc", "classes.dex"] {
            let position = attrs
                .iter()
                .position(|(k, v)| k == "Name" && v == name)
                .unwrap();
            let (key, value) = &attrs[position + 1];
            assert_eq!(key, "SHA-256-Digest");
            let expected = BASE64.encode(Sha256::digest(&entry(&after, name).contents));
            assert_eq!(value, &expected);
        }
        assert!(!manifest.contains("Name: assets/\r\n"));
    }

    #[test]
    fn signature_file_digests_the_manifest() {
        let after = sign_sample(Some("2, 3"), &[]);
        let manifest = &entry(&after, MANIFEST_NAME).contents;
        let sf = String::from_utf8(entry(&after, "META-INF/CERT.SF").contents.clone()).unwrap();

        let attrs = attributes(&sf);
        assert!(attrs.contains(&(
            "SHA-256-Digest-Manifest".to_string(),
            BASE64.encode(Sha256::digest(manifest))
        )));
        assert!(attrs.contains(&("X-Android-APK-Signed".to_string(), "2, 3".to_string())));

        let rsa = &entry(&after, "META-INF/CERT.RSA").contents;
        assert_eq!(rsa[0], 0x30);
        let cert = debug_identity();
        let der = cert.certificate_der();
        assert!(rsa.windows(der.len()).any(|window| window == der));
    }

    #[test]
    fn old_signatures_are_replaced() {
        let after = sign_sample(
            None,
            &[
                Fixture::File("META-INF/MANIFEST.MF", CompressionMethod::Deflated, b"stale"),
                Fixture::File("META-INF/ANDROIDD.SF", CompressionMethod::Deflated, b"stale"),
                Fixture::File("META-INF/ANDROIDD.RSA", CompressionMethod::Deflated, b"stale"),
                Fixture::Dir("res/"),
                Fixture::File("res/a.xml", CompressionMethod::Stored, b"<a/>"),
            ],
        );
        let names: Vec<_> = after.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "res/a.xml",
                "META-INF/MANIFEST.MF",
                "META-INF/CERT.SF",
                "META-INF/CERT.RSA"
            ]
        );
        let manifest = String::from_utf8(entry(&after, MANIFEST_NAME).contents.clone()).unwrap();
        assert!(manifest.contains("SHA-256-Digest: "));
        assert!(!manifest.contains("stale"));
        assert_eq!(entry(&after, "res/a.xml").method, CompressionMethod::Stored);
    }
}
