//! Fixtures for tests: a throwaway certificate authority, a leaf signing
//! certificate packed into a PKCS#12 container, and sample pass assets.

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509Ref, X509};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Password that unlocks fixture containers.
pub const UNLOCK_SECRET: &str = "container-unlock";

/// Password used to re-protect extracted keys in tests.
pub const PROTECTION_SECRET: &str = "key-protection";

/// File names written by [`write_signing_fixture`].
pub const CONTAINER_FILE_NAME: &str = "Certificates.p12";
pub const AUTHORITY_FILE_NAME: &str = "authority.pem";

/// Paths and certificates of a generated signing setup.
pub struct CertificateFixture {
    pub container_path: PathBuf,
    pub authority_path: PathBuf,
    pub ca_cert: X509,
    pub leaf_cert: X509,
}

fn generate_key() -> PKey<Private> {
    let rsa = Rsa::generate(2048).expect("generate RSA key");
    PKey::from_rsa(rsa).expect("wrap RSA key")
}

fn name(common_name: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().expect("name builder");
    builder
        .append_entry_by_nid(Nid::COMMONNAME, common_name)
        .expect("common name");
    builder.build()
}

fn certificate(
    serial: u32,
    subject: &X509Name,
    issuer: Option<&X509Ref>,
    pubkey: &PKey<Private>,
    signing_key: &PKey<Private>,
    ca: bool,
) -> X509 {
    let mut builder = X509Builder::new().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(serial)
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("set serial");
    builder.set_subject_name(subject).expect("subject");
    let issued = match issuer {
        Some(issuer) => builder.set_issuer_name(issuer.subject_name()),
        None => builder.set_issuer_name(subject),
    };
    issued.expect("issuer");
    builder.set_pubkey(pubkey).expect("pubkey");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not before"))
        .expect("set not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(365).expect("not after"))
        .expect("set not after");

    if ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().expect("bc"))
            .expect("append bc");
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()
                    .expect("ku"),
            )
            .expect("append ku");
    } else {
        builder
            .append_extension(BasicConstraints::new().build().expect("bc"))
            .expect("append bc");
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .build()
                    .expect("ku"),
            )
            .expect("append ku");
    }

    builder
        .sign(signing_key, MessageDigest::sha256())
        .expect("sign certificate");
    builder.build()
}

/// Generate an authority + leaf pair and write `Certificates.p12` and
/// `authority.pem` into `dir` (created if missing).
pub fn write_signing_fixture(dir: &Path) -> CertificateFixture {
    fs::create_dir_all(dir).expect("create fixture dir");

    let ca_key = generate_key();
    let ca_cert = certificate(1, &name("pkpass Test Authority"), None, &ca_key, &ca_key, true);

    let leaf_key = generate_key();
    let leaf_cert = certificate(
        2,
        &name("Pass Type ID: pass.test.pkpass"),
        Some(&ca_cert),
        &leaf_key,
        &ca_key,
        false,
    );

    let mut builder = Pkcs12::builder();
    builder.name("pass.test.pkpass").pkey(&leaf_key).cert(&leaf_cert);
    let pkcs12 = builder.build2(UNLOCK_SECRET).expect("build pkcs12");

    let container_path = dir.join(CONTAINER_FILE_NAME);
    fs::write(&container_path, pkcs12.to_der().expect("pkcs12 der")).expect("write container");

    let authority_path = dir.join(AUTHORITY_FILE_NAME);
    fs::write(&authority_path, ca_cert.to_pem().expect("ca pem")).expect("write authority");

    CertificateFixture {
        container_path,
        authority_path,
        ca_cert,
        leaf_cert,
    }
}

/// Write the two-file scenario pass: `logo.png` = "PNGX", `icon.png` = "ICNX".
pub fn write_scenario_assets(dir: &Path) {
    fs::create_dir_all(dir).expect("create asset dir");
    fs::write(dir.join("logo.png"), b"PNGX").expect("write logo");
    fs::write(dir.join("icon.png"), b"ICNX").expect("write icon");
}

/// Write a fuller pass layout including a localisation directory.
pub fn write_generic_pass(dir: &Path) {
    write_scenario_assets(dir);
    fs::write(dir.join("pass.json"), br#"{"formatVersion": 1, "description": "Generic"}"#)
        .expect("write pass.json");
    fs::write(dir.join("icon@2x.png"), b"ICNX2").expect("write icon@2x");
    fs::write(dir.join("thumbnail.png"), b"THMB").expect("write thumbnail");
    fs::create_dir_all(dir.join("en.lproj")).expect("create lproj");
    fs::write(dir.join("en.lproj/pass.strings"), b"\"greeting\" = \"Hello\";")
        .expect("write pass.strings");
}

/// Every regular file under `dir` as (relative name, content).
pub fn snapshot_dir(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(dir)
                .expect("under dir")
                .to_string_lossy()
                .replace('\\', "/");
            let data = fs::read(e.path()).expect("read file");
            (rel, data)
        })
        .collect()
}
