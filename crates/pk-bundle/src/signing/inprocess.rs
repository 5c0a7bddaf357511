//! In-process signing backend using the linked OpenSSL library.

use super::{load_authority, Secret, SigningBackend, SigningMaterial};
use crate::{BundleError, Result};
use openssl::error::ErrorStack;
use openssl::pkcs12::{ParsedPkcs12_2, Pkcs12};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::X509;
use std::fs;
use std::io;
use std::path::Path;
use zeroize::Zeroizing;

/// OpenSSL reason strings that mean the container password is wrong.
const BAD_PASSWORD_REASONS: &[&str] = &["mac verify failure", "invalid password", "bad decrypt"];

/// Signs with the OpenSSL library linked into this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpensslBackend;

impl OpensslBackend {
    fn open_container(&self, container: &Path, unlock: &Secret) -> Result<ParsedPkcs12_2> {
        let der = Zeroizing::new(fs::read(container).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BundleError::ContainerNotFound(container.to_path_buf()),
            _ => BundleError::io(container, e),
        })?);

        let pkcs12 =
            Pkcs12::from_der(&der).map_err(|e| BundleError::MalformedContainer(e.to_string()))?;

        pkcs12.parse2(unlock.expose()).map_err(|e| {
            if is_bad_password(&e) {
                BundleError::BadUnlockSecret
            } else {
                BundleError::MalformedContainer(e.to_string())
            }
        })
    }
}

fn is_bad_password(errors: &ErrorStack) -> bool {
    errors.errors().iter().any(|e| {
        e.reason()
            .map(|reason| {
                let reason = reason.to_lowercase();
                BAD_PASSWORD_REASONS.iter().any(|r| reason.contains(r))
            })
            .unwrap_or(false)
    })
}

impl SigningBackend for OpensslBackend {
    fn name(&self) -> &'static str {
        "openssl"
    }

    fn extract_certificate(&self, container: &Path, unlock: &Secret) -> Result<Zeroizing<Vec<u8>>> {
        let parsed = self.open_container(container, unlock)?;
        let cert = parsed.cert.ok_or_else(|| {
            BundleError::MalformedContainer("container holds no leaf certificate".to_string())
        })?;
        cert.to_pem()
            .map(Zeroizing::new)
            .map_err(|e| BundleError::MalformedContainer(e.to_string()))
    }

    fn extract_private_key(
        &self,
        container: &Path,
        unlock: &Secret,
        protection: &Secret,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if protection.is_empty() {
            return Err(BundleError::KeyProtection(
                "key protection secret is empty".to_string(),
            ));
        }

        let parsed = self.open_container(container, unlock)?;
        let pkey = parsed.pkey.ok_or_else(|| {
            BundleError::MalformedContainer("container holds no private key".to_string())
        })?;

        pkey.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), protection.expose().as_bytes())
            .map(Zeroizing::new)
            .map_err(|e| BundleError::KeyProtection(e.to_string()))
    }

    fn sign(
        &self,
        manifest: &[u8],
        material: &SigningMaterial,
        protection: &Secret,
        authority: &Path,
    ) -> Result<Vec<u8>> {
        let authorities = load_authority(authority)?;

        let signer = X509::from_pem(&material.certificate_pem)
            .map_err(|e| BundleError::Signature(format!("unreadable signer certificate: {}", e)))?;
        let pkey = PKey::private_key_from_pem_passphrase(
            &material.private_key_pem,
            protection.expose().as_bytes(),
        )
        .map_err(|e| BundleError::Signature(format!("private key could not be decrypted: {}", e)))?;

        let signer_key = signer
            .public_key()
            .map_err(|e| BundleError::Signature(e.to_string()))?;
        if !signer_key.public_eq(&pkey) {
            return Err(BundleError::SigningKeyMismatch);
        }

        let sig_err = |e: ErrorStack| BundleError::Signature(e.to_string());
        let mut chain = Stack::new().map_err(sig_err)?;
        for cert in authorities {
            chain.push(cert).map_err(sig_err)?;
        }

        let pkcs7 = Pkcs7::sign(
            &signer,
            &pkey,
            &chain,
            manifest,
            Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
        )
        .map_err(sig_err)?;

        pkcs7.to_der().map_err(sig_err)
    }
}
