//! Signing pipeline for the pass manifest.
//!
//! Three stages, each a precondition for the next:
//! 1. extract the leaf certificate from the PKCS#12 container (unlock secret)
//! 2. extract the private key, re-protected under the key protection secret
//! 3. produce a detached DER signature over the exact manifest bytes
//!
//! The stages sit behind [`SigningBackend`] so they can be served in-process
//! ([`OpensslBackend`]) or by an external `openssl` executable
//! ([`OpensslCliBackend`]). Nothing is retried: a wrong secret needs a human.

mod external;
mod inprocess;

pub use external::OpensslCliBackend;
pub use inprocess::OpensslBackend;

use crate::error::{BuildError, BuildStage};
use crate::manifest::{write_file_atomic, SIGNATURE_FILE_NAME};
use crate::{BundleError, Result};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Transient certificate artifact written into the build root.
pub const CERTIFICATE_FILE_NAME: &str = "passcertificate.pem";

/// Transient re-protected key artifact written into the build root.
pub const PRIVATE_KEY_FILE_NAME: &str = "passkey.pem";

/// A password that lives only for one build and is wiped on drop.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret::new(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret::new(value)
    }
}

/// Certificate and re-protected private key extracted from the container.
pub struct SigningMaterial {
    pub certificate_pem: Zeroizing<Vec<u8>>,
    pub private_key_pem: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for SigningMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningMaterial")
            .field("certificate_pem", &self.certificate_pem.len())
            .field("private_key_pem", &"***")
            .finish()
    }
}

/// The signing capability. Implementations must map failures onto the
/// bundle error taxonomy so callers can tell which secret or file is wrong.
pub trait SigningBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Leaf certificate as PEM.
    fn extract_certificate(&self, container: &Path, unlock: &Secret) -> Result<Zeroizing<Vec<u8>>>;

    /// Private key as encrypted PEM, protected by `protection`.
    fn extract_private_key(
        &self,
        container: &Path,
        unlock: &Secret,
        protection: &Secret,
    ) -> Result<Zeroizing<Vec<u8>>>;

    /// Detached DER signature over `manifest`.
    fn sign(
        &self,
        manifest: &[u8],
        material: &SigningMaterial,
        protection: &Secret,
        authority: &Path,
    ) -> Result<Vec<u8>>;
}

/// Which signing backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Linked OpenSSL library.
    #[default]
    Openssl,
    /// External `openssl` executable.
    OpensslCli,
}

impl BackendKind {
    pub fn create(self) -> Box<dyn SigningBackend> {
        match self {
            BackendKind::Openssl => Box::new(OpensslBackend),
            BackendKind::OpensslCli => Box::new(OpensslCliBackend::default()),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openssl" | "library" | "inprocess" => Ok(BackendKind::Openssl),
            "openssl-cli" | "cli" | "external" => Ok(BackendKind::OpensslCli),
            _ => Err(format!("unknown signing backend: {}", s)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Openssl => write!(f, "openssl"),
            BackendKind::OpensslCli => write!(f, "openssl-cli"),
        }
    }
}

/// Inputs the signing stages need. Secrets are dropped (and wiped) with it.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub container: PathBuf,
    pub unlock: Secret,
    pub protection: Secret,
    pub authority: PathBuf,
}

/// Output of a completed signing run.
#[derive(Debug)]
pub struct SignedManifest {
    pub signature: Vec<u8>,
    pub material: SigningMaterial,
}

/// Runs the three signing stages and writes their artifacts into a work directory.
pub struct SigningPipeline<'a> {
    backend: &'a dyn SigningBackend,
    config: &'a SigningConfig,
    work_dir: &'a Path,
}

impl<'a> SigningPipeline<'a> {
    pub fn new(backend: &'a dyn SigningBackend, config: &'a SigningConfig, work_dir: &'a Path) -> Self {
        Self {
            backend,
            config,
            work_dir,
        }
    }

    /// Run every stage against the exact manifest bytes. The error carries the
    /// stage that failed; its cleanup report is empty.
    pub fn run(&self, manifest: &[u8]) -> std::result::Result<SignedManifest, BuildError> {
        let config = self.config;

        let certificate_pem = self
            .backend
            .extract_certificate(&config.container, &config.unlock)
            .and_then(|pem| {
                write_file_atomic(&self.work_dir.join(CERTIFICATE_FILE_NAME), &pem)?;
                Ok(pem)
            })
            .map_err(|e| BuildError::new(BuildStage::ExtractCertificate, e))?;
        debug!(backend = self.backend.name(), "Certificate extracted");

        let private_key_pem = self
            .backend
            .extract_private_key(&config.container, &config.unlock, &config.protection)
            .and_then(|pem| {
                write_file_atomic(&self.work_dir.join(PRIVATE_KEY_FILE_NAME), &pem)?;
                Ok(pem)
            })
            .map_err(|e| BuildError::new(BuildStage::ExtractPrivateKey, e))?;
        debug!(backend = self.backend.name(), "Private key extracted");

        let material = SigningMaterial {
            certificate_pem,
            private_key_pem,
        };

        let signature = self
            .backend
            .sign(manifest, &material, &config.protection, &config.authority)
            .and_then(|der| {
                write_file_atomic(&self.work_dir.join(SIGNATURE_FILE_NAME), &der)?;
                Ok(der)
            })
            .map_err(|e| BuildError::new(BuildStage::Sign, e))?;

        info!(
            backend = self.backend.name(),
            signature_bytes = signature.len(),
            "Manifest signed"
        );

        Ok(SignedManifest {
            signature,
            material,
        })
    }
}

/// Load one or more certificates from a PEM or DER file.
pub fn load_authority(path: &Path) -> Result<Vec<X509>> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => BundleError::AuthorityCertificateNotFound(path.to_path_buf()),
        _ => BundleError::io(path, e),
    })?;

    if let Ok(certs) = X509::stack_from_pem(&bytes) {
        if !certs.is_empty() {
            return Ok(certs);
        }
    }

    X509::from_der(&bytes).map(|cert| vec![cert]).map_err(|e| {
        BundleError::Signature(format!(
            "authority certificate {} is neither PEM nor DER: {}",
            path.display(),
            e
        ))
    })
}

/// What a detached signature is checked against.
pub enum Trust {
    /// Chain the signer to one of these authorities.
    Authorities(Vec<X509>),
    /// Check the signature against the embedded signer certificate only.
    SignatureOnly,
}

impl Trust {
    pub fn from_authority_file(path: &Path) -> Result<Self> {
        Ok(Trust::Authorities(load_authority(path)?))
    }
}

/// Verify a detached DER signature over `content`.
pub fn verify_detached(content: &[u8], signature_der: &[u8], trust: &Trust) -> Result<()> {
    let pkcs7 = Pkcs7::from_der(signature_der)
        .map_err(|e| BundleError::SignatureInvalid(format!("not a DER PKCS#7 structure: {}", e)))?;

    let invalid = |e: openssl::error::ErrorStack| BundleError::SignatureInvalid(e.to_string());

    let mut store = X509StoreBuilder::new().map_err(invalid)?;
    let mut flags = Pkcs7Flags::BINARY;
    match trust {
        Trust::Authorities(certs) => {
            for cert in certs {
                store.add_cert(cert.clone()).map_err(invalid)?;
            }
        }
        Trust::SignatureOnly => flags |= Pkcs7Flags::NOVERIFY,
    }
    let store = store.build();
    let extra: Stack<X509> = Stack::new().map_err(invalid)?;

    pkcs7
        .verify(&extra, &store, Some(content), None, flags)
        .map_err(invalid)
}
