//! Signing backend that drives an external `openssl` executable.
//!
//! Secrets reach the child process through environment variables
//! (`-passin env:…`), never through its argument list.

use super::{load_authority, Secret, SigningBackend, SigningMaterial};
use crate::{BundleError, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;
use zeroize::Zeroizing;

const UNLOCK_ENV: &str = "PKPASS_OPENSSL_PASSIN";
const PROTECTION_ENV: &str = "PKPASS_OPENSSL_PASSOUT";

const BAD_PASSWORD_MARKERS: &[&str] = &["mac verify failure", "invalid password", "bad decrypt"];
const KEY_MISMATCH_MARKERS: &[&str] = &["key values mismatch", "private key does not match"];

/// Signs by invoking `openssl pkcs12` and `openssl smime`.
#[derive(Debug, Clone)]
pub struct OpensslCliBackend {
    program: PathBuf,
}

impl Default for OpensslCliBackend {
    fn default() -> Self {
        Self::new("openssl")
    }
}

impl OpensslCliBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Whether the executable can be started at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the executable; `Ok(Err(stderr))` means it ran and failed.
    fn run(
        &self,
        args: &[OsString],
        secrets: &[(&str, &Secret)],
    ) -> Result<std::result::Result<Zeroizing<Vec<u8>>, String>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).stdin(Stdio::null());
        for (name, secret) in secrets {
            cmd.env(name, secret.expose());
        }

        debug!(program = %self.program.display(), subcommand = ?args.first(), "Running openssl");
        let output = cmd.output().map_err(|e| BundleError::io(&self.program, e))?;

        if output.status.success() {
            Ok(Ok(Zeroizing::new(output.stdout)))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Ok(Err(format!("{} ({})", stderr, output.status)))
        }
    }
}

fn mentions(stderr: &str, markers: &[&str]) -> bool {
    let lower = stderr.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

fn container_error(stderr: String) -> BundleError {
    if mentions(&stderr, BAD_PASSWORD_MARKERS) {
        BundleError::BadUnlockSecret
    } else {
        BundleError::MalformedContainer(stderr)
    }
}

/// Drop the bag attributes `openssl pkcs12` prints ahead of the PEM block.
fn pem_from(output: &[u8], what: &str) -> Result<Zeroizing<Vec<u8>>> {
    let marker = b"-----BEGIN ";
    output
        .windows(marker.len())
        .position(|w| w == marker)
        .map(|start| Zeroizing::new(output[start..].to_vec()))
        .ok_or_else(|| BundleError::MalformedContainer(format!("container holds no {}", what)))
}

fn arg(s: impl Into<OsString>) -> OsString {
    s.into()
}

impl SigningBackend for OpensslCliBackend {
    fn name(&self) -> &'static str {
        "openssl-cli"
    }

    fn extract_certificate(&self, container: &Path, unlock: &Secret) -> Result<Zeroizing<Vec<u8>>> {
        if !container.is_file() {
            return Err(BundleError::ContainerNotFound(container.to_path_buf()));
        }

        let args = [
            arg("pkcs12"),
            arg("-in"),
            arg(container),
            arg("-clcerts"),
            arg("-nokeys"),
            arg("-passin"),
            arg(format!("env:{}", UNLOCK_ENV)),
        ];
        let stdout = self
            .run(&args, &[(UNLOCK_ENV, unlock)])?
            .map_err(container_error)?;
        pem_from(&stdout, "leaf certificate")
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
        if !container.is_file() {
            return Err(BundleError::ContainerNotFound(container.to_path_buf()));
        }

        let args = [
            arg("pkcs12"),
            arg("-in"),
            arg(container),
            arg("-nocerts"),
            arg("-passin"),
            arg(format!("env:{}", UNLOCK_ENV)),
            arg("-passout"),
            arg(format!("env:{}", PROTECTION_ENV)),
        ];
        let stdout = self
            .run(&args, &[(UNLOCK_ENV, unlock), (PROTECTION_ENV, protection)])?
            .map_err(|stderr| {
                if mentions(&stderr, BAD_PASSWORD_MARKERS) {
                    BundleError::BadUnlockSecret
                } else if mentions(&stderr, &["passout", "outputting keys", "encrypt"]) {
                    BundleError::KeyProtection(stderr)
                } else {
                    BundleError::MalformedContainer(stderr)
                }
            })?;
        pem_from(&stdout, "private key")
    }

    fn sign(
        &self,
        manifest: &[u8],
        material: &SigningMaterial,
        protection: &Secret,
        authority: &Path,
    ) -> Result<Vec<u8>> {
        let authorities = load_authority(authority)?;

        let scratch = tempfile::TempDir::new().map_err(|e| BundleError::io(std::env::temp_dir(), e))?;
        let write = |name: &str, data: &[u8]| -> Result<PathBuf> {
            let path = scratch.path().join(name);
            fs::write(&path, data).map_err(|e| BundleError::io(&path, e))?;
            Ok(path)
        };

        let mut authority_pem = Vec::new();
        for cert in &authorities {
            let pem = cert
                .to_pem()
                .map_err(|e| BundleError::Signature(e.to_string()))?;
            authority_pem.extend_from_slice(&pem);
        }

        let authority_path = write("authority.pem", authority_pem.as_slice())?;
        let cert_path = write("signer.pem", material.certificate_pem.as_slice())?;
        let key_path = write("signer.key", material.private_key_pem.as_slice())?;
        let manifest_path = write("manifest", manifest)?;

        let args = [
            arg("smime"),
            arg("-binary"),
            arg("-sign"),
            arg("-certfile"),
            arg(&authority_path),
            arg("-signer"),
            arg(&cert_path),
            arg("-inkey"),
            arg(&key_path),
            arg("-in"),
            arg(&manifest_path),
            arg("-outform"),
            arg("DER"),
            arg("-passin"),
            arg(format!("env:{}", PROTECTION_ENV)),
        ];
        let stdout = self
            .run(&args, &[(PROTECTION_ENV, protection)])?
            .map_err(|stderr| {
                if mentions(&stderr, KEY_MISMATCH_MARKERS) {
                    BundleError::SigningKeyMismatch
                } else {
                    BundleError::Signature(stderr)
                }
            })?;

        Ok(stdout.to_vec())
    }
}
