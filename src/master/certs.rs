//! Certificates: file layout, OpenSSL wrapper and renewal policy
//!
//! The client certificate is renewed when it is missing, no longer verifies
//! against the pinned master certificate, predates [`LEGACY_CUTOFF`], or
//! does not belong to the private key on disk.

use super::{MasterApi, MasterError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::{debug, error, info};

/// Certificates modified before this unix time are always reissued
pub const LEGACY_CUTOFF: u64 = 1_397_006_081;

const CA_CERT: &str = "ca.crt";
const MASTER_CERT: &str = "master.crt";
const COMMON_NAME_PREFIX: &str = "Mullvad";

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Certificate file error: {0}")]
    Io(#[from] io::Error),
    #[error("OpenSSL failed: {0}")]
    Command(String),
    #[error("Certificate not found: {0}")]
    Missing(PathBuf),
}

/// Why a client certificate has to be reissued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewReason {
    Missing,
    NotSignedByMaster,
    Legacy,
    KeyMismatch,
}

/// Certificate operations, implemented with the `openssl` binary
pub trait CertTool: Send + Sync {
    /// Does `cert_pem` verify against the CA bundle at `ca`?
    fn verify_cert(&self, cert_pem: &[u8], ca: &Path) -> Result<bool, CertError>;
    /// Do the certificate and private key share a modulus?
    fn modulus_matches(&self, cert: &Path, key: &Path) -> Result<bool, CertError>;
    /// Create an RSA-2048 key and a signing request for it
    fn generate_key(&self, key: &Path, csr: &Path, common_name: &str) -> Result<(), CertError>;
    /// Recover the data signed by `signature` using the certificate's
    /// public key; `None` if the signature does not verify
    fn recover_signed(&self, signature: &[u8], cert: &Path) -> Result<Option<Vec<u8>>, CertError>;
}

pub struct OpenSslTool {
    binary: PathBuf,
    config: Option<PathBuf>,
}

impl OpenSslTool {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("openssl"),
            config: None,
        }
    }

    /// Use a specific `openssl.cnf` for key generation
    pub fn with_config(mut self, config: PathBuf) -> Self {
        self.config = Some(config);
        self
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<std::process::Output, CertError> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| CertError::Command(format!("{}: {}", self.binary.display(), e)))?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)?;
        }
        Ok(child.wait_with_output()?)
    }
}

impl Default for OpenSslTool {
    fn default() -> Self {
        Self::new()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl CertTool for OpenSslTool {
    fn verify_cert(&self, cert_pem: &[u8], ca: &Path) -> Result<bool, CertError> {
        let output = self.run(&["verify", "-CAfile", &path_arg(ca)], Some(cert_pem))?;
        Ok(String::from_utf8_lossy(&output.stdout).contains("stdin: OK"))
    }

    fn modulus_matches(&self, cert: &Path, key: &Path) -> Result<bool, CertError> {
        let cert_modulus = self.run(&["x509", "-in", &path_arg(cert), "-modulus", "-noout"], None)?;
        let key_modulus = self.run(&["rsa", "-in", &path_arg(key), "-modulus", "-noout"], None)?;
        Ok(cert_modulus.status.success()
            && key_modulus.status.success()
            && cert_modulus.stdout == key_modulus.stdout)
    }

    fn generate_key(&self, key: &Path, csr: &Path, common_name: &str) -> Result<(), CertError> {
        let subject = format!("/CN={common_name}");
        let key = path_arg(key);
        let csr = path_arg(csr);
        let mut args: Vec<&str> = vec![
            "req", "-batch", "-days", "3650", "-nodes", "-new", "-newkey", "rsa:2048", "-subj",
            subject.as_str(), "-keyout", key.as_str(), "-out", csr.as_str(),
        ];
        let config = self.config.as_deref().map(path_arg);
        if let Some(config) = &config {
            args.push("-config");
            args.push(config.as_str());
        }

        let output = self.run(&args, None)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CertError::Command(stderr.to_string()));
        }
        Ok(())
    }

    fn recover_signed(&self, signature: &[u8], cert: &Path) -> Result<Option<Vec<u8>>, CertError> {
        let output = self.run(
            &["rsautl", "-verify", "-certin", "-inkey", &path_arg(cert)],
            Some(signature),
        )?;
        if output.status.success() {
            Ok(Some(output.stdout))
        } else {
            Ok(None)
        }
    }
}

/// Layout of the certificate directory
///
/// The CA and master certificates are copied from the installation on
/// first use; client material is named after the account id.
#[derive(Debug, Clone)]
pub struct CertStore {
    ssl_dir: PathBuf,
    installed_dir: PathBuf,
}

impl CertStore {
    pub fn new(ssl_dir: PathBuf, installed_dir: PathBuf) -> Self {
        Self {
            ssl_dir,
            installed_dir,
        }
    }

    pub fn client_cert(&self, account_id: u64) -> PathBuf {
        self.ssl_dir.join(format!("{account_id}.crt"))
    }

    pub fn client_key(&self, account_id: u64) -> PathBuf {
        self.ssl_dir.join(format!("{account_id}.key"))
    }

    pub fn client_csr(&self, account_id: u64) -> PathBuf {
        self.ssl_dir.join(format!("{account_id}.csr"))
    }

    pub fn ca_cert(&self) -> Result<PathBuf, CertError> {
        self.installed(CA_CERT)
    }

    pub fn master_cert(&self) -> Result<PathBuf, CertError> {
        self.installed(MASTER_CERT)
    }

    /// Path of the pinned master cert without installing it
    pub fn master_cert_path(&self) -> PathBuf {
        self.ssl_dir.join(MASTER_CERT)
    }

    /// Both the client certificate and key exist on disk
    pub fn has_client_credentials(&self, account_id: u64) -> bool {
        self.client_cert(account_id).exists() && self.client_key(account_id).exists()
    }

    fn installed(&self, name: &str) -> Result<PathBuf, CertError> {
        let path = self.ssl_dir.join(name);
        if path.exists() {
            return Ok(path);
        }
        let source = self.installed_dir.join(name);
        if !source.exists() {
            return Err(CertError::Missing(source));
        }
        fs::create_dir_all(&self.ssl_dir)?;
        info!("Installing certificate {} -> {}", source.display(), path.display());
        fs::copy(&source, &path)?;
        Ok(path)
    }
}

/// Decide whether the client certificate must be reissued
pub fn renewal_reason(
    tool: &dyn CertTool,
    store: &CertStore,
    account_id: u64,
) -> Result<Option<RenewReason>, CertError> {
    let cert = store.client_cert(account_id);
    if !cert.exists() {
        return Ok(Some(RenewReason::Missing));
    }

    let pem = fs::read(&cert)?;
    if !tool.verify_cert(&pem, &store.master_cert()?)? {
        return Ok(Some(RenewReason::NotSignedByMaster));
    }

    let modified = fs::metadata(&cert)?
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    if modified < LEGACY_CUTOFF {
        return Ok(Some(RenewReason::Legacy));
    }

    if !tool.modulus_matches(&cert, &store.client_key(account_id))? {
        return Ok(Some(RenewReason::KeyMismatch));
    }
    Ok(None)
}

/// Fetch the master certificate and pin it if the CA vouches for it
pub fn refresh_master_cert(
    master: &mut dyn MasterApi,
    tool: &dyn CertTool,
    store: &CertStore,
) -> Result<(), MasterError> {
    let cert = master.get_certificate()?;
    if !tool.verify_cert(&cert, &store.ca_cert()?)? {
        error!("Master certificate verification failed");
        return Ok(());
    }

    let path = store.master_cert_path();
    if fs::read(&path).ok().as_deref() == Some(cert.as_slice()) {
        return Ok(());
    }
    info!("Pinning new master certificate");
    if let Err(e) = fs::write(&path, &cert) {
        error!("Could not write master certificate: {}", e);
    }
    Ok(())
}

/// Reissue the client certificate if needed; returns true when renewed
pub fn refresh_client_cert(
    master: &mut dyn MasterApi,
    tool: &dyn CertTool,
    store: &CertStore,
    account_id: u64,
) -> Result<bool, MasterError> {
    let Some(reason) = renewal_reason(tool, store, account_id)? else {
        debug!("Client certificate is valid");
        return Ok(false);
    };
    info!("Renewing client certificate: {:?}", reason);

    let key = store.client_key(account_id);
    let csr = store.client_csr(account_id);
    tool.generate_key(&key, &csr, &format!("{COMMON_NAME_PREFIX}{account_id}"))?;
    let request = fs::read(&csr).map_err(CertError::from)?;

    let cert = master.sign_certificate(&request)?;
    fs::write(store.client_cert(account_id), cert).map_err(CertError::from)?;
    Ok(true)
}
