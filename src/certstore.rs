//! On-disk certificate material:
//!
//! ```text
//! <certs-root>/
//!   account.json                 ACME account credentials
//!   archives/                    rotated prior certificates
//!   <sanitized-apex>.crt         current fullchain
//!   <sanitized-apex>.key         current private key
//!   <sanitized-apex>.pem         crt+key concatenation
//!   <sanitized-apex>.issuer.crt
//!   <sanitized-apex>.json        resource metadata
//! ```
//!
//! `.crt` and `.key` exist together or neither does; archival renames the
//! full set with an epoch prefix so nothing collides.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::KnaryError;

const PEM_CERT_MARKER: &str = "-----BEGIN CERTIFICATE-----";

/// Make sure no funny chars end up in the cert file names (like wildcards ;))
pub fn sanitized_domain(domain: &str) -> Result<String, KnaryError> {
    idna::domain_to_ascii(&domain.replace('*', "_"))
        .map_err(|e| KnaryError::Certificate(format!("failed to IDNA-encode {domain:?}: {e}")))
}

/// Metadata written next to the material, so renewal knows what the bundle
/// covers without parsing it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertResource {
    pub domain: String,
    pub domains: Vec<String>,
    pub obtained: DateTime<Utc>,
}

pub struct CertStore {
    root: PathBuf,
    archive: PathBuf,
}

impl CertStore {
    pub fn new(root: PathBuf) -> Self {
        let archive = root.join("archives");
        Self { root, archive }
    }

    /// The default root is `./certs`; when the operator points `TLS_CRT`
    /// somewhere, its parent directory is the root.
    pub fn from_config(config: &Config) -> Self {
        let root = match (&config.tls_crt, &config.tls_key) {
            (Some(crt), Some(_)) => crt
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            _ => PathBuf::from("certs"),
        };
        Self::new(root)
    }

    pub fn create_folder_structure(&self) -> Result<(), KnaryError> {
        std::fs::create_dir_all(&self.archive)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(&self, domain: &str, extension: &str) -> Result<PathBuf, KnaryError> {
        Ok(self.root.join(format!("{}{extension}", sanitized_domain(domain)?)))
    }

    pub fn exists(&self, domain: &str, extension: &str) -> bool {
        self.file_name(domain, extension)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    pub fn account_path(&self) -> PathBuf {
        self.root.join("account.json")
    }

    pub fn write_file(&self, domain: &str, extension: &str, data: &[u8]) -> Result<(), KnaryError> {
        let path = self.file_name(domain, extension)?;
        std::fs::write(&path, data)?;
        debug!("wrote {path:?}");
        Ok(())
    }

    pub fn read_file(&self, domain: &str, extension: &str) -> Result<Vec<u8>, KnaryError> {
        Ok(std::fs::read(self.file_name(domain, extension)?)?)
    }

    /// Store a freshly issued bundle: fullchain, key, pem concatenation,
    /// issuer chain and metadata, in one pass.
    pub fn save_bundle(
        &self,
        domain: &str,
        cert_chain_pem: &str,
        key_pem: &str,
        sans: &[String],
    ) -> Result<(), KnaryError> {
        self.write_file(domain, ".crt", cert_chain_pem.as_bytes())?;
        self.write_file(domain, ".key", key_pem.as_bytes())?;
        self.write_file(
            domain,
            ".pem",
            format!("{cert_chain_pem}{key_pem}").as_bytes(),
        )?;

        // everything after the leaf is the issuer chain
        if let Some(issuer) = cert_chain_pem
            .match_indices(PEM_CERT_MARKER)
            .nth(1)
            .map(|(idx, _)| &cert_chain_pem[idx..])
        {
            self.write_file(domain, ".issuer.crt", issuer.as_bytes())?;
        }

        let resource = CertResource {
            domain: domain.to_string(),
            domains: sans.to_vec(),
            obtained: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&resource)
            .map_err(|e| KnaryError::Certificate(format!("failed to serialise metadata: {e}")))?;
        self.write_file(domain, ".json", &json)?;
        info!("Stored certificate material for {domain} in {:?}", self.root);
        Ok(())
    }

    pub fn read_resource(&self, domain: &str) -> Result<CertResource, KnaryError> {
        let raw = self.read_file(domain, ".json")?;
        serde_json::from_slice(&raw)
            .map_err(|e| KnaryError::Certificate(format!("unreadable metadata for {domain}: {e}")))
    }

    /// Move the whole `<sanitized>.{crt,key,pem,...}` set into `archives/`,
    /// each file prefixed with the current UNIX epoch. Rename is atomic per
    /// file and the prefix prevents collisions across renewals.
    pub fn move_to_archive(&self, domain: &str) -> Result<usize, KnaryError> {
        let prefix = format!("{}.", sanitized_domain(domain)?);
        let epoch = Utc::now().timestamp();
        let mut moved = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !entry.metadata()?.is_file() {
                continue;
            }
            let target = self.archive.join(format!("{epoch}.{name}"));
            std::fs::rename(entry.path(), &target)?;
            debug!("archived {name} -> {target:?}");
            moved += 1;
        }
        info!("Archived {moved} files for {domain}");
        Ok(moved)
    }

    /// Whole days until the current leaf's notAfter. Negative means expired.
    pub fn days_remaining(&self, domain: &str) -> Result<i64, KnaryError> {
        let raw = self.read_file(domain, ".crt")?;
        days_remaining_in_pem(&raw)
    }
}

/// Parse the first certificate in a PEM bundle and count days to notAfter.
pub fn days_remaining_in_pem(raw: &[u8]) -> Result<i64, KnaryError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(raw)
        .map_err(|e| KnaryError::Certificate(format!("not PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| KnaryError::Certificate(format!("not an x509 certificate: {e}")))?;
    let not_after = cert.validity().not_after.timestamp();
    Ok((not_after - Utc::now().timestamp()) / 86400)
}
