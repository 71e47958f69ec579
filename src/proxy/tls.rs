//! Certificate authority for CONNECT interception
//!
//! A root CA is created on first run and kept on disk. Leaf certificates for each
//! intercepted host are minted on demand, signed by that CA and cached in memory.

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::{pki_types::PrivateKeyDer, ServerConfig};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

const CA_COMMON_NAME: &str = "httptap Root CA";
const CA_ORGANIZATION: &str = "httptap";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Failed to load certificate: {0}")]
    CertLoad(String),

    #[error("Invalid certificate: {0}")]
    InvalidCert(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TlsHandler {
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// PEM as stored on disk, i.e. the certificate clients were told to trust
    ca_pem: String,
    server_configs: DashMap<String, Arc<ServerConfig>>,
    ca_cert_path: PathBuf,
}

impl TlsHandler {
    /// Load the CA from `ca_dir` (default `~/.httptap`), creating it if missing
    pub fn new(ca_dir: Option<PathBuf>) -> Result<Self, TlsError> {
        let ca_dir = match ca_dir {
            Some(dir) => dir,
            None => default_ca_dir()?,
        };
        fs::create_dir_all(&ca_dir)?;

        let ca_cert_path = ca_dir.join("ca.crt");
        let ca_key_path = ca_dir.join("ca.key");
        let (ca_cert, ca_key) = Self::load_or_create_ca(&ca_cert_path, &ca_key_path)?;
        let ca_pem = fs::read_to_string(&ca_cert_path)?;
        let stored = rustls_pemfile::certs(&mut ca_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::CertLoad(e.to_string()))?;
        if stored.is_empty() {
            return Err(TlsError::CertLoad(format!(
                "No certificate found in {}",
                ca_cert_path.display()
            )));
        }

        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem,
            server_configs: DashMap::new(),
            ca_cert_path,
        })
    }

    fn load_or_create_ca(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(Certificate, KeyPair), TlsError> {
        if cert_path.exists() && key_path.exists() {
            tracing::info!(path = %cert_path.display(), "Loading CA certificate");
            let key_pem = fs::read_to_string(key_path)?;
            let key_pair =
                KeyPair::from_pem(&key_pem).map_err(|e| TlsError::CertLoad(e.to_string()))?;
            // Same subject and key as the stored certificate, so leaves signed with
            // it chain to whatever the client installed.
            let cert = ca_params()
                .map_err(TlsError::CertLoad)?
                .self_signed(&key_pair)
                .map_err(|e| TlsError::CertLoad(e.to_string()))?;
            Ok((cert, key_pair))
        } else {
            tracing::info!(path = %cert_path.display(), "Generating new CA certificate");
            let (cert, key_pair) = Self::generate_root_ca()?;
            fs::write(cert_path, cert.pem())?;
            fs::write(key_path, key_pair.serialize_pem())?;
            restrict_permissions(key_path)?;
            Ok((cert, key_pair))
        }
    }

    fn generate_root_ca() -> Result<(Certificate, KeyPair), TlsError> {
        let key_pair = KeyPair::generate().map_err(|e| TlsError::CertGeneration(e.to_string()))?;
        let cert = ca_params()
            .map_err(TlsError::CertGeneration)?
            .self_signed(&key_pair)
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;
        Ok((cert, key_pair))
    }

    fn generate_leaf_cert(
        host: &str,
        ca_cert: &Certificate,
        ca_key: &KeyPair,
    ) -> Result<(Certificate, KeyPair), TlsError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(90);

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string().try_into().map_err(|e| {
                TlsError::CertGeneration(format!("Invalid host name {host}: {e:?}"))
            })?),
        };
        params.subject_alt_names = vec![san];

        let key_pair = KeyPair::generate().map_err(|e| TlsError::CertGeneration(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, ca_cert, ca_key)
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        Ok((cert, key_pair))
    }

    /// Server configuration presenting a certificate for `host`
    pub fn get_server_config(&self, host: &str) -> Result<Arc<ServerConfig>, TlsError> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Some(config) = self.server_configs.get(host) {
            return Ok(config.clone());
        }

        let (leaf_cert, leaf_key) = Self::generate_leaf_cert(host, &self.ca_cert, &self.ca_key)?;
        let cert_chain = vec![leaf_cert.der().clone(), self.ca_cert.der().clone()];
        let private_key = PrivateKeyDer::try_from(leaf_key.serialize_der())
            .map_err(|e| TlsError::InvalidCert(format!("Invalid private key: {e}")))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsError::InvalidCert(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.server_configs.insert(host.to_string(), config.clone());
        tracing::debug!(host, "Issued interception certificate");

        Ok(config)
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_pem
    }

    pub fn ca_cert_path(&self) -> &Path {
        &self.ca_cert_path
    }

    /// Hosts with a cached certificate
    pub fn cached_hosts(&self) -> usize {
        self.server_configs.len()
    }
}

fn default_ca_dir() -> Result<PathBuf, TlsError> {
    Ok(dirs::home_dir()
        .ok_or_else(|| TlsError::CertLoad("Could not find home directory".to_string()))?
        .join(".httptap"))
}

fn ca_params() -> Result<CertificateParams, String> {
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| e.to_string())?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(3650);

    Ok(params)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), TlsError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), TlsError> {
    Ok(())
}
