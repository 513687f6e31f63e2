use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ProxyError, ProxyResult};

const VALIDITY_DAYS: i64 = 365 * 10;
const RENEW_WITHIN_DAYS: i64 = 30;

/// A loaded or freshly generated certificate/key pair, held in memory for the
/// lifetime of the run and shared read-only by every accepted connection.
#[derive(Clone)]
pub struct CertificateBundle {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub not_after_unix: u64,
}

/// Metadata sidecar recording the certificate's expiry, so `ensure` can
/// decide whether to regenerate without parsing the DER back out.
#[derive(Serialize, Deserialize)]
struct BundleMeta {
    not_after_unix: u64,
}

/// Owns the on-disk certificate bundle: generates it once, reuses it across
/// runs, and is the only component allowed to write these files.
pub struct TrustAnchor {
    cert_path: PathBuf,
    key_path: PathBuf,
    meta_path: PathBuf,
}

impl TrustAnchor {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            cert_path: data_dir.join("cert.der"),
            key_path: data_dir.join("key.der"),
            meta_path: data_dir.join("cert.meta.json"),
        }
    }

    /// Load the bundle from disk if present and not close to expiry,
    /// otherwise generate and persist a new one.
    pub async fn ensure(&self, aliases: &[String]) -> ProxyResult<CertificateBundle> {
        if let Some(bundle) = self.load_if_fresh().await? {
            return Ok(bundle);
        }

        info!("generating a new self-signed certificate bundle");
        let bundle = generate_bundle(aliases)
            .map_err(|e| ProxyError::setup(format!("certificate generation failed: {e}")))?;
        self.persist(&bundle).await?;
        Ok(bundle)
    }

    /// Load whatever bundle is on disk, regardless of expiry. Used by
    /// uninstall, which should act on the certificate that's actually
    /// installed rather than implicitly provisioning a new one.
    pub async fn load_existing(&self) -> ProxyResult<Option<CertificateBundle>> {
        if !self.cert_path.exists() || !self.key_path.exists() || !self.meta_path.exists() {
            return Ok(None);
        }
        let meta_bytes = tokio::fs::read(&self.meta_path)
            .await
            .map_err(|e| ProxyError::setup(format!("failed to read certificate metadata: {e}")))?;
        let meta: BundleMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| ProxyError::setup(format!("corrupt certificate metadata: {e}")))?;
        let cert_der = tokio::fs::read(&self.cert_path)
            .await
            .map_err(|e| ProxyError::setup(format!("failed to read certificate: {e}")))?;
        let key_der = tokio::fs::read(&self.key_path)
            .await
            .map_err(|e| ProxyError::setup(format!("failed to read private key: {e}")))?;
        Ok(Some(CertificateBundle {
            cert_der,
            key_der,
            not_after_unix: meta.not_after_unix,
        }))
    }

    async fn load_if_fresh(&self) -> ProxyResult<Option<CertificateBundle>> {
        if !self.cert_path.exists() || !self.key_path.exists() || !self.meta_path.exists() {
            return Ok(None);
        }

        let meta_bytes = tokio::fs::read(&self.meta_path)
            .await
            .map_err(|e| ProxyError::setup(format!("failed to read certificate metadata: {e}")))?;
        let meta: BundleMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| ProxyError::setup(format!("corrupt certificate metadata: {e}")))?;

        let now = unix_now();
        let renew_threshold = Duration::from_secs(RENEW_WITHIN_DAYS as u64 * 24 * 3600).as_secs();
        if meta.not_after_unix <= now.saturating_add(renew_threshold) {
            warn!("existing certificate is within {RENEW_WITHIN_DAYS} days of expiry, regenerating");
            return Ok(None);
        }

        let cert_der = tokio::fs::read(&self.cert_path)
            .await
            .map_err(|e| ProxyError::setup(format!("failed to read certificate: {e}")))?;
        let key_der = tokio::fs::read(&self.key_path)
            .await
            .map_err(|e| ProxyError::setup(format!("failed to read private key: {e}")))?;

        Ok(Some(CertificateBundle {
            cert_der,
            key_der,
            not_after_unix: meta.not_after_unix,
        }))
    }

    async fn persist(&self, bundle: &CertificateBundle) -> ProxyResult<()> {
        if let Some(parent) = self.cert_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::setup(format!("failed to create {}: {e}", parent.display())))?;
        }

        write_atomic(&self.key_path, &bundle.key_der).await?;
        write_atomic(&self.cert_path, &bundle.cert_der).await?;
        let meta = BundleMeta {
            not_after_unix: bundle.not_after_unix,
        };
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| ProxyError::setup(format!("failed to serialize certificate metadata: {e}")))?;
        write_atomic(&self.meta_path, &meta_bytes).await?;

        Ok(())
    }

    /// Add the certificate to the OS root-trust store. Idempotent: installing
    /// the same certificate twice must not be treated as an error.
    pub fn install_to_system_trust(&self, bundle: &CertificateBundle) -> ProxyResult<()> {
        match system_trust::install(&self.cert_path, bundle) {
            Ok(()) => {
                info!("certificate installed into the system trust store");
                Ok(())
            }
            Err(TrustStoreError::AlreadyPresent) => {
                info!("certificate already present in the system trust store");
                Ok(())
            }
            Err(TrustStoreError::PermissionDenied) => Err(ProxyError::setup(
                "installing the certificate requires elevated privileges",
            )),
            Err(TrustStoreError::Other(msg)) => Err(ProxyError::setup(msg)),
        }
    }

    /// Remove the certificate by subject+fingerprint match. Never matches by
    /// CN substring — removing the wrong certificate would be worse than
    /// leaving a stale one installed.
    pub fn uninstall_from_system_trust(&self, bundle: &CertificateBundle) -> ProxyResult<()> {
        let fingerprint = sha1_fingerprint_hex(&bundle.cert_der);
        match system_trust::uninstall(bundle, &fingerprint) {
            Ok(()) | Err(TrustStoreError::AlreadyPresent) => Ok(()),
            Err(TrustStoreError::PermissionDenied) => Err(ProxyError::setup(
                "removing the certificate requires elevated privileges",
            )),
            Err(TrustStoreError::Other(msg)) => Err(ProxyError::setup(msg)),
        }
    }
}

/// SHA-1 hex digest of the certificate DER, matching the thumbprint format
/// both `security`(macOS) and `certutil`(Windows) expect on the command
/// line, so uninstall can match the exact certificate instead of its CN.
fn sha1_fingerprint_hex(der: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(der);
    digest.iter().map(|b| format!("{b:02X}")).collect()
}

fn generate_bundle(aliases: &[String]) -> Result<CertificateBundle, rcgen::RcgenError> {
    let mut sans: Vec<SanType> = aliases
        .iter()
        .map(|alias| SanType::DnsName(alias.clone()))
        .collect();
    if !sans.iter().any(|s| matches!(s, SanType::DnsName(n) if n == "localhost")) {
        sans.push(SanType::DnsName("localhost".to_owned()));
    }

    let mut params = CertificateParams::default();
    params.subject_alt_names = sans;
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "rai-connect local");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];

    let now = time::OffsetDateTime::now_utc();
    let not_after = now + time::Duration::days(VALIDITY_DAYS);
    params.not_before = now;
    params.not_after = not_after;

    let cert = Certificate::from_params(params)?;
    let cert_der = cert.serialize_der()?;
    let key_der = cert.serialize_private_key_der();

    Ok(CertificateBundle {
        cert_der,
        key_der,
        not_after_unix: not_after.unix_timestamp() as u64,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

async fn write_atomic(path: &Path, contents: &[u8]) -> ProxyResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ProxyError::setup("certificate path has no parent directory"))?;
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let tmp_path = parent.join(format!(".{file_name}.tmp.{pid}.{nanos}"));

    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(|e| ProxyError::setup(format!("failed to write {}: {e}", tmp_path.display())))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| ProxyError::setup(format!("failed to rename into {}: {e}", path.display())))?;
    Ok(())
}

/// Distinguishes a caller needing elevation from a no-op re-install.
enum TrustStoreError {
    AlreadyPresent,
    PermissionDenied,
    Other(String),
}

/// OS-conditional wrappers around the platform's trust-store tool. Each
/// implementation shells out to the tool the OS documents for this purpose
/// rather than reimplementing a keychain/NSS/CAPI client in-process.
mod system_trust {
    use super::{CertificateBundle, TrustStoreError};
    use std::path::Path;
    use std::process::Command;

    #[cfg(target_os = "macos")]
    pub fn install(cert_path: &Path, _bundle: &CertificateBundle) -> Result<(), TrustStoreError> {
        let output = Command::new("security")
            .args([
                "add-trusted-cert",
                "-d",
                "-r",
                "trustRoot",
                "-k",
                "/Library/Keychains/System.keychain",
            ])
            .arg(cert_path)
            .output()
            .map_err(|e| TrustStoreError::Other(e.to_string()))?;
        classify_command_result(output)
    }

    #[cfg(target_os = "macos")]
    pub fn uninstall(_bundle: &CertificateBundle, fingerprint_hex: &str) -> Result<(), TrustStoreError> {
        let output = Command::new("security")
            .args(["delete-certificate", "-Z", fingerprint_hex])
            .output()
            .map_err(|e| TrustStoreError::Other(e.to_string()))?;
        classify_command_result(output)
    }

    #[cfg(target_os = "linux")]
    pub fn install(cert_path: &Path, _bundle: &CertificateBundle) -> Result<(), TrustStoreError> {
        let dest = Path::new("/usr/local/share/ca-certificates/rai-connect.crt");
        std::fs::copy(cert_path, dest).map_err(|e| TrustStoreError::Other(e.to_string()))?;
        let output = Command::new("update-ca-certificates")
            .output()
            .map_err(|e| TrustStoreError::Other(e.to_string()))?;
        classify_command_result(output)
    }

    #[cfg(target_os = "linux")]
    pub fn uninstall(_bundle: &CertificateBundle, _fingerprint_hex: &str) -> Result<(), TrustStoreError> {
        let dest = Path::new("/usr/local/share/ca-certificates/rai-connect.crt");
        if dest.exists() {
            std::fs::remove_file(dest).map_err(|e| TrustStoreError::Other(e.to_string()))?;
        }
        let output = Command::new("update-ca-certificates")
            .arg("--fresh")
            .output()
            .map_err(|e| TrustStoreError::Other(e.to_string()))?;
        classify_command_result(output)
    }

    #[cfg(target_os = "windows")]
    pub fn install(cert_path: &Path, _bundle: &CertificateBundle) -> Result<(), TrustStoreError> {
        let output = Command::new("certutil")
            .args(["-addstore", "-f", "Root"])
            .arg(cert_path)
            .output()
            .map_err(|e| TrustStoreError::Other(e.to_string()))?;
        classify_command_result(output)
    }

    #[cfg(target_os = "windows")]
    pub fn uninstall(_bundle: &CertificateBundle, fingerprint_hex: &str) -> Result<(), TrustStoreError> {
        let output = Command::new("certutil")
            .args(["-delstore", "Root", fingerprint_hex])
            .output()
            .map_err(|e| TrustStoreError::Other(e.to_string()))?;
        classify_command_result(output)
    }

    fn classify_command_result(output: std::process::Output) -> Result<(), TrustStoreError> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("already") || stderr.contains("exists") || stderr.contains("duplicate") {
            return Err(TrustStoreError::AlreadyPresent);
        }
        if stderr.contains("permission") || stderr.contains("denied") || stderr.contains("access") {
            return Err(TrustStoreError::PermissionDenied);
        }
        Err(TrustStoreError::Other(stderr.trim().to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_generates_and_reuses_bundle() {
        let dir = std::env::temp_dir().join(format!("rai-connect-test-{}", std::process::id()));
        let anchor = TrustAnchor::new(&dir);
        let aliases = vec!["osu.localhost".to_owned(), "c.localhost".to_owned()];

        let first = anchor.ensure(&aliases).await.unwrap();
        let second = anchor.ensure(&aliases).await.unwrap();

        assert_eq!(first.cert_der, second.cert_der);
        assert_eq!(first.key_der, second.key_der);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bundle_validates_against_itself() {
        let bundle =
            generate_bundle(&["localhost".to_owned(), "osu.localhost".to_owned()]).unwrap();
        assert!(!bundle.cert_der.is_empty());
        assert!(!bundle.key_der.is_empty());
        assert!(bundle.not_after_unix > unix_now());
    }
}
