use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, SigningKey};
use rustls::{Certificate, PrivateKey, ServerConfig};

use crate::error::{ProxyError, ProxyResult};
use crate::trust_anchor::CertificateBundle;

/// Resolves the same certified key for every SNI name in the proxy's alias
/// set, and refuses to resolve (forcing a handshake failure, the
/// `unrecognized_name`-equivalent rustls emits) for anything else.
struct AliasRestrictedResolver {
    key: Arc<CertifiedKey>,
    aliases: Vec<String>,
}

impl ResolvesServerCert for AliasRestrictedResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let requested = client_hello.server_name()?;
        let matches = self
            .aliases
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(requested));
        if matches {
            Some(self.key.clone())
        } else {
            None
        }
    }
}

/// Build the shared, immutable `rustls::ServerConfig` used by every accepted
/// connection for the lifetime of one run. No lock is required to read it —
/// it never changes after `start`.
pub fn build_server_config(
    bundle: &CertificateBundle,
    aliases: &[String],
) -> ProxyResult<Arc<ServerConfig>> {
    let cert = Certificate(bundle.cert_der.clone());
    let key = PrivateKey(bundle.key_der.clone());

    let signing_key: Arc<dyn SigningKey> = rustls::sign::any_supported_type(&key)
        .map_err(|e| ProxyError::setup(format!("unsupported private key: {e}")))?;
    let certified_key = Arc::new(CertifiedKey::new(vec![cert], signing_key));

    let resolver = AliasRestrictedResolver {
        key: certified_key,
        aliases: aliases.to_vec(),
    };

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust_anchor::TrustAnchor;

    #[tokio::test]
    async fn builds_config_with_http11_alpn() {
        let dir = std::env::temp_dir().join(format!("rai-connect-tls-test-{}", std::process::id()));
        let aliases = vec!["osu.localhost".to_owned()];
        let anchor = TrustAnchor::new(&dir);
        let bundle = anchor.ensure(&aliases).await.unwrap();

        let config = build_server_config(&bundle, &aliases).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
