//! TLS configuration with hot certificate rotation.
//!
//! Listener TLS material comes from a file-based cert source. The server
//! config holds a resolver whose certificate is swapped atomically by a
//! background reload task, so rotations take effect on the next handshake
//! without restarting the listener.

use crate::config::{CertSourceConfig, ListenConfig};
use crate::error::{ProxyError, Result};
use arc_swap::ArcSwap;
use rustls::crypto::aws_lc_rs as crypto;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Loads certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| ProxyError::TlsConfig {
        message: format!("failed to open cert file: {}", e),
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|cert| cert.ok())
        .collect();

    if certs.is_empty() {
        return Err(ProxyError::TlsConfig {
            message: "no certificates found in file".to_string(),
        });
    }

    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| ProxyError::TlsConfig {
        message: format!("failed to open key file: {}", e),
    })?;
    let mut reader = BufReader::new(file);

    let keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::read_all(&mut reader)
        .filter_map(|item| match item.ok()? {
            rustls_pemfile::Item::Pkcs1Key(key) => Some(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => Some(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => Some(PrivateKeyDer::Sec1(key)),
            _ => None,
        })
        .collect();

    keys.into_iter()
        .next()
        .ok_or_else(|| ProxyError::TlsConfig {
            message: "no private key found in file".to_string(),
        })
}

fn load_certified_key(source: &CertSourceConfig) -> Result<Arc<CertifiedKey>> {
    let certs = load_certs(Path::new(&source.cert_path))?;
    let key = load_private_key(Path::new(&source.key_path))?;
    let signing_key =
        crypto::sign::any_supported_type(&key).map_err(|e| ProxyError::TlsConfig {
            message: format!("unsupported private key: {}", e),
        })?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Certificate resolver whose material can be replaced between
/// handshakes.
pub struct HotCertResolver {
    current: ArcSwap<CertifiedKey>,
    /// Reject handshakes without an SNI server name.
    strict_match: bool,
}

impl std::fmt::Debug for HotCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotCertResolver")
            .field("strict_match", &self.strict_match)
            .finish_non_exhaustive()
    }
}

impl HotCertResolver {
    fn new(key: Arc<CertifiedKey>, strict_match: bool) -> Self {
        Self {
            current: ArcSwap::new(key),
            strict_match,
        }
    }

    /// Swaps in freshly loaded certificate material.
    pub fn replace(&self, key: Arc<CertifiedKey>) {
        self.current.store(key);
    }
}

impl ResolvesServerCert for HotCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        if self.strict_match && client_hello.server_name().is_none() {
            return None;
        }
        Some(self.current.load_full())
    }
}

fn protocol_versions(
    min: Option<&str>,
    max: Option<&str>,
) -> Result<Vec<&'static SupportedProtocolVersion>> {
    fn rank(v: &str) -> Result<u8> {
        match v {
            "1.2" => Ok(2),
            "1.3" => Ok(3),
            other => Err(ProxyError::TlsConfig {
                message: format!("unsupported TLS version {:?}", other),
            }),
        }
    }
    let lo = min.map(rank).transpose()?.unwrap_or(2);
    let hi = max.map(rank).transpose()?.unwrap_or(3);
    let versions: Vec<&'static SupportedProtocolVersion> = [
        (2, &rustls::version::TLS12),
        (3, &rustls::version::TLS13),
    ]
    .iter()
    .filter(|(r, _)| (lo..=hi).contains(r))
    .map(|(_, v)| *v)
    .collect();
    if versions.is_empty() {
        return Err(ProxyError::TlsConfig {
            message: format!("empty TLS version range {:?}..{:?}", min, max),
        });
    }
    Ok(versions)
}

fn cipher_suites(names: &[String]) -> Result<Vec<rustls::SupportedCipherSuite>> {
    let mut suites = Vec::with_capacity(names.len());
    for name in names {
        let suite = crypto::default_provider()
            .cipher_suites
            .iter()
            .find(|s| format!("{:?}", s.suite()) == *name)
            .copied()
            .ok_or_else(|| ProxyError::TlsConfig {
                message: format!("unknown cipher suite {:?}", name),
            })?;
        suites.push(suite);
    }
    Ok(suites)
}

/// Builds the server config and hot resolver for a TLS listener.
///
/// The resolver is returned separately so the reload task can swap
/// certificates while the config keeps serving.
pub fn server_config(listen: &ListenConfig) -> Result<(ServerConfig, Arc<HotCertResolver>)> {
    let source = listen
        .cert_source
        .as_ref()
        .ok_or_else(|| ProxyError::TlsConfig {
            message: format!("listener {} has no cert source", listen.addr),
        })?;

    let key = load_certified_key(source)?;
    let resolver = Arc::new(HotCertResolver::new(key, listen.strict_match));

    let versions = protocol_versions(listen.tls_min.as_deref(), listen.tls_max.as_deref())?;

    let builder = if listen.tls_ciphers.is_empty() {
        ServerConfig::builder_with_protocol_versions(&versions)
    } else {
        let provider = rustls::crypto::CryptoProvider {
            cipher_suites: cipher_suites(&listen.tls_ciphers)?,
            ..crypto::default_provider()
        };
        ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&versions)
            .map_err(|e| ProxyError::TlsConfig {
                message: format!("cipher/version mismatch: {}", e),
            })?
    };

    let mut config = builder
        .with_no_client_auth()
        .with_cert_resolver(resolver.clone() as Arc<dyn ResolvesServerCert>);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok((config, resolver))
}

/// Spawns the certificate reload task for a listener. A zero poll
/// interval disables rotation.
pub fn spawn_cert_reload(
    source: CertSourceConfig,
    resolver: Arc<HotCertResolver>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if source.poll.is_zero() {
        return;
    }
    let poll = source.poll;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(source.poll) => {}
                _ = shutdown.recv() => return,
            }
            match load_certified_key(&source) {
                Ok(key) => {
                    resolver.replace(key);
                    debug!(cert = %source.cert_path, "reloaded TLS certificate");
                }
                Err(e) => {
                    warn!(cert = %source.cert_path, error = %e, "certificate reload failed");
                }
            }
        }
    });
    info!(poll = ?poll, "certificate hot reload enabled");
}

/// Client TLS config for upstream `https`/`grpcs` targets.
pub fn client_config() -> ClientConfig {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Client TLS config that skips certificate verification, selected by the
/// `tlsskipverify` target option.
pub fn insecure_client_config() -> ClientConfig {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Client TLS config for HTTP/2 (gRPC) upstreams.
pub fn h2_client_config() -> ClientConfig {
    let mut config = client_config();
    config.alpn_protocols = vec![b"h2".to_vec()];
    config
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        crypto::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_versions_range() {
        let v = protocol_versions(Some("1.2"), Some("1.3")).unwrap();
        assert_eq!(v.len(), 2);
        let v = protocol_versions(Some("1.3"), None).unwrap();
        assert_eq!(v.len(), 1);
        assert!(protocol_versions(Some("1.0"), None).is_err());
        assert!(protocol_versions(Some("1.3"), Some("1.2")).is_err());
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        assert!(cipher_suites(&["TLS_BOGUS_SUITE".to_string()]).is_err());
    }

    #[test]
    fn test_client_configs_build() {
        let c = client_config();
        assert_eq!(c.alpn_protocols, vec![b"http/1.1".to_vec()]);
        let h2 = h2_client_config();
        assert_eq!(h2.alpn_protocols, vec![b"h2".to_vec()]);
        let _ = insecure_client_config();
    }
}
