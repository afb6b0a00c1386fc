//! TLS StreamLayer implementation (client side)

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::{Result, Stream};
use crate::error::Error;

use super::StreamLayer;

/// TLS configuration
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Server name for SNI and certificate verification
    pub server_name: Option<String>,
    /// Allow insecure certificates
    pub allow_insecure: bool,
    /// ALPN protocols
    pub alpn: Vec<String>,
    /// Extra PEM files trusted as verification roots
    pub certificates: Vec<PathBuf>,
}

/// TLS client layer
pub struct TlsLayer {
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsLayer")
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsLayer {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let server_name = config
            .server_name
            .as_ref()
            .ok_or_else(|| Error::Build("TLS server name required".into()))?;

        let server_name = ServerName::try_from(server_name.clone())
            .map_err(|_| Error::Build(format!("Invalid server name: {}", server_name)))?;

        Ok(Self {
            server_name,
            connector: Self::build_connector(config)?,
        })
    }

    fn build_connector(config: &TlsConfig) -> Result<TlsConnector> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        for path in &config.certificates {
            for cert in load_certs(path)? {
                root_store
                    .add(cert)
                    .map_err(|e| Error::Build(format!("Invalid certificate {}: {}", path.display(), e)))?;
            }
        }

        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !config.alpn.is_empty() {
            tls_config.alpn_protocols = config
                .alpn
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect();
        }

        if config.allow_insecure {
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureVerifier));
        }

        Ok(TlsConnector::from(Arc::new(tls_config)))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::Build(format!("Failed to open certificate file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Build(format!("Failed to parse certificates: {}", e)))
}

#[async_trait]
impl StreamLayer for TlsLayer {
    async fn wrap_client(&self, stream: Stream) -> Result<Stream> {
        debug!("TLS handshake with {:?}", self.server_name);
        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await?;
        Ok(Box::new(tls_stream))
    }
}

/// Certificate verifier that accepts anything (`allowInsecure`)
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
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
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
