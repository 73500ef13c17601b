//! TLS server configuration

use crate::util::{AnyTlsError, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ServerConfig;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::{fs::File, io::BufReader, path::Path};

impl From<rustls::Error> for AnyTlsError {
    fn from(err: rustls::Error) -> Self {
        AnyTlsError::Tls(format!("rustls error: {}", err))
    }
}

impl From<rcgen::Error> for AnyTlsError {
    fn from(err: rcgen::Error) -> Self {
        AnyTlsError::Tls(format!("rcgen error: {}", err))
    }
}

// The panel HTTP client pulls in a second rustls backend, so the process-wide
// default provider is ambiguous. Pin ours explicitly.
fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Generate a self-signed certificate for `server_name` (and localhost)
pub fn generate_key_pair(
    server_name: Option<&str>,
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let name = server_name.unwrap_or("localhost");
    let subject_alt_names = vec![name.to_string(), "localhost".to_string()];
    let certified_key = rcgen::generate_simple_self_signed(subject_alt_names)?;

    let cert_der: CertificateDer<'static> = certified_key.cert.der().to_vec().into();
    let key_der = PrivateKeyDer::Pkcs8(certified_key.signing_key.serialize_der().into());

    Ok((cert_der, key_der))
}

fn server_config_with(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Create a server TLS config with a freshly generated self-signed certificate
pub fn create_server_config() -> Result<Arc<ServerConfig>> {
    let (cert, key) = generate_key_pair(None)?;
    server_config_with(vec![cert], key)
}

/// Create a server TLS config by loading certificate/private key from disk (PEM).
pub fn create_server_config_from_files<P: AsRef<Path>>(
    cert_path: P,
    key_path: P,
) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(&cert_path).map_err(AnyTlsError::Io)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AnyTlsError::Tls(format!("failed to parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(AnyTlsError::Tls(format!(
            "no certificates found in {:?}",
            cert_path.as_ref()
        )));
    }

    let key_file = File::open(&key_path).map_err(AnyTlsError::Io)?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| AnyTlsError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| {
            AnyTlsError::Tls(format!("no private key found in {:?}", key_path.as_ref()))
        })?;

    server_config_with(certs, key)
}

/// Certificate verifier that accepts anything. Clients of an AnyTLS node
/// commonly run with verification disabled against self-signed certificates;
/// the integration tests do the same.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
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
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Create a client TLS config that skips certificate verification
pub fn create_insecure_client_config() -> Result<Arc<ClientConfig>> {
    let provider = crypto_provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();

    config
        .dangerous()
        .set_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)));

    Ok(Arc::new(config))
}
