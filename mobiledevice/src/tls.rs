//! TLS for lockdown and service sockets
//!
//! Devices serve self-issued certificates that no root store knows about, so
//! the server certificate is accepted as-is and the host authenticates with the
//! certificate from its pairing record.

use std::sync::Arc;

use rustls::{
    ClientConfig, DigitallySignedStruct,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use tracing::{debug, error};

use crate::{DeviceError, ServiceSocket, pair_record::PairRecord};

#[derive(Debug)]
struct AcceptDeviceCertificate;

impl ServerCertVerifier for AcceptDeviceCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn install_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }
    #[cfg(feature = "aws-lc")]
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
    let provider = rustls::crypto::ring::default_provider();
    #[cfg(any(feature = "aws-lc", feature = "ring"))]
    if let Err(e) = CryptoProvider::install_default(provider) {
        // Another thread may have won the race; that provider is as good as ours.
        error!("Failed to set crypto provider: {e:?}");
    }
}

fn client_config(pair_record: &PairRecord) -> Result<ClientConfig, DeviceError> {
    let tls_err = |e: &dyn std::fmt::Debug| DeviceError::Tls(format!("{e:?}"));

    let host_certificate = CertificateDer::from_pem_slice(&pair_record.host_certificate)
        .map_err(|e| tls_err(&e))?;
    let private_key =
        PrivateKeyDer::from_pem_slice(&pair_record.host_private_key).map_err(|e| tls_err(&e))?;

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptDeviceCertificate))
        .with_client_auth_cert(vec![host_certificate], private_key)
        .map_err(|e| tls_err(&e))?;
    config.resumption = rustls::client::Resumption::disabled();
    Ok(config)
}

/// Performs the TLS handshake over an already connected socket
pub(crate) async fn upgrade(
    socket: ServiceSocket,
    pair_record: &PairRecord,
) -> Result<ServiceSocket, DeviceError> {
    install_crypto_provider();
    let config = client_config(pair_record)?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let server_name =
        ServerName::try_from("Device").map_err(|e| DeviceError::Tls(format!("{e:?}")))?;
    let socket = connector.connect(server_name, socket).await?;
    debug!("TLS session established");
    Ok(Box::new(socket))
}
