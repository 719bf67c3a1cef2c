//! Certificate verification bridging to the application
//!
//! TLS-based upstreams verify server certificates against the webpki roots;
//! when the application installed an `on_certificate_verification` callback
//! it gets the final veto after standard verification passes. The callback
//! runs outside all internal locks and a panic inside it fails the handshake
//! instead of the process.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use crate::error::DnsError;
use crate::events::{CertificateVerificationCallback, CertificateVerificationEvent, DnsProxyEvents};

/// Webpki verification plus an application veto
#[derive(Debug)]
pub struct ApplicationVerifier {
    inner: Arc<WebPkiServerVerifier>,
    callback: CallbackHolder,
}

struct CallbackHolder(CertificateVerificationCallback);

impl std::fmt::Debug for CallbackHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CertificateVerificationCallback")
    }
}

impl ApplicationVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        callback: CertificateVerificationCallback,
    ) -> Result<Self, DnsError> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| DnsError::Tls(e.to_string()))?;
        Ok(Self {
            inner,
            callback: CallbackHolder(callback),
        })
    }
}

impl ServerCertVerifier for ApplicationVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        let event = CertificateVerificationEvent {
            certificate: end_entity.as_ref().to_vec(),
            chain: intermediates.iter().map(|c| c.as_ref().to_vec()).collect(),
        };
        let callback = self.callback.0.clone();
        match catch_unwind(AssertUnwindSafe(move || callback(&event))) {
            Ok(Ok(())) => Ok(ServerCertVerified::assertion()),
            Ok(Err(reason)) => Err(rustls::Error::General(format!(
                "certificate rejected by application: {}",
                reason
            ))),
            Err(_) => Err(rustls::Error::General(
                "certificate verification callback panicked".into(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Build the client TLS configuration shared by DoT, DoH, DoQ
pub(crate) fn build_tls_config(events: &DnsProxyEvents) -> Result<rustls::ClientConfig, DnsError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| DnsError::Tls(e.to_string()))?;

    let config = match &events.on_certificate_verification {
        Some(callback) => {
            log::debug!("using application certificate verifier");
            let verifier = ApplicationVerifier::new(Arc::new(roots), provider, callback.clone())?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth()
        }
        None => {
            log::debug!("using default certificate verifier");
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    Ok(config)
}
