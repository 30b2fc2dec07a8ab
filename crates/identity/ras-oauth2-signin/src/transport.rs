//! Back-channel transports and server certificate validation.

use crate::error::{OAuth2Error, OAuth2Result};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// What a [`CertificateValidator`] gets to see about a TLS server.
#[derive(Debug)]
pub struct CertificateContext<'a> {
    pub server_name: String,
    /// DER-encoded leaf certificate
    pub end_entity: &'a [u8],
    /// DER-encoded intermediates as sent by the server
    pub intermediates: Vec<&'a [u8]>,
    /// Whether standard web PKI verification accepted the chain
    pub platform_trusted: bool,
}

/// Caller-supplied server certificate policy, e.g. certificate pinning.
pub trait CertificateValidator: Send + Sync {
    fn validate(&self, context: &CertificateContext<'_>) -> bool;
}

/// Settings a transport builds its client from.
#[derive(Clone)]
pub struct TransportSettings {
    pub timeout: Duration,
    pub user_agent: String,
    pub certificate_validator: Option<Arc<dyn CertificateValidator>>,
}

/// Builds the HTTP client used for token exchange and profile fetch.
pub trait BackchannelTransport: Send + Sync {
    /// Whether [`build_client`](Self::build_client) wires a certificate validator
    /// into the TLS handshake.
    fn supports_certificate_validation(&self) -> bool;

    fn build_client(&self, settings: &TransportSettings) -> OAuth2Result<reqwest::Client>;
}

/// Standard transport. Uses platform trust unless a validator is supplied,
/// in which case every server certificate goes through the validator.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransport;

impl BackchannelTransport for DefaultTransport {
    fn supports_certificate_validation(&self) -> bool {
        true
    }

    fn build_client(&self, settings: &TransportSettings) -> OAuth2Result<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.as_str());

        let builder = match &settings.certificate_validator {
            Some(validator) => builder.use_preconfigured_tls(validating_tls_config(validator.clone())?),
            None => builder,
        };

        Ok(builder.build()?)
    }
}

/// A caller-built client. Its TLS stack is opaque, so it cannot honor a
/// certificate validator; pairing the two is a configuration error.
#[derive(Debug, Clone)]
pub struct PreconfiguredTransport {
    client: reqwest::Client,
}

impl PreconfiguredTransport {
    /// The back-channel timeout is applied per request, on top of any
    /// timeout the client was built with.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl BackchannelTransport for PreconfiguredTransport {
    fn supports_certificate_validation(&self) -> bool {
        false
    }

    fn build_client(&self, settings: &TransportSettings) -> OAuth2Result<reqwest::Client> {
        if settings.certificate_validator.is_some() {
            return Err(OAuth2Error::Configuration(
                "A certificate validator cannot be used with a preconfigured back-channel client"
                    .to_string(),
            ));
        }
        Ok(self.client.clone())
    }
}

fn validating_tls_config(validator: Arc<dyn CertificateValidator>) -> OAuth2Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = ValidatingVerifier::new(validator, provider.clone())?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| OAuth2Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(config)
}

/// Runs web PKI verification, then lets the validator make the final call.
/// Handshake signatures are always checked by web PKI.
pub(crate) struct ValidatingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    validator: Arc<dyn CertificateValidator>,
}

impl ValidatingVerifier {
    pub(crate) fn new(
        validator: Arc<dyn CertificateValidator>,
        provider: Arc<CryptoProvider>,
    ) -> OAuth2Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| OAuth2Error::Tls(e.to_string()))?;

        Ok(Self { inner, validator })
    }
}

impl fmt::Debug for ValidatingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatingVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for ValidatingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let platform = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );

        let context = CertificateContext {
            server_name: server_name.to_str().into_owned(),
            end_entity: end_entity.as_ref(),
            intermediates: intermediates.iter().map(|c| c.as_ref()).collect(),
            platform_trusted: platform.is_ok(),
        };

        if self.validator.validate(&context) {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!(
                server_name = %context.server_name,
                platform_trusted = context.platform_trusted,
                "Back-channel server certificate rejected by validator"
            );
            Err(rustls::Error::General(
                "server certificate rejected by validator".to_string(),
            ))
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
