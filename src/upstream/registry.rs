use crate::cache::PullRequest;
use crate::configuration::{RegistryConfig, DOCKER_HUB};
use crate::upstream::Error;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;
use tracing::warn;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// Connection settings for one upstream registry.
#[derive(Clone, Debug)]
pub struct UpstreamRegistry {
    pub config: RegistryConfig,
    pub client: HttpClient,
    basic_auth: Option<(String, String)>,
}

impl UpstreamRegistry {
    /// Builds the registry, reusing `shared_client` unless the configuration
    /// needs its own TLS settings.
    pub fn new(config: RegistryConfig, shared_client: &HttpClient) -> Result<Self, Error> {
        let client = if config.has_custom_tls() {
            build_client(&config)?
        } else {
            shared_client.clone()
        };

        let basic_auth = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            (Some(_), None) | (None, Some(_)) => {
                warn!(
                    "Username and password must be both provided for registry {}",
                    config.name
                );
                None
            }
            _ => None,
        };

        Ok(Self {
            config,
            client,
            basic_auth,
        })
    }

    pub fn basic_auth(&self) -> Option<&(String, String)> {
        self.basic_auth.as_ref()
    }

    /// Repository path on the upstream. Docker Hub keeps official images
    /// under `library/`.
    pub fn repository(&self, pull_request: &PullRequest) -> String {
        if self.config.name == DOCKER_HUB && pull_request.org.is_none() {
            format!("library/{}", pull_request.image)
        } else {
            pull_request.repository()
        }
    }

    pub fn base_url(&self) -> String {
        format!(
            "{}://{}",
            self.config.scheme.as_str(),
            self.config.endpoint()
        )
    }
}

/// Client trusting the platform certificate store.
pub fn default_client() -> Result<HttpClient, Error> {
    build_client(&RegistryConfig::new(""))
}

fn build_client(config: &RegistryConfig) -> Result<HttpClient, Error> {
    let tls_config = build_tls_config(config)?;

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build();

    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

fn build_tls_config(config: &RegistryConfig) -> Result<rustls::ClientConfig, Error> {
    let builder = if config.insecure_skip_verify {
        warn!(
            "TLS certificate verification disabled for registry {}",
            config.name
        );
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
    } else {
        let mut root_store = RootCertStore::empty();

        let certs = if let Some(bundle) = &config.server_ca_bundle {
            CertificateDer::pem_file_iter(bundle)?.collect::<Result<Vec<_>, _>>()?
        } else {
            rustls_native_certs::load_native_certs().certs
        };

        root_store.add_parsable_certificates(certs);
        rustls::ClientConfig::builder().with_root_certificates(root_store)
    };

    match (&config.client_certificate, &config.client_private_key) {
        (Some(cert), Some(key)) => {
            let certs = CertificateDer::pem_file_iter(cert)?.collect::<Result<Vec<_>, _>>()?;
            let key = PrivateKeyDer::from_pem_file(key)?;
            Ok(builder.with_client_auth_cert(certs, key)?)
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => {
            warn!("Client certificate and key must both be provided");
            Ok(builder.with_no_client_auth())
        }
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
