use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::configuration::{self, ServerConfig, ServerTlsConfig};
use crate::server::error::Error;
use crate::server::listeners::{accept, build_listener, timeouts};
use crate::server::{serve_request, ServerContext};

pub struct TlsListener {
    binding_address: SocketAddr,
    tls_acceptor: TlsAcceptor,
    context: Arc<ServerContext>,
    timeouts: Arc<[Duration; 2]>,
}

impl TlsListener {
    pub fn new(
        config: &ServerConfig,
        tls: &ServerTlsConfig,
        context: ServerContext,
    ) -> Result<Self, configuration::Error> {
        Ok(Self {
            binding_address: SocketAddr::new(config.bind_address, config.port),
            tls_acceptor: Self::build_tls_acceptor(tls)?,
            context: Arc::new(context),
            timeouts: Arc::new(timeouts(config)),
        })
    }

    fn build_tls_acceptor(
        tls_config: &ServerTlsConfig,
    ) -> Result<TlsAcceptor, configuration::Error> {
        debug!("Detected TLS configuration");
        let server_certs = CertificateDer::pem_file_iter(&tls_config.server_certificate_bundle)?
            .collect::<Result<_, _>>()?;
        let server_key = PrivateKeyDer::from_pem_file(&tls_config.server_private_key)?;

        let server_config = if let Some(client_ca_bundle) = tls_config.client_ca_bundle.as_ref() {
            debug!("Client CA bundle detected (will serve with TLS client authentication)");
            let client_certs: Vec<CertificateDer> =
                CertificateDer::pem_file_iter(client_ca_bundle)?.collect::<Result<_, _>>()?;

            let mut client_cert_store = RootCertStore::empty();
            for client_cert in client_certs {
                client_cert_store.add(client_cert)?;
            }

            let client_cert_verifier =
                WebPkiClientVerifier::builder(Arc::new(client_cert_store)).build()?;

            rustls::ServerConfig::builder()
                .with_client_cert_verifier(client_cert_verifier)
                .with_single_cert(server_certs, server_key)?
        } else {
            debug!("No client CA bundle detected (will serve without TLS client authentication)");

            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(server_certs, server_key)?
        };

        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    pub async fn serve(&self) -> Result<(), Error> {
        info!("Listening on {} (TLS)", self.binding_address);
        let listener = build_listener(self.binding_address).await?;

        loop {
            let (tcp, remote_address) = accept(&listener).await?;

            let tls = match self.tls_acceptor.accept(tcp).await {
                Ok(tls) => tls,
                Err(error) => {
                    debug!("TLS handshake with {remote_address} failed: {error}");
                    continue;
                }
            };

            let stream = TokioIo::new(tls);
            tokio::spawn(Box::pin(serve_request(
                stream,
                Arc::clone(&self.context),
                Arc::clone(&self.timeouts),
                remote_address,
            )));
        }
    }
}
