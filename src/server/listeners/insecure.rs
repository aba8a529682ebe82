use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::configuration::ServerConfig;
use crate::server::error::Error;
use crate::server::listeners::{accept, build_listener, timeouts};
use crate::server::{serve_request, ServerContext};

pub struct InsecureListener {
    binding_address: SocketAddr,
    context: Arc<ServerContext>,
    timeouts: Arc<[Duration; 2]>,
}

impl InsecureListener {
    pub fn new(config: &ServerConfig, context: ServerContext) -> Self {
        Self {
            binding_address: SocketAddr::new(config.bind_address, config.port),
            context: Arc::new(context),
            timeouts: Arc::new(timeouts(config)),
        }
    }

    pub async fn serve(&self) -> Result<(), Error> {
        info!("Listening on {} (non-TLS)", self.binding_address);
        let listener = build_listener(self.binding_address).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), Error> {
        loop {
            debug!("Waiting for incoming connection");
            let (tcp, remote_address) = accept(&listener).await?;

            let stream = TokioIo::new(tcp);
            tokio::spawn(Box::pin(serve_request(
                stream,
                Arc::clone(&self.context),
                Arc::clone(&self.timeouts),
                remote_address,
            )));
        }
    }
}
