use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::configuration::{self, ServerConfig};
use crate::server::error::Error;
use crate::server::ServerContext;

pub mod insecure;
pub mod tls;

use insecure::InsecureListener;
use tls::TlsListener;

pub enum ServiceListener {
    Insecure(InsecureListener),
    Secure(TlsListener),
}

impl ServiceListener {
    pub fn new(config: &ServerConfig, context: ServerContext) -> Result<Self, configuration::Error> {
        let listener = if let Some(tls) = &config.tls {
            ServiceListener::Secure(TlsListener::new(config, tls, context)?)
        } else {
            ServiceListener::Insecure(InsecureListener::new(config, context))
        };

        Ok(listener)
    }

    pub async fn serve(&self) -> Result<(), Error> {
        match self {
            ServiceListener::Insecure(listener) => listener.serve().await,
            ServiceListener::Secure(listener) => listener.serve().await,
        }
    }
}

fn timeouts(config: &ServerConfig) -> [Duration; 2] {
    [
        Duration::from_secs(config.query_timeout),
        Duration::from_secs(config.query_timeout_grace_period),
    ]
}

async fn build_listener(binding_address: SocketAddr) -> Result<TcpListener, Error> {
    match TcpListener::bind(binding_address).await {
        Ok(listener) => Ok(listener),
        Err(err) => {
            let msg = format!("Failed to bind to {binding_address}: {err}");
            Err(Error::Initialization(msg))
        }
    }
}

async fn accept(listener: &TcpListener) -> Result<(TcpStream, SocketAddr), Error> {
    match listener.accept().await {
        Ok((stream, remote_address)) => {
            debug!("Accepted connection from {remote_address}");
            Ok((stream, remote_address))
        }
        Err(err) => {
            let msg = format!("Failed to accept incoming connection: {err}");
            Err(Error::Execution(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_listener_with_port_zero() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = build_listener(addr).await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        assert_ne!(local_addr.port(), 0);
        assert_eq!(local_addr.ip(), addr.ip());
    }

    #[tokio::test]
    async fn test_build_listener_port_in_use() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let listener = build_listener(addr).await.unwrap();
        let actual_addr = listener.local_addr().unwrap();

        match build_listener(actual_addr).await {
            Err(Error::Initialization(msg)) => assert!(msg.contains("Failed to bind to")),
            _ => panic!("Expected Initialization error"),
        }
    }

    #[tokio::test]
    async fn test_accept_with_connection() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let listener = build_listener(addr).await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let connect_handle = tokio::spawn(async move {
            TcpStream::connect(local_addr).await.unwrap();
        });

        let (_, remote_addr) = accept(&listener).await.unwrap();
        assert!(remote_addr.port() > 0);

        connect_handle.await.unwrap();
    }

    #[test]
    fn test_timeouts() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind_address = "127.0.0.1"
            query_timeout = 5000
            query_timeout_grace_period = 100
        "#,
        )
        .unwrap();

        assert_eq!(
            timeouts(&config),
            [Duration::from_secs(5000), Duration::from_secs(100)]
        );
    }
}
