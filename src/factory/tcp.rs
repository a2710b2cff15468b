//! Plain TCP connection factory
//!
//! Opens one TCP stream per pooled connection. Health probes check the
//! pooled socket for a pending error and then time a fresh connect to the
//! same endpoint, so the probe never writes into a stream a caller may be
//! using.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{Connection, ConnectionError, ConnectionFactory, HealthProbe};
use crate::pool::Endpoint;

/// A pooled TCP stream
#[derive(Debug)]
pub struct TcpConnection {
    /// Address the stream was opened to
    pub address: String,
    stream: Mutex<TcpStream>,
}

impl TcpConnection {
    /// Exclusive access to the underlying stream
    pub fn stream(&self) -> &Mutex<TcpStream> {
        &self.stream
    }
}

/// Factory producing [`TcpConnection`]s
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    /// Upper bound for a single connect, including health-probe connects
    connect_timeout: Duration,
    nodelay: bool,
}

impl Default for TcpConnectionFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

impl TcpConnectionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Default::default()
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    async fn connect(&self, address: &str) -> Result<TcpStream, ConnectionError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(ConnectionError::Refused(address.to_string()))
            }
            Ok(Err(e)) => Err(ConnectionError::Io(e)),
            Err(_) => Err(ConnectionError::Timeout(self.connect_timeout)),
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, ConnectionError> {
        let address = endpoint.address();
        let stream = self.connect(&address).await?;
        stream.set_nodelay(self.nodelay)?;

        debug!(endpoint = %endpoint, "Opened TCP connection");

        Ok(Arc::new(TcpConnection {
            address,
            stream: Mutex::new(stream),
        }))
    }

    async fn destroy(&self, connection: Arc<dyn Connection>) {
        let Some(tcp) = connection.downcast_ref::<TcpConnection>() else {
            return;
        };

        let mut stream = tcp.stream.lock().await;
        if let Err(e) = stream.shutdown().await {
            debug!(address = %tcp.address, error = %e, "TCP shutdown failed");
        }
    }

    async fn check_health(&self, connection: &Arc<dyn Connection>) -> HealthProbe {
        let Some(tcp) = connection.downcast_ref::<TcpConnection>() else {
            return HealthProbe::unhealthy(Duration::ZERO, "not a TCP connection");
        };

        // A socket-level error means the peer is gone, no matter what a new
        // connect says.
        {
            let stream = tcp.stream.lock().await;
            match stream.take_error() {
                Ok(None) => {}
                Ok(Some(e)) | Err(e) => {
                    return HealthProbe::unhealthy(Duration::ZERO, e.to_string());
                }
            }
        }

        let start = Instant::now();
        match self.connect(&tcp.address).await {
            Ok(_) => HealthProbe::healthy(start.elapsed()),
            Err(e) => HealthProbe::unhealthy(start.elapsed(), e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_create_probe_destroy() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let factory = TcpConnectionFactory::default();
        let conn = factory.create(&endpoint).await.unwrap();
        assert!(conn.downcast_ref::<TcpConnection>().is_some());

        let probe = factory.check_health(&conn).await;
        assert!(probe.success, "probe failed: {:?}", probe.error);

        factory.destroy(conn).await;
    }

    #[tokio::test]
    async fn test_create_refused() {
        let (listener, endpoint) = listener().await;
        drop(listener);

        let factory = TcpConnectionFactory::new(Duration::from_secs(1));
        let result = factory.create(&endpoint).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_probe_foreign_connection() {
        let factory = TcpConnectionFactory::default();
        let conn: Arc<dyn Connection> = Arc::new(String::from("not a socket"));
        let probe = factory.check_health(&conn).await;
        assert!(!probe.success);
    }
}
