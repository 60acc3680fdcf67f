//! Outbound connection setup: resolve, then try each address in order.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

use super::NetError;

/// Resolves a host and connects to the first address that accepts.
#[derive(Debug, Clone)]
pub struct Connector {
    host: String,
    port: u16,
}

impl Connector {
    /// Connector for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Target as `host:port`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect to the first reachable resolved address.
    ///
    /// No handshake is attempted when every address fails.
    #[instrument(skip(self), fields(target = %self.target()))]
    pub async fn connect(&self) -> Result<(TcpStream, SocketAddr), NetError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| NetError::Resolve {
                host: self.host.clone(),
                source,
            })?
            .collect();

        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%addr, "connected");
                    return Ok((stream, *addr));
                }
                Err(e) => warn!(%addr, error = %e, "connect attempt failed"),
            }
        }

        Err(NetError::Exhausted {
            host: self.host.clone(),
            attempts: addrs.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (_stream, addr) = Connector::new("127.0.0.1", port).connect().await.unwrap();
        assert_eq!(addr.port(), port);
    }

    #[tokio::test]
    async fn test_refused_everywhere_is_exhausted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Connector::new("127.0.0.1", port).connect().await.unwrap_err();
        assert!(matches!(err, NetError::Exhausted { attempts: 1, .. }));
    }
}
