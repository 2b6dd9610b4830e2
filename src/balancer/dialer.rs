use std::io;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// The underlying dialer the interceptor forwards to and retries over.
/// Replaceable at construction so tests can script connection outcomes.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a connection to `address` (`host:port`). The network string is
    /// carried through from the intercepted request; TCP is the only network
    /// the balancer is installed on in practice.
    async fn dial(&self, network: &str, address: &str) -> io::Result<TcpStream>;
}

/// The production dialer.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, _network: &str, address: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
