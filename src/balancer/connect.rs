use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::service::Service;
use hyper::{Body, Uri};
use tokio::net::TcpStream;

use crate::balancer::{Balancer, DialError};

/// A hyper connector that routes every connection through the balancer.
///
/// Installing it is the one-line enabling step for an HTTP client:
///
/// ```no_run
/// use cslb::{Balancer, Config, InterceptConnector};
///
/// let balancer = Balancer::new(Config::default());
/// let client: hyper::Client<_, hyper::Body> =
///     hyper::Client::builder().build(InterceptConnector::new(balancer));
/// ```
///
/// Destinations the balancer declines to intercept (IP literals, ports with
/// no service mapping) are dialed directly, so the connector is safe to
/// install unconditionally.
#[derive(Clone)]
pub struct InterceptConnector {
    balancer: Balancer,
}

impl InterceptConnector {
    pub fn new(balancer: Balancer) -> Self {
        Self { balancer }
    }
}

impl Service<Uri> for InterceptConnector {
    type Response = TcpStream;
    type Error = DialError;
    type Future = Pin<Box<dyn Future<Output = Result<TcpStream, DialError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let balancer = self.balancer.clone();
        Box::pin(async move {
            let host = dst
                .host()
                .ok_or_else(|| DialError::BadAddress(dst.to_string()))?
                .to_string();
            let port = dst.port_u16().unwrap_or_else(|| {
                if dst.scheme_str() == Some("https") {
                    443
                } else {
                    80
                }
            });
            // Re-bracket bare IPv6 hosts so the address parses downstream.
            let host = if host.contains(':') && !host.starts_with('[') {
                format!("[{}]", host)
            } else {
                host
            };
            balancer.dial_context("tcp", &format!("{}:{}", host, port)).await
        })
    }
}

impl Balancer {
    /// A hyper client whose connections all flow through this balancer.
    pub fn client(&self) -> hyper::Client<InterceptConnector, Body> {
        hyper::Client::builder().build(InterceptConnector::new(self.clone()))
    }
}
