// DNS lookups for the balancer.
//
// The balancer only ever issues two query types: SRV records that enumerate
// the targets of a service, and TXT records that advertise per-target
// health-check URLs. The trait keeps that surface small enough to mock.

use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::warn;

/// One SRV record as returned by the resolver, before any ordering or
/// weighting is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecordData {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// The two DNS lookups the balancer performs. Replaceable at construction so
/// tests can run against canned records.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Looks up the SRV records at `name` (already in `_service._proto.domain`
    /// form). Any error is treated by the caller as "no records".
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecordData>>;

    /// Looks up the TXT records at `name`. The caller concatenates all
    /// returned strings into a health-check URL.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>>;
}

/// Production resolver backed by hickory, configured from the system's
/// resolver configuration where possible.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            warn!(error = %err, "failed to read system resolver config, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecordData>> {
        let lookup = self.resolver.srv_lookup(name).await?;
        Ok(lookup
            .iter()
            .map(|srv| SrvRecordData {
                target: srv
                    .target()
                    .to_utf8()
                    .trim_end_matches('.')
                    .to_string(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect())
    }

    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        let lookup = self.resolver.txt_lookup(name).await?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<String>()
            })
            .collect())
    }
}
