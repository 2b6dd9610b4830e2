//! Transparent client-side HTTP load balancing driven by DNS.
//!
//! cslb intercepts the connection-establishment step of an HTTP client and
//! redirects it to a preferred set of target hosts described by DNS SRV
//! records, per RFC 2782. Targets are chosen by priority, then by weighted
//! random selection, then by a live health view fed from dial outcomes and
//! optional active health checks advertised in TXT records. If no SRV
//! records exist for a name, cslb is benign: the dial passes straight
//! through to a plain TCP connect, so interception can be turned on and off
//! per service purely in DNS.
//!
//! # Usage
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = cslb::default_balancer().client();
//! let response = client
//!     .get("http://example.net/resource".parse()?)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`default_balancer`] returns a process-wide instance configured from
//! `cslb_*` environment variables. Programs that want their own instance
//! (or their own resolver, dialer, or RNG) construct a [`Balancer`]
//! directly and either use [`Balancer::client`] or install
//! [`InterceptConnector`] on an existing hyper client builder.
//!
//! # DNS activation
//!
//! A dial to `example.net:80` triggers an SRV lookup of
//! `_http._tcp.example.net` (port 443 maps to `_https`). Each SRV target
//! may additionally advertise a health-check URL in a TXT record at
//! `_<port>._cslb.<target>`; when present, a background prober GETs it
//! periodically and a 200 response containing the configured OK phrase
//! keeps the target in rotation.
//!
//! # Configuration
//!
//! Everything is controlled by `cslb_*` environment variables (see
//! [`Config`]): `cslb_options` holds one-letter flags (d/h/i/r/s enable
//! per-category debug logging via `tracing`; C disables interception, H
//! disables health checks, N maps arbitrary numeric ports to services),
//! `cslb_listen` enables the status web server, and the `*_ttl`,
//! `cslb_dial_veto`, `cslb_timeout`, `cslb_hc_freq`, and `cslb_hc_ok`
//! variables tune the caches, veto window, intercept deadline, and health
//! checking.

pub mod balancer;
pub mod config;
pub mod dns;
pub mod health;
pub mod metrics;
pub mod srv;
pub mod stats;
pub mod status;

mod utils;

pub use balancer::connect::InterceptConnector;
pub use balancer::dialer::{Dialer, TcpDialer};
pub use balancer::{Balancer, DialError, RandIntn};
pub use config::Config;
pub use dns::{DnsResolver, SrvRecordData, SystemResolver};
pub use health::{HealthCacheEntry, HealthRecord};
pub use srv::{Endpoint, SrvCacheEntry, SrvView};
pub use stats::InterceptStats;
pub use status::StatusSnapshot;

use lazy_static::lazy_static;

lazy_static! {
    static ref DEFAULT_BALANCER: Balancer = Balancer::from_env();
}

/// The process-wide balancer, built from the environment on first use. Its
/// background workers start lazily on the first intercepted dial, so it is
/// safe to touch before a tokio runtime exists. Programs that need isolation
/// (tests above all) should construct their own [`Balancer`] instead.
pub fn default_balancer() -> &'static Balancer {
    &DEFAULT_BALANCER
}
