use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::client::HttpConnector;
use hyper::{Body, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use tokio::sync::RwLock;
use tracing::debug;

use crate::health::cache::HealthRecord;
use crate::metrics;

pub(crate) type ProbeClient = hyper::Client<HttpsConnector<HttpConnector>, Body>;

/// Construction-time settings for probers.
pub(crate) struct ProbeParams {
    pub(crate) resolver: Arc<dyn crate::dns::DnsResolver>,
    pub(crate) client: ProbeClient,
    pub(crate) txt_prefix: String,
    pub(crate) ok_phrase: String,
    pub(crate) frequency: Duration,
    pub(crate) debug: bool,
}

/// Everything a probe worker needs, shared by all probers of one balancer.
pub(crate) struct ProberContext {
    store: Arc<RwLock<HashMap<String, HealthRecord>>>,
    params: ProbeParams,
}

impl ProberContext {
    pub(crate) fn new(
        store: Arc<RwLock<HashMap<String, HealthRecord>>>,
        params: ProbeParams,
    ) -> Self {
        Self { store, params }
    }
}

/// The probe worker for one health record.
///
/// Looks up the TXT record at `_<port><prefix><host>`; if the concatenated
/// strings form a URL, it GETs that URL periodically until the record's
/// expiry passes, keeping the record's unhealthy flag in sync with the
/// responses. A transport-level failure is terminal: the probe endpoint
/// itself is unreachable, so the target stays unhealthy until its record
/// ages out and a fresh prober starts over. A 200 response whose body lacks
/// the OK phrase is an ordinary out-of-rotation signal and the loop
/// continues.
pub(crate) async fn fetch_and_run(ctx: Arc<ProberContext>, key: String) {
    let Some((host, port)) = key.split_once(':') else {
        return;
    };
    let qname = format!("_{}{}{}", port, ctx.params.txt_prefix, host);
    let txts = match ctx.params.resolver.lookup_txt(&qname).await {
        Ok(txts) => txts,
        Err(_) => return, // no TXT, no active health check
    };
    let probe_url = txts.concat();
    if probe_url.is_empty() {
        return;
    }

    // Record the URL for the status page and capture the record's lifetime.
    let expires = {
        let mut store = ctx.store.write().await;
        let Some(record) = store.get_mut(&key) else {
            return;
        };
        record.probe_url = probe_url.clone();
        record.expires
    };

    let uri = match probe_url.parse::<Uri>() {
        Ok(uri) if uri.scheme().is_some() && uri.authority().is_some() => uri,
        _ => return, // not fetchable
    };

    // The first check runs quickly; later ones at the configured cadence.
    let mut sleep_for = Duration::from_secs(1);
    loop {
        tokio::time::sleep(sleep_for).await;
        sleep_for = ctx.params.frequency;
        let now = Instant::now();
        if expires <= now {
            return;
        }

        match ctx.params.client.get(uri.clone()).await {
            Err(err) => {
                if ctx.params.debug {
                    debug!(%key, url = %probe_url, error = %err, "health check transport failure");
                }
                metrics::HEALTH_PROBES_TOTAL.with_label_values(&["error"]).inc();
                let mut store = ctx.store.write().await;
                if let Some(record) = store.get_mut(&key) {
                    record.unhealthy = true;
                    record.last_health_check = Some(now);
                    record.last_health_check_status = err.to_string();
                }
                return;
            }
            Ok(response) => {
                let status = response.status();
                let body = match hyper::body::to_bytes(response.into_body()).await {
                    Ok(body) => body,
                    Err(err) => {
                        if ctx.params.debug {
                            debug!(%key, error = %err, "health check body read failed");
                        }
                        continue;
                    }
                };
                let ok = status == StatusCode::OK
                    && String::from_utf8_lossy(&body).contains(&ctx.params.ok_phrase);
                let label = if ok { "healthy" } else { "unhealthy" };
                metrics::HEALTH_PROBES_TOTAL.with_label_values(&[label]).inc();
                if ctx.params.debug {
                    debug!(%key, ok, status = %status, "health check result");
                }
                let mut store = ctx.store.write().await;
                let Some(record) = store.get_mut(&key) else {
                    return;
                };
                record.unhealthy = !ok;
                record.last_health_check = Some(now);
                record.last_health_check_status = status.to_string();
            }
        }
    }
}
