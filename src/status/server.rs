use std::convert::Infallible;
use std::fmt::Write as _;
use std::net::SocketAddr;

use chrono::Utc;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::balancer::Balancer;
use crate::metrics;
use crate::status::{ConfigSnapshot, StatsSnapshot, StatusSnapshot};

/// Runs the status service until the shutdown signal fires. Binding happens
/// here so an ephemeral port (`:0`) can be reported back through
/// [`Balancer::status_addr`].
pub(crate) async fn run(balancer: Balancer, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, error = %err, "status server failed to bind");
            return;
        }
    };
    let local_addr = listener.local_addr().ok();
    balancer.note_status_addr(local_addr);
    info!(addr = ?local_addr, "status server listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("status server shutting down");
                balancer.note_status_addr(None);
                return;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "status server accept failed");
                        continue;
                    }
                };
                let balancer = balancer.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(balancer.clone(), req));
                    if let Err(err) = Http::new().serve_connection(stream, service).await {
                        debug!(error = %err, "status connection error");
                    }
                });
            }
        }
    }
}

async fn handle(balancer: Balancer, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET {
        return Ok(simple(StatusCode::METHOD_NOT_ALLOWED, "GET only\n"));
    }
    let response = match req.uri().path() {
        "/" => {
            let snapshot = snapshot(&balancer).await;
            html(render_html(&snapshot))
        }
        "/status.json" => {
            let snapshot = snapshot(&balancer).await;
            match serde_json::to_string_pretty(&snapshot) {
                Ok(body) => json(body),
                Err(err) => simple(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("serialization error: {err}\n"),
                ),
            }
        }
        "/metrics" => match metrics::gather_text() {
            Ok(body) => text(body),
            Err(err) => simple(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("metrics error: {err}\n"),
            ),
        },
        _ => simple(StatusCode::NOT_FOUND, "not found\n"),
    };
    Ok(response)
}

async fn snapshot(balancer: &Balancer) -> StatusSnapshot {
    let config = balancer.config();
    let stats = balancer.stats().await;
    let started_at = balancer.started_at();
    StatusSnapshot {
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at,
        uptime_secs: (Utc::now() - started_at).num_seconds().max(0) as u64,
        config: ConfigSnapshot {
            debug_dial_context: config.debug_dial_context,
            debug_health_checks: config.debug_health_checks,
            debug_intercepts: config.debug_intercepts,
            debug_dial_results: config.debug_dial_results,
            debug_srv_lookups: config.debug_srv_lookups,
            disable_interception: config.disable_interception,
            disable_health_checks: config.disable_health_checks,
            allow_numeric_services: config.allow_numeric_services,
            service_name: config.service_name.clone(),
            health_check_txt_prefix: config.health_check_txt_prefix.clone(),
            health_check_content_ok: config.health_check_content_ok.clone(),
            health_check_frequency_secs: config.health_check_frequency.as_secs(),
            intercept_timeout_secs: config.intercept_timeout.as_secs(),
            dial_veto_secs: config.dial_veto.as_secs(),
            not_found_srv_ttl_secs: config.not_found_srv_ttl.as_secs(),
            found_srv_ttl_secs: config.found_srv_ttl.as_secs(),
            health_ttl_secs: config.health_ttl.as_secs(),
        },
        stats: StatsSnapshot {
            intercepts: stats.intercepts,
            bypasses: stats.bypasses,
            no_srv: stats.no_srv,
            selector_calls: stats.selector_calls,
            dupes_stopped: stats.dupes_stopped,
            good_dials: stats.good_dials,
            failed_dials: stats.failed_dials,
            deadlines: stats.deadlines,
            intercept_time_ms: stats.intercept_time.as_millis() as u64,
        },
        srv: balancer.srv_snapshot().await,
        health: balancer.health_snapshot().await,
    }
}

fn render_html(snapshot: &StatusSnapshot) -> String {
    let mut page = String::with_capacity(8 * 1024);
    page.push_str(
        "<html>\n<head><title>CSLB - Client Side Load Balancing - Status</title></head>\n<body>\n",
    );

    let _ = write!(
        page,
        "<h3>Global State</h3>\n<table border=1>\n\
         <tr><th align=left>Version</th><td>{}</td></tr>\n\
         <tr><th align=left>Start Time</th><td>{}</td></tr>\n\
         <tr><th align=left>Up Time</th><td align=right>{}s</td></tr>\n\
         </table>\n",
        snapshot.version,
        snapshot.started_at.format("%Y-%m-%dT%H:%M:%SZ"),
        snapshot.uptime_secs,
    );

    let c = &snapshot.config;
    let _ = write!(
        page,
        "<h3>Config</h3>\n<table border=1>\n\
         <tr><th align=left>DisableInterception</th><td align=center>{}</td></tr>\n\
         <tr><th align=left>DisableHealthChecks</th><td align=center>{}</td></tr>\n\
         <tr><th align=left>AllowNumericServices</th><td align=center>{}</td></tr>\n\
         <tr><th align=left>ServiceName</th><td>{}</td></tr>\n\
         <tr><th align=left>HealthCheckTXTPrefix</th><td>{}</td></tr>\n\
         <tr><th align=left>HealthCheckContentOk</th><td align=center>\"{}\"</td></tr>\n\
         <tr><th align=left>HealthCheckFrequency</th><td align=right>{}s</td></tr>\n\
         <tr><th align=left>InterceptTimeout</th><td align=right>{}s</td></tr>\n\
         <tr><th align=left>DialVeto</th><td align=right>{}s</td></tr>\n\
         <tr><th align=left>NotFoundSRVTTL</th><td align=right>{}s</td></tr>\n\
         <tr><th align=left>FoundSRVTTL</th><td align=right>{}s</td></tr>\n\
         <tr><th align=left>HealthTTL</th><td align=right>{}s</td></tr>\n\
         </table>\n",
        c.disable_interception,
        c.disable_health_checks,
        c.allow_numeric_services,
        c.service_name.as_deref().unwrap_or(""),
        c.health_check_txt_prefix,
        c.health_check_content_ok,
        c.health_check_frequency_secs,
        c.intercept_timeout_secs,
        c.dial_veto_secs,
        c.not_found_srv_ttl_secs,
        c.found_srv_ttl_secs,
        c.health_ttl_secs,
    );

    let s = &snapshot.stats;
    let _ = write!(
        page,
        "<h3>Statistics</h3>\n<table border=1>\n\
         <tr><th align=left>Intercepted dials</th><td align=right>{}</td></tr>\n\
         <tr><th align=left>Bypassed (host/service/config)</th><td align=right>{}</td></tr>\n\
         <tr><th align=left>SRV lookups with zero targets</th><td align=right>{}</td></tr>\n\
         <tr><th align=left>Selector calls</th><td align=right>{}</td></tr>\n\
         <tr><th align=left>All-targets-failed stops</th><td align=right>{}</td></tr>\n\
         <tr><th align=left>Good dials</th><td align=right>{}</td></tr>\n\
         <tr><th align=left>Failed dials</th><td align=right>{}</td></tr>\n\
         <tr><th align=left>Deadline expiries</th><td align=right>{}</td></tr>\n\
         <tr><th align=left>Time intercepting</th><td align=right>{}ms</td></tr>\n\
         </table>\n",
        s.intercepts,
        s.bypasses,
        s.no_srv,
        s.selector_calls,
        s.dupes_stopped,
        s.good_dials,
        s.failed_dials,
        s.deadlines,
        s.intercept_time_ms,
    );

    page.push_str(
        "<h3>SRV DNS Cache</h3>\n<table border=1>\n\
         <tr><th>Name</th><th align=right>Expires</th><th align=right>Lookups</th>\
         <th>Priority</th><th>Weight</th><th>Port</th><th>Target</th>\
         <th>GoodDials</th><th>FailedDials</th><th align=center>IsGood</th></tr>\n",
    );
    for row in &snapshot.srv {
        if row.no_records {
            let _ = write!(
                page,
                "<tr><td>{}</td><td align=right>{}s</td><td align=right>{}</td>\
                 <td colspan=7 align=center>(no records)</td></tr>\n",
                row.name, row.expires_in_secs, row.lookups,
            );
            continue;
        }
        let _ = write!(
            page,
            "<tr><td>{}</td><td align=right>{}s</td><td align=right>{}</td>\
             <td align=right>{}</td><td align=right>{}</td><td align=right>{}</td>\
             <td>{}</td><td align=right>{}</td><td align=right>{}</td><td align=center>{}</td></tr>\n",
            row.name,
            row.expires_in_secs,
            row.lookups,
            row.priority,
            row.weight,
            row.port,
            row.target,
            row.good_dials,
            row.failed_dials,
            row.is_good,
        );
    }
    page.push_str("</table>\n");

    page.push_str(
        "<h3>Target Health Cache</h3>\n<table border=1>\n\
         <tr><th>Target</th><th align=right>Expires</th><th>Good Dials</th><th>Failed Dials</th>\
         <th>Next Dial</th><th>Last Dial</th><th>IsGood</th><th>Last Dial Status</th>\
         <th>Last Health Check</th><th>Health Check URL</th><th>Last Health Status</th></tr>\n",
    );
    for row in &snapshot.health {
        let _ = write!(
            page,
            "<tr><td>{}</td><td align=right>{}s</td><td align=right>{}</td><td align=right>{}</td>\
             <td align=right>{}s</td><td align=right>{}</td><td align=center>{}</td><td>{}</td>\
             <td align=right>{}</td><td>{}</td><td>{}</td></tr>\n",
            row.target,
            row.expires_in_secs,
            row.good_dials,
            row.failed_dials,
            row.next_dial_in_secs,
            row.last_dial_ago_secs
                .map(|secs| format!("{secs}s ago"))
                .unwrap_or_default(),
            row.is_good,
            row.last_dial_status,
            row.last_health_check_ago_secs
                .map(|secs| format!("{secs}s ago"))
                .unwrap_or_default(),
            row.probe_url,
            row.last_health_check_status,
        );
    }
    page.push_str("</table>\n");

    let _ = write!(
        page,
        "<div><hr><font size=-1>Client-Side Load Balancing v{} at {}</font>\n</body></html>\n",
        snapshot.version,
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
    );
    page
}

fn html(body: String) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn json(body: String) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn text(body: String) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn simple(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(body.into())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
