use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    pub static ref DIAL_INTERCEPTS_TOTAL: IntCounter = register_int_counter!(
        "cslb_dial_intercepts_total",
        "Dial requests seen by the intercepting dialer"
    )
    .unwrap();

    pub static ref DIAL_BYPASSES_TOTAL: IntCounter = register_int_counter!(
        "cslb_dial_bypasses_total",
        "Dial requests forwarded untouched to the underlying dialer"
    )
    .unwrap();

    pub static ref SRV_LOOKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cslb_srv_lookups_total",
        "SRV cache lookups by outcome",
        &["result"]
    )
    .unwrap();

    pub static ref DIALS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cslb_dials_total",
        "Underlying dial attempts by outcome",
        &["result"]
    )
    .unwrap();

    pub static ref TARGETS_EXHAUSTED_TOTAL: IntCounter = register_int_counter!(
        "cslb_targets_exhausted_total",
        "Dials that failed after every unique target was attempted"
    )
    .unwrap();

    pub static ref DEADLINES_TOTAL: IntCounter = register_int_counter!(
        "cslb_deadlines_total",
        "Intercepted dials that hit their deadline"
    )
    .unwrap();

    pub static ref HEALTH_PROBES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cslb_health_probes_total",
        "Health probe results by verdict",
        &["result"]
    )
    .unwrap();
}

/// Renders every registered metric in the Prometheus text format, for the
/// status server's /metrics endpoint.
pub fn gather_text() -> Result<String> {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
