use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// All cslb environment variables carry this prefix.
pub const ENV_PREFIX: &str = "cslb_";

/// Prepended to a target name (after the port label) to form the TXT qname
/// that advertises a health-check URL.
pub const DEFAULT_HEALTH_CHECK_TXT_PREFIX: &str = "._cslb.";

/// Substring that must appear in a health-check body for the target to count
/// as healthy.
pub const DEFAULT_HEALTH_CHECK_CONTENT_OK: &str = "OK";

pub const DEFAULT_HEALTH_CHECK_FREQUENCY: Duration = Duration::from_secs(50);
pub const DEFAULT_INTERCEPT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DIAL_VETO: Duration = Duration::from_secs(60);

// The stub resolver does not surface DNS TTLs, so cache lifetimes are
// configured rather than observed.
pub const DEFAULT_NOT_FOUND_SRV_TTL: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_FOUND_SRV_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_HEALTH_TTL: Duration = Duration::from_secs(5 * 60);

// Guard rails against absurd values sneaking in from the environment.
const MIN_DURATION: Duration = Duration::from_secs(1);
const MAX_DURATION: Duration = Duration::from_secs(3600);

/// Runtime configuration for a [`crate::Balancer`].
///
/// Every field can be set directly when constructing a balancer by hand
/// (tests do exactly that); [`Config::from_env`] fills them from `cslb_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Diagnostic categories, each one letter of `cslb_options` (lowercase).
    pub debug_dial_context: bool,   // 'd'
    pub debug_health_checks: bool,  // 'h'
    pub debug_intercepts: bool,     // 'i'
    pub debug_dial_results: bool,   // 'r'
    pub debug_srv_lookups: bool,    // 's'

    // Behaviour switches (uppercase letters of `cslb_options`).
    pub disable_interception: bool,   // 'C'
    pub disable_health_checks: bool,  // 'H'
    pub allow_numeric_services: bool, // 'N'

    /// Static service label used for every intercepted dial instead of the
    /// port-to-service mapping.
    pub service_name: Option<String>,

    /// Listen address for the status web server; unset disables it.
    pub status_listen: Option<SocketAddr>,

    pub health_check_txt_prefix: String,
    pub health_check_content_ok: String,
    pub health_check_frequency: Duration,

    /// Deadline applied to an intercepted dial when the caller supplies none.
    pub intercept_timeout: Duration,

    /// How long a target is ineligible after a failed dial.
    pub dial_veto: Duration,

    pub not_found_srv_ttl: Duration,
    pub found_srv_ttl: Duration,
    pub health_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_dial_context: false,
            debug_health_checks: false,
            debug_intercepts: false,
            debug_dial_results: false,
            debug_srv_lookups: false,
            disable_interception: false,
            disable_health_checks: false,
            allow_numeric_services: false,
            service_name: None,
            status_listen: None,
            health_check_txt_prefix: DEFAULT_HEALTH_CHECK_TXT_PREFIX.to_string(),
            health_check_content_ok: DEFAULT_HEALTH_CHECK_CONTENT_OK.to_string(),
            health_check_frequency: DEFAULT_HEALTH_CHECK_FREQUENCY,
            intercept_timeout: DEFAULT_INTERCEPT_TIMEOUT,
            dial_veto: DEFAULT_DIAL_VETO,
            not_found_srv_ttl: DEFAULT_NOT_FOUND_SRV_TTL,
            found_srv_ttl: DEFAULT_FOUND_SRV_TTL,
            health_ttl: DEFAULT_HEALTH_TTL,
        }
    }
}

impl Config {
    /// Builds a configuration from the defaults overlaid with any `cslb_*`
    /// environment variables that are present and valid. Invalid or
    /// out-of-range values are ignored in favour of the default.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        for opt in env::var(format!("{ENV_PREFIX}options"))
            .unwrap_or_default()
            .chars()
        {
            match opt {
                'd' => config.debug_dial_context = true,
                'h' => config.debug_health_checks = true,
                'i' => config.debug_intercepts = true,
                'r' => config.debug_dial_results = true,
                's' => config.debug_srv_lookups = true,
                'C' => config.disable_interception = true,
                'H' => config.disable_health_checks = true,
                'N' => config.allow_numeric_services = true,
                _ => {}
            }
        }

        if let Ok(phrase) = env::var(format!("{ENV_PREFIX}hc_ok")) {
            if !phrase.is_empty() {
                config.health_check_content_ok = phrase;
            }
        }
        if let Ok(name) = env::var(format!("{ENV_PREFIX}service")) {
            if !name.is_empty() {
                config.service_name = Some(name);
            }
        }
        config.status_listen = env::var(format!("{ENV_PREFIX}listen"))
            .ok()
            .and_then(|addr| addr.parse().ok());

        config.health_check_frequency =
            duration_from_env("hc_freq", config.health_check_frequency);
        config.intercept_timeout = duration_from_env("timeout", config.intercept_timeout);
        config.dial_veto = duration_from_env("dial_veto", config.dial_veto);
        config.not_found_srv_ttl = duration_from_env("nxd_ttl", config.not_found_srv_ttl);
        config.found_srv_ttl = duration_from_env("srv_ttl", config.found_srv_ttl);
        config.health_ttl = duration_from_env("tar_ttl", config.health_ttl);

        config
    }

    /// Maps a dialed port onto the SRV service label, or an empty string when
    /// the dial should not be intercepted.
    pub(crate) fn service_for_port(&self, port: &str) -> String {
        if let Some(name) = &self.service_name {
            return name.clone();
        }
        match port {
            "80" => "http".to_string(),
            "443" => "https".to_string(),
            _ if self.allow_numeric_services => port.to_string(),
            _ => String::new(),
        }
    }
}

/// Reads a duration in whole seconds from the environment. Falls back to the
/// current value when the variable is unset, unparseable, or outside
/// [1s, 1h].
fn duration_from_env(name: &str, current: Duration) -> Duration {
    let raw = match env::var(format!("{ENV_PREFIX}{name}")) {
        Ok(raw) => raw,
        Err(_) => return current,
    };
    let secs: u64 = match raw.trim().parse() {
        Ok(secs) => secs,
        Err(_) => return current,
    };
    let parsed = Duration::from_secs(secs);
    if parsed < MIN_DURATION || parsed > MAX_DURATION {
        return current;
    }
    parsed
}
