// Configuration for the balancer, loaded from `cslb_*` environment variables.

pub mod env_config;

pub use env_config::Config;
