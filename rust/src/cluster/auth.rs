//! Shared-secret checks for calls and pipe setups.

use super::config::ClusterConfig;

fn matches_any(secret: &str, primary: Option<&str>, alternates: &[String]) -> bool {
    primary == Some(secret) || alternates.iter().any(|s| s == secret)
}

/// Cluster API secret. An absent secret passes only when none is configured.
pub fn check_api_secret(config: &ClusterConfig, secret: Option<&str>) -> bool {
    match secret {
        None => config.api_secret.is_none() && config.all_api_secrets.is_empty(),
        Some(s) => matches_any(s, config.api_secret.as_deref(), &config.all_api_secrets),
    }
}

/// Gateway submissions accept either an API secret or a gateway secret.
pub fn check_gateway_secret(config: &ClusterConfig, secret: Option<&str>) -> bool {
    match secret {
        None => {
            config.api_secret.is_none()
                && config.all_api_secrets.is_empty()
                && config.gateway_secret.is_none()
                && config.all_gateway_secrets.is_empty()
        }
        Some(s) => {
            matches_any(s, config.api_secret.as_deref(), &config.all_api_secrets)
                || matches_any(s, config.gateway_secret.as_deref(), &config.all_gateway_secrets)
        }
    }
}
