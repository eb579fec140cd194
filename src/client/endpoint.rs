//! Endpoint resolution for the machine API

use super::config::ClientConfig;

/// Port the Talos machine API (apid) listens on
pub const DEFAULT_MACHINE_API_PORT: u16 = 50000;

/// Pick the endpoints to dial for one operation
///
/// Explicit endpoints win. Otherwise the credential's embedded defaults are
/// used, and if those are empty too the target nodes are dialed directly.
pub fn resolve_endpoints(
    explicit: &[String],
    config: &ClientConfig,
    target_nodes: &[String],
) -> Vec<String> {
    let pick = |candidates: &[String]| -> Vec<String> {
        candidates
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect()
    };

    let explicit = pick(explicit);
    if !explicit.is_empty() {
        return explicit;
    }

    let embedded = pick(&config.endpoints);
    if !embedded.is_empty() {
        return embedded;
    }

    pick(target_nodes)
}

/// Normalize an endpoint address into an `https://host:port` URI
///
/// Accepts bare hosts, `host:port`, bracketed or bare IPv6 addresses and
/// full URIs.
pub fn endpoint_uri(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');

    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("https", address),
    };

    let authority = if rest.starts_with('[') {
        // [v6] or [v6]:port
        if rest.contains("]:") {
            rest.to_string()
        } else {
            format!("{rest}:{DEFAULT_MACHINE_API_PORT}")
        }
    } else if rest.matches(':').count() > 1 {
        // bare IPv6 literal
        format!("[{rest}]:{DEFAULT_MACHINE_API_PORT}")
    } else if rest.contains(':') {
        rest.to_string()
    } else {
        format!("{rest}:{DEFAULT_MACHINE_API_PORT}")
    };

    format!("{scheme}://{authority}")
}
