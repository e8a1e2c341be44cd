use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

/// Effective proxy choice for one endpoint.
#[derive(Debug, PartialEq)]
enum ProxyResolution {
    UseProxy(String),
    /// Explicit empty proxy, or a loopback endpoint.
    ForceDirectConnect,
    /// Nothing configured; reqwest reads HTTPS_PROXY/HTTP_PROXY itself.
    None,
}

/// Host part of a URL, without userinfo or port.
fn extract_host(url: &str) -> Option<String> {
    let without_scheme = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    let authority = without_scheme.split('/').next()?;
    let host = authority.rsplit('@').next()?;
    let host = if host.starts_with('[') {
        host.split(']').next()?.trim_start_matches('[').to_string()
    } else {
        host.split(':').next()?.to_string()
    };
    Some(host)
}

fn is_loopback(host: &str) -> bool {
    let host = host.to_lowercase();
    host == "localhost" || host == "::1" || host.starts_with("127.")
}

fn resolve_proxy(proxy: Option<&str>, base_url: &str) -> ProxyResolution {
    match proxy {
        Some("") => return ProxyResolution::ForceDirectConnect,
        Some(p) => {
            // A local Ollama never goes through a proxy.
            if extract_host(base_url).map(|h| is_loopback(&h)).unwrap_or(false) {
                return ProxyResolution::ForceDirectConnect;
            }
            return ProxyResolution::UseProxy(p.to_string());
        }
        None => {}
    }
    ProxyResolution::None
}

/// Build the model HTTP client.
///
/// - `proxy`: `None` follows the environment, `Some("")` forces a direct
///   connection, anything else is used as the proxy URL unless `base_url`
///   is a loopback address.
/// - `connect_timeout`: bound on establishing the connection only; a
///   streaming completion may legitimately run for minutes.
pub fn build_http_client(proxy: Option<&str>, base_url: &str, connect_timeout: Duration) -> Client {
    let mut builder = Client::builder().connect_timeout(connect_timeout);

    match resolve_proxy(proxy, base_url) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, base_url = %base_url, "Model client using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            builder = builder.no_proxy();
        }
        ProxyResolution::None => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}
