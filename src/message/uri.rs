use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error as ThisError;
use url::Url;

/// The scheme this stack speaks.
pub const COAP_SCHEME: &str = "coap";

/// The port used when a URI does not name one.
pub const DEFAULT_PORT: u16 = 5683;

/// A `coap://` URI taken apart into the pieces a request carries as options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    /// Where the request is sent.
    pub peer: SocketAddr,
    /// The host as written, when it was a name rather than an address.
    pub host: Option<String>,
    /// The port as written, when it was not the default.
    pub port: Option<u16>,
    pub path: Vec<String>,
    pub query: Vec<String>,
}

impl ParsedUri {
    /// Parses an absolute `coap://` URI.
    ///
    /// Hosts must be address literals or `localhost`; there is no name
    /// resolution.
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let url = Url::parse(uri)?;
        if url.scheme() != COAP_SCHEME {
            return Err(UriError::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = url.host_str().ok_or(UriError::MissingHost)?;
        let (address, named) = resolve_host(host)?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let path = url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|segment| !segment.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let query = url
            .query()
            .map(|query| {
                query
                    .split('&')
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            peer: SocketAddr::new(address, port),
            host: named.then(|| host.to_ascii_lowercase()),
            port: (port != DEFAULT_PORT).then_some(port),
            path,
            query,
        })
    }
}

fn resolve_host(host: &str) -> Result<(IpAddr, bool), UriError> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(address) = literal.parse::<IpAddr>() {
        return Ok((address, false));
    }
    if host.eq_ignore_ascii_case("localhost") {
        return Ok((IpAddr::V4(Ipv4Addr::LOCALHOST), true));
    }
    Err(UriError::UnresolvableHost(host.to_string()))
}

/// Puts a URI into the form used to compare request targets: lower-case
/// scheme and host, no default port, and no trailing slash.
pub fn normalize_uri(uri: &str) -> Result<String, UriError> {
    let url = Url::parse(uri)?;
    let scheme = url.scheme().to_ascii_lowercase();
    let host = url
        .host_str()
        .ok_or(UriError::MissingHost)?
        .to_ascii_lowercase();
    let mut out = format!("{scheme}://{host}");
    match url.port() {
        Some(port) if !(scheme == COAP_SCHEME && port == DEFAULT_PORT) => {
            out.push_str(&format!(":{port}"));
        }
        _ => {}
    }
    out.push_str(url.path().trim_end_matches('/'));
    if let Some(query) = url.query().filter(|query| !query.is_empty()) {
        out.push('?');
        out.push_str(query);
    }
    Ok(out)
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("The URI could not be parsed: {0}")]
    Invalid(#[from] url::ParseError),
    #[error("The scheme {0:?} is not supported")]
    UnsupportedScheme(String),
    #[error("The URI has no host")]
    MissingHost,
    #[error("The host {0:?} is not an address literal")]
    UnresolvableHost(String),
}
