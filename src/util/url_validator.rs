use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// Errors that can occur during media URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("Credentials in media URL not allowed")]
    EmbeddedCredentials,
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(IpAddr),
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a media reference delivered by the listing backend.
///
/// Media URLs are handed to a decoder that fetches them without further
/// checks. Unlike the API base URL check in
/// [`HttpBackend::new`](crate::feed::HttpBackend::new), plain HTTP is
/// accepted and loopback is never accepted. Rejects:
/// - schemes other than `http`/`https`
/// - `user:pass@` credentials
/// - `localhost` and `*.localhost`
/// - loopback, private, link-local, unspecified, and unique-local addresses,
///   including IPv4-mapped IPv6 forms
///
/// # Examples
///
/// ```
/// use reelfeed::util::validate_media_url;
///
/// let url = validate_media_url("https://cdn.example.com/v/123.mp4").unwrap();
/// assert_eq!(url.host_str(), Some("cdn.example.com"));
///
/// assert!(validate_media_url("http://localhost/v.mp4").is_err());
/// assert!(validate_media_url("http://192.168.1.1/v.mp4").is_err());
/// assert!(validate_media_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_media_url(raw: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(raw)?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(UrlValidationError::UnsupportedScheme(url.scheme().to_owned()));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlValidationError::EmbeddedCredentials);
    }

    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(UrlValidationError::Localhost);
            }
        }
        Some(Host::Ipv4(ip)) => check_ipv4(ip)?,
        Some(Host::Ipv6(ip)) => check_ipv6(ip)?,
        // http(s) URLs always parse with a host
        None => return Err(url::ParseError::EmptyHost.into()),
    }

    Ok(url)
}

fn check_ipv4(ip: Ipv4Addr) -> Result<(), UrlValidationError> {
    if ip.is_loopback() {
        return Err(UrlValidationError::Localhost);
    }
    if ip.is_private() || ip.is_link_local() || ip.is_unspecified() {
        return Err(UrlValidationError::PrivateIp(IpAddr::V4(ip)));
    }
    Ok(())
}

fn check_ipv6(ip: Ipv6Addr) -> Result<(), UrlValidationError> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return check_ipv4(v4);
    }
    if ip.is_loopback() {
        return Err(UrlValidationError::Localhost);
    }
    let first = ip.segments()[0];
    let unique_local = first & 0xfe00 == 0xfc00;
    let link_local = first & 0xffc0 == 0xfe80;
    if ip.is_unspecified() || unique_local || link_local {
        return Err(UrlValidationError::PrivateIp(IpAddr::V6(ip)));
    }
    Ok(())
}
