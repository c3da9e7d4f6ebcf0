use std::net::IpAddr;
use std::time::Duration;

use url::{Host, Url};

use crate::error::HttpError;

/// Limits enforced on every request issued through the HTTP capability.
///
/// Per-call options may lower these limits but never raise them.
#[derive(Debug, Clone)]
pub struct HttpPolicy {
  /// Timeout used when the script does not pass one.
  pub default_timeout: Duration,
  /// Upper bound on any requested timeout.
  pub max_timeout: Duration,
  /// Response size limit used when the script does not pass one.
  pub default_max_response_bytes: usize,
  /// Upper bound on any requested response size limit.
  pub max_response_bytes: usize,
  /// Maximum number of requests per invocation.
  pub max_requests: u32,
  pub max_redirects: usize,
  pub allowed_schemes: Vec<String>,
  /// Hosts that can never be reached. Names match case-insensitively;
  /// IP entries match the address in any spelling and are also checked
  /// against every address a name resolves to.
  pub denied_hosts: Vec<String>,
}

impl Default for HttpPolicy {
  fn default() -> Self {
    Self {
      default_timeout: Duration::from_millis(3000),
      max_timeout: Duration::from_millis(3000),
      default_max_response_bytes: 1024 * 1024,
      max_response_bytes: 1024 * 1024,
      max_requests: 20,
      max_redirects: 5,
      allowed_schemes: vec!["http".to_string(), "https".to_string()],
      denied_hosts: vec![
        "169.254.169.254".to_string(),
        "metadata.google.internal".to_string(),
        "metadata".to_string(),
      ],
    }
  }
}

impl HttpPolicy {
  /// Resolve the timeout for one call.
  pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
    requested
      .unwrap_or(self.default_timeout)
      .min(self.max_timeout)
  }

  /// Resolve the response size limit for one call.
  pub fn effective_max_response_bytes(&self, requested: Option<usize>) -> usize {
    requested
      .unwrap_or(self.default_max_response_bytes)
      .min(self.max_response_bytes)
  }

  /// Parse a URL and check it against the scheme and host lists.
  pub fn check_url(&self, raw: &str) -> Result<Url, HttpError> {
    let url = Url::parse(raw).map_err(|e| HttpError::InvalidUrl {
      url: raw.to_string(),
      message: e.to_string(),
    })?;
    self.check_parsed(&url)?;
    Ok(url)
  }

  pub(crate) fn check_parsed(&self, url: &Url) -> Result<(), HttpError> {
    let scheme = url.scheme();
    if !self.allowed_schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
      return Err(HttpError::SchemeNotAllowed {
        scheme: scheme.to_string(),
      });
    }

    let denied = match url.host() {
      Some(Host::Domain(name)) => self
        .denied_hosts
        .iter()
        .any(|denied| denied.eq_ignore_ascii_case(name)),
      Some(Host::Ipv4(ip)) => self.is_denied_address(IpAddr::V4(ip)),
      Some(Host::Ipv6(ip)) => self.is_denied_address(IpAddr::V6(ip)),
      None => {
        return Err(HttpError::InvalidUrl {
          url: url.to_string(),
          message: "missing host".to_string(),
        });
      }
    };
    if denied {
      let host = url.host_str().unwrap_or_default();
      return Err(HttpError::HostDenied {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
      });
    }

    Ok(())
  }

  /// Whether a connection to `ip` is refused.
  ///
  /// Link-local ranges (where cloud metadata services live) are always
  /// refused. IPv4-mapped IPv6 addresses are judged as the IPv4 address.
  pub fn is_denied_address(&self, ip: IpAddr) -> bool {
    let ip = ip.to_canonical();
    let link_local = match ip {
      IpAddr::V4(v4) => v4.is_link_local(),
      IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
    };
    link_local
      || self
        .denied_hosts
        .iter()
        .filter_map(|denied| {
          let denied = denied.trim_start_matches('[').trim_end_matches(']');
          denied.parse::<IpAddr>().ok()
        })
        .any(|denied| denied.to_canonical() == ip)
  }
}
