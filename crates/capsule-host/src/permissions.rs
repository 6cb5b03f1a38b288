//! Host policy for outbound requests.
//!
//! [`Permissions`] decides which destinations a hosted script may reach.
//! It is derived from [`HttpConfig`] and checked by the
//! [`FetchService`](crate::FetchService) before every script request.

use capsule_common::HttpConfig;
use tracing::warn;

use crate::http_outbound::HttpError;

/// Destinations scripts are allowed to reach.
///
/// Patterns can be:
/// - Exact match: `api.example.com`
/// - Wildcard subdomain: `*.example.com` (also matches `example.com`)
/// - All hosts: `*`
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    /// Allowed host patterns.
    pub allowed_hosts: Vec<String>,

    /// Refuse loopback, private, and link-local destinations.
    pub block_private_addresses: bool,
}

impl Permissions {
    /// Nothing is reachable.
    pub fn none() -> Self {
        Self::default()
    }

    /// Every host is reachable, private addresses included.
    pub fn all() -> Self {
        Self {
            allowed_hosts: vec!["*".to_string()],
            block_private_addresses: false,
        }
    }

    /// Policy described by the `[http]` configuration section.
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            allowed_hosts: config.allowed_hosts.clone(),
            block_private_addresses: config.block_private_addresses,
        }
    }

    /// Create a builder for constructing permissions.
    pub fn builder() -> PermissionsBuilder {
        PermissionsBuilder::default()
    }

    /// Check a request URL against the policy.
    pub fn check(&self, url: &str) -> Result<(), HttpError> {
        if !self.is_http_allowed(url) {
            warn!(uri = %url, "HTTP request blocked: not in allowed hosts");
            return Err(HttpError::PermissionDenied { url: url.to_string() });
        }

        if self.block_private_addresses && Self::is_private_address(url) {
            warn!(uri = %url, "HTTP request blocked: private address");
            return Err(HttpError::PermissionDenied { url: url.to_string() });
        }

        Ok(())
    }

    /// Returns `true` if the URL's host matches an allowed pattern.
    pub fn is_http_allowed(&self, url: &str) -> bool {
        if self.allowed_hosts.iter().any(|pattern| pattern == "*") {
            return true;
        }

        let Some(host) = url::Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
        else {
            return false;
        };

        self.allowed_hosts
            .iter()
            .any(|pattern| Self::matches_pattern(pattern, &host))
    }

    fn matches_pattern(pattern: &str, host: &str) -> bool {
        let pattern = pattern.to_lowercase();

        match pattern.strip_prefix("*.") {
            Some(domain) => host == domain || host.ends_with(&format!(".{domain}")),
            None => pattern == host,
        }
    }

    /// Returns `true` if the URL points at a loopback, private, link-local,
    /// or cloud metadata address.
    pub fn is_private_address(url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };

        match parsed.host() {
            Some(url::Host::Domain(domain)) => {
                let domain = domain.to_lowercase();
                domain == "localhost" || domain == "metadata.google.internal"
            }
            Some(url::Host::Ipv4(v4)) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_unspecified()
            }
            Some(url::Host::Ipv6(v6)) => v6.is_loopback() || v6.is_unspecified(),
            None => false,
        }
    }
}

/// Builder for [`Permissions`].
#[derive(Debug, Default)]
pub struct PermissionsBuilder {
    inner: Permissions,
}

impl PermissionsBuilder {
    /// Allow HTTP access to specific hosts.
    #[must_use]
    pub fn allow_http_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Refuse private destinations.
    #[must_use]
    pub fn block_private_addresses(mut self) -> Self {
        self.inner.block_private_addresses = true;
        self
    }

    /// Build the permissions.
    #[must_use]
    pub fn build(self) -> Permissions {
        self.inner
    }
}
