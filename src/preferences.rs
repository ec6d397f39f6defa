//! Which DoH resolver HARC lookups go through, or whether they happen at all.
//!
//! This is the only process-wide mutable setting. Every read and write goes
//! through [`PreferenceStore`]'s accessors.

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::dns_resolver::{HostResolver, SystemDnsResolver};

pub const CLOUDFLARE_DOH: &str = "https://cloudflare-dns.com/dns-query";
pub const GOOGLE_DOH: &str = "https://dns.google/resolve";
pub const QUAD9_DOH: &str = "https://dns.quad9.net:5053/dns-query";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverChoice {
    Cloudflare,
    Google,
    Quad9,
    Custom,
    Disable,
}

impl ResolverChoice {
    fn builtin_url(self) -> Option<&'static str> {
        match self {
            ResolverChoice::Cloudflare => Some(CLOUDFLARE_DOH),
            ResolverChoice::Google => Some(GOOGLE_DOH),
            ResolverChoice::Quad9 => Some(QUAD9_DOH),
            ResolverChoice::Custom | ResolverChoice::Disable => None,
        }
    }
}

impl FromStr for ResolverChoice {
    type Err = PreferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloudflare" => Ok(Self::Cloudflare),
            "google" => Ok(Self::Google),
            "quad9" => Ok(Self::Quad9),
            "custom" => Ok(Self::Custom),
            "disable" => Ok(Self::Disable),
            other => Err(PreferenceError::UnknownChoice(other.to_string())),
        }
    }
}

/// Display form of the active preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DohPreference {
    pub choice: ResolverChoice,
    #[serde(rename = "customDohServerAddr", skip_serializing_if = "Option::is_none", default)]
    pub custom_url: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreferenceError {
    #[error("unknown resolver choice: {0}")]
    UnknownChoice(String),

    #[error("custom resolver requires a URL")]
    MissingCustomUrl,

    #[error("invalid resolver URL: {0}")]
    InvalidUrl(String),

    #[error("resolver host {0} does not resolve")]
    Unresolvable(String),
}

pub struct PreferenceStore {
    resolver_url: RwLock<Option<String>>,
    host_resolver: Arc<dyn HostResolver>,
}

impl Default for PreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PreferenceStore {
    pub fn new() -> Self {
        Self::with_host_resolver(Arc::new(SystemDnsResolver))
    }

    pub fn with_host_resolver(host_resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver_url: RwLock::new(Some(CLOUDFLARE_DOH.to_string())),
            host_resolver,
        }
    }

    /// Active DoH endpoint; `None` when validation is disabled.
    pub fn resolver_url(&self) -> Option<String> {
        match self.resolver_url.read() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.resolver_url().is_none()
    }

    fn store(&self, url: Option<String>) {
        match self.resolver_url.write() {
            Ok(mut current) => *current = url,
            Err(poisoned) => *poisoned.into_inner() = url,
        }
    }

    /// Switch resolvers. A rejected custom URL leaves the previous resolver in
    /// place.
    pub async fn set_resolver(
        &self,
        choice: ResolverChoice,
        custom_url: Option<&str>,
    ) -> Result<DohPreference, PreferenceError> {
        let url = match choice {
            ResolverChoice::Disable => None,
            ResolverChoice::Custom => {
                let raw = custom_url
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or(PreferenceError::MissingCustomUrl)?;
                Some(self.validate_custom(raw).await?)
            }
            builtin => builtin.builtin_url().map(str::to_string),
        };

        info!(choice = ?choice, url = ?url, "DoH resolver preference updated");
        self.store(url);
        Ok(self.get_resolver())
    }

    async fn validate_custom(&self, raw: &str) -> Result<String, PreferenceError> {
        let parsed = url::Url::parse(raw).map_err(|_| PreferenceError::InvalidUrl(raw.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| PreferenceError::InvalidUrl(raw.to_string()))?
            .to_string();

        // Plain http is only tolerated for a resolver on this machine.
        let loopback = host == "localhost"
            || host
                .trim_matches(|c| c == '[' || c == ']')
                .parse::<std::net::IpAddr>()
                .is_ok_and(|ip| ip.is_loopback());
        match parsed.scheme() {
            "https" => {}
            "http" if loopback => {}
            _ => return Err(PreferenceError::InvalidUrl(raw.to_string())),
        }

        self.host_resolver
            .resolve(&host)
            .await
            .map_err(|_| PreferenceError::Unresolvable(host))?;
        Ok(raw.to_string())
    }

    /// Reverse-map the active endpoint to a named choice.
    pub fn get_resolver(&self) -> DohPreference {
        let Some(url) = self.resolver_url() else {
            return DohPreference {
                choice: ResolverChoice::Disable,
                custom_url: None,
            };
        };

        let builtin = [
            ResolverChoice::Cloudflare,
            ResolverChoice::Google,
            ResolverChoice::Quad9,
        ]
        .into_iter()
        .find(|c| c.builtin_url() == Some(url.as_str()));

        match builtin {
            Some(choice) => DohPreference {
                choice,
                custom_url: None,
            },
            None => DohPreference {
                choice: ResolverChoice::Custom,
                custom_url: Some(url),
            },
        }
    }
}
