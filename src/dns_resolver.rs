use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dns::{self, HarcDnsRecord};
use crate::preferences::PreferenceStore;

const TXT_RECORD_TYPE: u16 = 16;

/// Plain hostname resolution, used to check that a DoH endpoint is reachable
/// before trusting its silence.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, DnsError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("resolution failed for {0}")]
    ResolutionFailed(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDnsResolver;

#[async_trait]
impl HostResolver for SystemDnsResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = hostname.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|_| DnsError::ResolutionFailed(hostname.to_string()))?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            Err(DnsError::ResolutionFailed(hostname.to_string()))
        } else {
            Ok(addrs)
        }
    }
}

/// Outcome of looking up a host's HARC record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Deployed(HarcDnsRecord),
    NotDeployed,
    /// The lookup itself could not be performed; nothing is known about the
    /// domain.
    DohFailure,
    /// Validation is administratively turned off.
    Disabled,
}

/// Seam between the verifier and whatever answers HARC lookups.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Resolution;
}

#[derive(Debug, Error)]
pub enum DohError {
    #[error("DoH endpoint {0} is not a valid URL")]
    InvalidEndpoint(String),

    #[error("DoH endpoint host {0} does not resolve")]
    EndpointUnresolvable(String),

    #[error("DoH request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DoH server answered with rcode {0}")]
    Rcode(u32),
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Status", default)]
    status: u32,
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: Option<u16>,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    #[serde(rename = "data")]
    data: String,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub request_timeout: Duration,
    pub attempts: u32,
    /// Upper bound on how long an answer is reused. Zero disables caching.
    pub max_cache_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            attempts: 2,
            max_cache_ttl: Duration::ZERO,
        }
    }
}

struct CacheEntry {
    resolution: Resolution,
    expires: Instant,
}

/// Resolves HARC TXT records through the DoH endpoint chosen in the
/// [`PreferenceStore`], using the JSON wire format.
pub struct DohResolver {
    client: reqwest::Client,
    preferences: Arc<PreferenceStore>,
    host_resolver: Arc<dyn HostResolver>,
    config: ResolverConfig,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl DohResolver {
    pub fn new(preferences: Arc<PreferenceStore>) -> Self {
        Self::with_host_resolver(preferences, Arc::new(SystemDnsResolver))
    }

    pub fn with_host_resolver(
        preferences: Arc<PreferenceStore>,
        host_resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            preferences,
            host_resolver,
            config: ResolverConfig::default(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    fn get_cached(&self, key: &str) -> Option<Resolution> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(key)?;
        if entry.expires > Instant::now() {
            Some(entry.resolution.clone())
        } else {
            None
        }
    }

    fn cache_result(&self, key: &str, resolution: &Resolution, ttl: u32) {
        let ttl = Duration::from_secs(u64::from(ttl)).min(self.config.max_cache_ttl);
        if ttl.is_zero() {
            return;
        }
        if let Ok(mut cache) = self.cache.lock() {
            let now = Instant::now();
            cache.retain(|_, entry| entry.expires > now);
            cache.insert(
                key.to_string(),
                CacheEntry {
                    resolution: resolution.clone(),
                    expires: now + ttl,
                },
            );
        }
    }

    /// Resolve `hostname`'s HARC record via `endpoint`.
    pub async fn lookup(&self, endpoint: &str, hostname: &str) -> Result<Resolution, DohError> {
        let endpoint_host = url::Url::parse(endpoint)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| DohError::InvalidEndpoint(endpoint.to_string()))?;

        if self.host_resolver.resolve(&endpoint_host).await.is_err() {
            return Err(DohError::EndpointUnresolvable(endpoint_host));
        }

        let name = dns::query_name(hostname);
        let cache_key = format!("{endpoint} {name}");
        if let Some(cached) = self.get_cached(&cache_key) {
            debug!(name = %name, "HARC record served from cache");
            return Ok(cached);
        }

        let mut last_error = None;
        for attempt in 0..self.config.attempts.max(1) {
            let response = self
                .client
                .get(endpoint)
                .query(&[("name", name.as_str()), ("type", "TXT")])
                .header("Accept", "application/dns-json")
                .timeout(self.config.request_timeout)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            let body = match response {
                Ok(resp) => resp.json::<DohResponse>().await,
                Err(e) => Err(e),
            };

            match body {
                Ok(body) => {
                    let (resolution, ttl) = interpret(body)?;
                    debug!(name = %name, ?resolution, "HARC record resolved");
                    self.cache_result(&cache_key, &resolution, ttl);
                    return Ok(resolution);
                }
                Err(e) => {
                    debug!(name = %name, attempt, error = %e, "DoH attempt failed");
                    last_error = Some(e);
                }
            }
        }

        // attempts.max(1) guarantees at least one error was recorded
        match last_error {
            Some(e) => Err(DohError::Http(e)),
            None => Err(DohError::InvalidEndpoint(endpoint.to_string())),
        }
    }
}

#[async_trait]
impl KeyResolver for DohResolver {
    async fn resolve(&self, hostname: &str) -> Resolution {
        let Some(endpoint) = self.preferences.resolver_url() else {
            return Resolution::Disabled;
        };

        match self.lookup(&endpoint, hostname).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(host = %hostname, endpoint = %endpoint, error = %e, "HARC lookup failed");
                Resolution::DohFailure
            }
        }
    }
}

const RCODE_NOERROR: u32 = 0;
const RCODE_NXDOMAIN: u32 = 3;

/// Only NXDOMAIN means "no record". SERVFAIL, REFUSED and the rest say
/// nothing about the domain and surface as a resolver failure.
fn interpret(response: DohResponse) -> Result<(Resolution, u32), DohError> {
    match response.status {
        RCODE_NOERROR => {}
        RCODE_NXDOMAIN => return Ok((Resolution::NotDeployed, 0)),
        rcode => return Err(DohError::Rcode(rcode)),
    }

    let first_txt = response
        .answer
        .unwrap_or_default()
        .into_iter()
        .find(|a| a.record_type.map_or(true, |t| t == TXT_RECORD_TYPE));

    match first_txt {
        Some(answer) => {
            let resolution = HarcDnsRecord::parse(&unquote_txt(&answer.data))
                .map_or(Resolution::NotDeployed, Resolution::Deployed);
            Ok((resolution, answer.ttl))
        }
        None => Ok((Resolution::NotDeployed, 0)),
    }
}

/// DoH JSON renders TXT data as one or more quoted character-strings, e.g.
/// `"warn;MFkw" "EwYH"`. Long keys are split across strings and must be
/// joined back together.
fn unquote_txt(data: &str) -> String {
    let data = data.trim();
    if !data.starts_with('"') {
        return data.to_string();
    }

    let mut out = String::with_capacity(data.len());
    let mut in_quotes = false;
    let mut chars = data.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            c if in_quotes => out.push(c),
            _ => {}
        }
    }
    out
}
