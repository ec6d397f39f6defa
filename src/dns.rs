//! HARC DNS record conventions: where the record lives and what it says.

use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Label inserted between the subdomain and the registered domain.
pub const HARC_LABEL: &str = "_arc";

/// Enforcement policy published next to the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Warn,
    Enforce,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Warn => "warn",
            Action::Enforce => "enforce",
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(Action::Warn),
            "enforce" => Ok(Action::Enforce),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarcDnsRecord {
    pub action: Action,
    /// Base64 SPKI DER, exactly as published.
    pub public_key_der: String,
}

impl HarcDnsRecord {
    /// Parse a TXT value. `None` means the record does not describe a HARC
    /// deployment; a malformed record is never an error.
    pub fn parse(txt: &str) -> Option<Self> {
        let fields: Vec<&str> = txt.trim().split(';').map(str::trim).collect();
        let (action, key) = match fields.as_slice() {
            [key] => (Action::Warn, *key),
            [action, key] => (action.parse().ok()?, *key),
            _ => return None,
        };
        if key.is_empty() {
            return None;
        }
        Some(Self {
            action,
            public_key_der: key.to_string(),
        })
    }

    /// TXT value an operator publishes for this record.
    pub fn to_txt(&self) -> String {
        format!("{};{}", self.action.as_str(), self.public_key_der)
    }
}

/// Hostname split along the public suffix list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitHost {
    pub subdomain: String,
    pub domain: String,
}

pub fn split_host(hostname: &str) -> SplitHost {
    let host = hostname
        .trim()
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();

    if host.parse::<IpAddr>().is_ok() {
        return SplitHost {
            subdomain: String::new(),
            domain: host,
        };
    }

    match psl::domain_str(&host) {
        Some(domain) => {
            let subdomain = host
                .strip_suffix(domain)
                .unwrap_or_default()
                .trim_end_matches('.')
                .to_string();
            SplitHost {
                subdomain,
                domain: domain.to_string(),
            }
        }
        None => SplitHost {
            subdomain: String::new(),
            domain: host,
        },
    }
}

/// `<subdomain>._arc.<domain>`, or `_arc.<domain>` without a subdomain.
pub fn query_name(hostname: &str) -> String {
    let SplitHost { subdomain, domain } = split_host(hostname);
    if subdomain.is_empty() {
        format!("{HARC_LABEL}.{domain}")
    } else {
        format!("{subdomain}.{HARC_LABEL}.{domain}")
    }
}
