//! Proxy configuration.
//!
//! CLI arguments with environment variable fallbacks, validated before the
//! proxy binds anything.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::dns::{Action, HarcDnsRecord};
use crate::error::ProxyError;
use crate::key_management::SigningKey;

/// harc-proxy - signs upstream responses for HARC verification
#[derive(Parser, Debug, Clone)]
#[command(name = "harc-proxy")]
#[command(about = "Reverse proxy that signs responses with an ECDSA P-256 key")]
pub struct Args {
    /// Origin server responses are fetched from
    #[arg(long, env = "HARC_UPSTREAM", default_value = "http://127.0.0.1:8000")]
    pub upstream: String,

    /// PKCS#8 PEM file holding the EC P-256 signing key
    #[arg(long, env = "HARC_SIGNING_KEY")]
    pub signing_key: PathBuf,

    /// Address to listen on
    #[arg(long, env = "HARC_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(long, env = "HARC_PORT", default_value = "8080")]
    pub port: u16,

    /// Also emit X-ARC-DIGEST (troubleshooting only)
    #[arg(long, env = "HARC_EMIT_DIGEST", default_value = "false")]
    pub emit_digest: bool,

    /// Action advertised in the suggested DNS record (warn, enforce)
    #[arg(long, env = "HARC_ACTION", default_value = "enforce")]
    pub action: Action,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HARC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        let upstream = url::Url::parse(&self.upstream)
            .map_err(|e| format!("HARC_UPSTREAM is not a valid URL: {e}"))?;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err("HARC_UPSTREAM must be an http or https URL".to_string());
        }
        if upstream.host_str().is_none() {
            return Err("HARC_UPSTREAM has no host".to_string());
        }
        if self.port == 0 {
            return Err("HARC_PORT must be non-zero".to_string());
        }
        if !matches!(
            self.log_level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(format!("unknown log level: {}", self.log_level));
        }
        Ok(())
    }

    /// Read and import the signing key. Any failure here is fatal.
    pub fn load_signing_key(&self) -> Result<SigningKey, ProxyError> {
        let pem = std::fs::read_to_string(&self.signing_key).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {e}", self.signing_key.display()))
        })?;
        Ok(SigningKey::from_pkcs8_pem(&pem)?)
    }

    /// TXT value the site owner publishes for this key.
    pub fn dns_record(&self, key: &SigningKey) -> HarcDnsRecord {
        HarcDnsRecord {
            action: self.action,
            public_key_der: key.public_key_base64(),
        }
    }
}
