//! HARC: HTTP response authentication through DNS-published keys.
//!
//! The proxy side ([`proxy`], [`signer`]) signs the exact bytes it forwards.
//! The client side ([`verifier`] and friends) looks up the site's key over
//! DNS-over-HTTPS, captures what the browser received and checks the two
//! against each other.

pub mod capture;
pub mod codec;
pub mod config;
pub mod content_policy;
pub mod core;
pub mod dns;
pub mod dns_resolver;
pub mod error;
pub mod failure_action;
pub mod key_management;
pub mod logging;
pub mod messages;
pub mod preferences;
pub mod proxy;
pub mod signer;
pub mod trust_state;
pub mod verifier;
