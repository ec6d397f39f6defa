//! Request/response messages exchanged between the UI and the verifier.
//!
//! Requests are JSON objects tagged by `type`; every reply is either
//! `{"data": ...}` or `{"error": "..."}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::preferences::ResolverChoice;
use crate::trust_state::TabId;
use crate::verifier::Verifier;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    GetDohPreference,
    SetDohPreference { data: SetPreferenceData },
    #[serde(rename_all = "camelCase")]
    HarcValidationResult { tab_id: TabId },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SetPreferenceData {
    pub choice: String,
    #[serde(rename = "customDohServerAddr", default)]
    pub custom_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Data(Value),
    Error(String),
}

impl Response {
    fn data(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Response::Data(value),
            Err(e) => Response::Error(e.to_string()),
        }
    }
}

/// Parse and answer one raw message.
pub async fn handle_json(verifier: &Verifier, raw: &str) -> Response {
    match serde_json::from_str::<Request>(raw) {
        Ok(request) => handle(verifier, request).await,
        Err(e) => Response::Error(format!("malformed request: {e}")),
    }
}

pub async fn handle(verifier: &Verifier, request: Request) -> Response {
    debug!(?request, "Message received");
    match request {
        Request::GetDohPreference => Response::data(verifier.preferences().get_resolver()),
        Request::SetDohPreference { data } => {
            let choice = match data.choice.parse::<ResolverChoice>() {
                Ok(choice) => choice,
                Err(e) => return Response::Error(e.to_string()),
            };
            match verifier.set_preference(choice, data.custom_url.as_deref()).await {
                Ok(preference) => Response::data(preference),
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::HarcValidationResult { tab_id } => Response::data(verifier.validation_result(tab_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_resolver::{DnsError, HostResolver, KeyResolver, Resolution};
    use crate::failure_action::LogDispatcher;
    use crate::preferences::PreferenceStore;
    use crate::verifier::VerifierConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::net::IpAddr;
    use std::sync::Arc;

    struct NoHosts;

    #[async_trait]
    impl HostResolver for NoHosts {
        async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, DnsError> {
            Err(DnsError::ResolutionFailed(hostname.to_string()))
        }
    }

    struct NothingDeployed;

    #[async_trait]
    impl KeyResolver for NothingDeployed {
        async fn resolve(&self, _hostname: &str) -> Resolution {
            Resolution::NotDeployed
        }
    }

    fn verifier() -> Verifier {
        Verifier::new(
            Arc::new(NothingDeployed),
            Arc::new(PreferenceStore::with_host_resolver(Arc::new(NoHosts))),
            Arc::new(LogDispatcher),
            VerifierConfig::default(),
        )
    }

    fn to_json(response: Response) -> Value {
        serde_json::to_value(response).unwrap()
    }

    #[tokio::test]
    async fn test_get_preference() {
        let v = verifier();
        let reply = handle_json(&v, r#"{"type":"getDohPreference"}"#).await;
        assert_eq!(to_json(reply), json!({ "data": { "choice": "cloudflare" } }));
    }

    #[tokio::test]
    async fn test_set_preference_round_trips() {
        let v = verifier();
        let reply = handle_json(&v, r#"{"type":"setDohPreference","data":{"choice":"google"}}"#).await;
        assert_eq!(to_json(reply), json!({ "data": { "choice": "google" } }));

        let reply = handle_json(&v, r#"{"type":"getDohPreference"}"#).await;
        assert_eq!(to_json(reply), json!({ "data": { "choice": "google" } }));
    }

    #[tokio::test]
    async fn test_set_preference_reports_errors() {
        let v = verifier();
        let reply = handle_json(
            &v,
            r#"{"type":"setDohPreference","data":{"choice":"custom","customDohServerAddr":"https://doh.invalid/q"}}"#,
        )
        .await;
        assert!(matches!(reply, Response::Error(ref e) if e.contains("doh.invalid")));

        let reply = handle_json(&v, r#"{"type":"setDohPreference","data":{"choice":"opendns"}}"#).await;
        assert!(matches!(reply, Response::Error(_)));
    }

    #[tokio::test]
    async fn test_validation_result_for_unknown_tab() {
        let v = verifier();
        let reply = handle_json(&v, r#"{"type":"harcValidationResult","tabId":42}"#).await;
        assert_eq!(to_json(reply), json!({ "data": "unknown" }));
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let v = verifier();
        assert!(matches!(handle_json(&v, "{").await, Response::Error(_)));
        assert!(matches!(
            handle_json(&v, r#"{"type":"reboot"}"#).await,
            Response::Error(_)
        ));
    }
}
