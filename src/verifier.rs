//! Client-side verification state machine.
//!
//! For every completed response the verifier resolves the host's HARC record,
//! waits for the captured body, checks the signature and records the outcome
//! in the tab's trust state. DNS resolution and capture run independently; the
//! signature check only happens once both are in.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use http::HeaderMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CaptureRegistry, DEFAULT_MAX_CAPTURE_BYTES};
use crate::content_policy::EligibleSet;
use crate::core::observability;
use crate::dns::Action;
use crate::dns_resolver::{KeyResolver, Resolution};
use crate::failure_action::{FailureAction, FailureDispatcher, FailureNotice};
use crate::key_management::VerifyingKey;
use crate::preferences::{DohPreference, PreferenceError, PreferenceStore, ResolverChoice};
use crate::signer::HEADER_SIGNATURE;
use crate::trust_state::{TabId, TrustState, TrustTable};

/// Fixed-interval bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// How long to wait for a body to be captured.
    pub capture_wait: RetryPolicy,
    /// How long a sub-resource waits for the main document's action.
    pub action_wait: RetryPolicy,
    pub trust_capacity: NonZeroUsize,
    pub max_capture_bytes: usize,
    pub eligible: EligibleSet,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            capture_wait: RetryPolicy::default(),
            action_wait: RetryPolicy::default(),
            trust_capacity: NonZeroUsize::new(1000).unwrap_or(NonZeroUsize::MIN),
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            eligible: EligibleSet::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    MainFrame,
    SubResource,
}

/// What the verifier needs to know about a completed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub tab: TabId,
    pub url: String,
    pub kind: ResourceKind,
    pub content_type: Option<String>,
    pub signature: Option<String>,
}

impl ResponseInfo {
    pub fn from_headers(tab: TabId, url: impl Into<String>, kind: ResourceKind, headers: &HeaderMap) -> Self {
        let get = |name: http::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            tab,
            url: url.into(),
            kind,
            content_type: get(http::header::CONTENT_TYPE),
            signature: get(HEADER_SIGNATURE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub url: String,
    /// Outcome for this resource.
    pub state: TrustState,
    /// Tab state after folding this resource in.
    pub tab_state: TrustState,
    pub action: Option<FailureAction>,
    /// The tab closed or navigated away before a verdict was recorded.
    pub cancelled: bool,
}

/// What the main document of the current navigation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainPolicy {
    Pending,
    /// `None` when the main document has no HARC record.
    Resolved(Option<Action>),
}

struct TabHandle {
    cancel: CancellationToken,
    main_policy: watch::Sender<MainPolicy>,
}

impl TabHandle {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            main_policy: watch::channel(MainPolicy::Pending).0,
        }
    }
}

pub struct Verifier {
    resolver: Arc<dyn KeyResolver>,
    preferences: Arc<PreferenceStore>,
    captures: Arc<CaptureRegistry>,
    dispatcher: Arc<dyn FailureDispatcher>,
    tabs: Mutex<HashMap<TabId, TabHandle>>,
    trust: Mutex<TrustTable>,
    config: VerifierConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Verifier {
    pub fn new(
        resolver: Arc<dyn KeyResolver>,
        preferences: Arc<PreferenceStore>,
        dispatcher: Arc<dyn FailureDispatcher>,
        config: VerifierConfig,
    ) -> Self {
        Self {
            resolver,
            preferences,
            captures: Arc::new(CaptureRegistry::new(config.max_capture_bytes)),
            dispatcher,
            tabs: Mutex::new(HashMap::new()),
            trust: Mutex::new(TrustTable::new(config.trust_capacity)),
            config,
        }
    }

    /// Registry the host taps response bodies into.
    pub fn captures(&self) -> &Arc<CaptureRegistry> {
        &self.captures
    }

    pub fn preferences(&self) -> &Arc<PreferenceStore> {
        &self.preferences
    }

    /// Start a new navigation in `tab`: in-flight evaluations of the previous
    /// page are cancelled, its captured bodies dropped and its trust state
    /// forgotten.
    pub fn begin_navigation(&self, tab: TabId) -> CancellationToken {
        self.navigate(tab, None)
    }

    fn navigate(&self, tab: TabId, main_url: Option<&str>) -> CancellationToken {
        let handle = TabHandle::new();
        let token = handle.cancel.clone();

        let mut tabs = lock(&self.tabs);
        if let Some(old) = tabs.insert(tab, handle) {
            old.cancel.cancel();
        }
        lock(&self.trust).reset_tab(tab);

        // The new main document's own body may already be in flight.
        let discarded = match main_url {
            Some(url) => self.captures.discard_tab_except(tab, url),
            None => self.captures.discard_tab(tab),
        };
        debug!(tab = %tab, discarded, "Navigation started");
        token
    }

    fn tab_token(&self, tab: TabId) -> CancellationToken {
        lock(&self.tabs)
            .entry(tab)
            .or_insert_with(TabHandle::new)
            .cancel
            .clone()
    }

    /// Discard everything known about `tab`. Pending evaluations for it end
    /// without recording anything.
    pub fn close_tab(&self, tab: TabId) -> bool {
        let handle = lock(&self.tabs).remove(&tab);
        if let Some(handle) = &handle {
            handle.cancel.cancel();
        }
        let had_trust = lock(&self.trust).remove_tab(tab);
        let discarded = self.captures.discard_tab(tab);
        debug!(tab = %tab, discarded, "Tab closed");
        handle.is_some() || had_trust || discarded > 0
    }

    /// Tab-level state for the UI.
    pub fn validation_result(&self, tab: TabId) -> TrustState {
        lock(&self.trust).tab_state(tab).unwrap_or(TrustState::Unknown)
    }

    pub fn resource_state(&self, tab: TabId, url: &str) -> Option<TrustState> {
        lock(&self.trust).resource_state(tab, url)
    }

    /// Change the DoH resolver. Disabling validation also drops all recorded
    /// trust states.
    pub async fn set_preference(
        &self,
        choice: ResolverChoice,
        custom_url: Option<&str>,
    ) -> Result<DohPreference, PreferenceError> {
        let preference = self.preferences.set_resolver(choice, custom_url).await?;
        if choice == ResolverChoice::Disable {
            lock(&self.trust).clear();
            info!("HARC validation disabled, trust states cleared");
        }
        Ok(preference)
    }

    /// Evaluate one completed response.
    pub async fn evaluate(&self, info: ResponseInfo) -> Verdict {
        let token = match info.kind {
            ResourceKind::MainFrame => self.navigate(info.tab, Some(&info.url)),
            ResourceKind::SubResource => self.tab_token(info.tab),
        };

        // Whatever happens, no captured body outlives the verdict.
        let captures = Arc::clone(&self.captures);
        let _cleanup = scopeguard::guard((info.tab, info.url.clone()), move |(tab, url)| {
            captures.remove(tab, &url);
        });

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(tab = %info.tab, url = %info.url, "Evaluation cancelled");
                self.cancelled(&info)
            }
            verdict = self.run(&info, &token) => verdict,
        }
    }

    async fn run(&self, info: &ResponseInfo, token: &CancellationToken) -> Verdict {
        let content_type = info.content_type.as_deref().unwrap_or_default();
        if !self.config.eligible.is_eligible(content_type) {
            self.publish_main_policy(info, None);
            return self.finish(info, token, TrustState::IgnoredResource, None).await;
        }

        let Some(host) = url::Url::parse(&info.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
        else {
            self.publish_main_policy(info, None);
            return self.finish(info, token, TrustState::IgnoredResource, None).await;
        };

        let record = match self.resolver.resolve(&host).await {
            Resolution::Disabled => {
                self.publish_main_policy(info, None);
                return Verdict {
                    url: info.url.clone(),
                    state: TrustState::Unknown,
                    tab_state: TrustState::Unknown,
                    action: None,
                    cancelled: false,
                };
            }
            Resolution::DohFailure => {
                self.publish_main_policy(info, None);
                return self
                    .finish(info, token, TrustState::DohFailure, Some(FailureAction::ProceedWithCaution))
                    .await;
            }
            Resolution::NotDeployed => {
                self.publish_main_policy(info, None);
                return self.finish(info, token, TrustState::IgnoredDomain, None).await;
            }
            Resolution::Deployed(record) => record,
        };
        self.publish_main_policy(info, Some(record.action));

        let Some(signature) = info.signature.as_deref() else {
            warn!(url = %info.url, "HARC deployed but response carries no signature");
            return self.fail(info, token, record.action).await;
        };

        let key = match VerifyingKey::from_spki_base64(&record.public_key_der) {
            Ok(key) => key,
            Err(e) => {
                warn!(host = %host, error = %e, "Published HARC key does not import");
                return self.fail(info, token, record.action).await;
            }
        };

        let Some(captured) = self
            .captures
            .wait(info.tab, &info.url, self.config.capture_wait.budget())
            .await
        else {
            warn!(url = %info.url, "Response body never arrived for verification");
            return self.fail(info, token, record.action).await;
        };

        let verified = captured
            .views()
            .into_iter()
            .any(|view| key.verify_encoded(view, signature).is_ok());

        if verified {
            debug!(url = %info.url, "Signature verified");
            self.finish(info, token, TrustState::Trusted, None).await
        } else {
            warn!(url = %info.url, "Signature mismatch");
            self.fail(info, token, record.action).await
        }
    }

    fn publish_main_policy(&self, info: &ResponseInfo, action: Option<Action>) {
        if info.kind != ResourceKind::MainFrame {
            return;
        }
        if let Some(handle) = lock(&self.tabs).get(&info.tab) {
            handle.main_policy.send_replace(MainPolicy::Resolved(action));
        }
    }

    /// The main document's action governs the whole tab; sub-resources wait
    /// for it and only fall back to their own record when it never comes.
    async fn action_for(&self, info: &ResponseInfo, own: Action) -> Action {
        if info.kind == ResourceKind::MainFrame {
            return own;
        }

        let rx = lock(&self.tabs)
            .get(&info.tab)
            .map(|h| h.main_policy.subscribe());
        let Some(mut rx) = rx else {
            return own;
        };

        let waited = tokio::time::timeout(
            self.config.action_wait.budget(),
            rx.wait_for(|p| *p != MainPolicy::Pending),
        )
        .await;

        match waited {
            Ok(Ok(policy)) => match *policy {
                MainPolicy::Resolved(Some(main)) => main,
                _ => own,
            },
            _ => own,
        }
    }

    async fn fail(&self, info: &ResponseInfo, token: &CancellationToken, own: Action) -> Verdict {
        let action = self.action_for(info, own).await;
        self.finish(info, token, TrustState::Untrusted, Some(action.into()))
            .await
    }

    async fn finish(
        &self,
        info: &ResponseInfo,
        token: &CancellationToken,
        state: TrustState,
        action: Option<FailureAction>,
    ) -> Verdict {
        let tab_state = {
            // Same lock order as close_tab, so a closed tab never gets a
            // trust entry back.
            let tabs = lock(&self.tabs);
            if token.is_cancelled() || !tabs.contains_key(&info.tab) {
                return self.cancelled(info);
            }
            lock(&self.trust).record(info.tab, &info.url, state)
        };

        observability::record_verdict(state);
        info!(tab = %info.tab, url = %info.url, state = %state, tab_state = %tab_state, "HARC verdict");

        if let Some(action) = action {
            self.dispatcher
                .dispatch(FailureNotice {
                    tab_id: info.tab,
                    url: info.url.clone(),
                    action,
                    state,
                })
                .await;
        }

        Verdict {
            url: info.url.clone(),
            state,
            tab_state,
            action,
            cancelled: false,
        }
    }

    fn cancelled(&self, info: &ResponseInfo) -> Verdict {
        Verdict {
            url: info.url.clone(),
            state: TrustState::Unknown,
            tab_state: TrustState::Unknown,
            action: None,
            cancelled: true,
        }
    }
}
