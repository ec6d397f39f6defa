//! What the user sees when verification fails or cannot be performed.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::codec;
use crate::dns::Action;
use crate::trust_state::{TabId, TrustState};

const BLOCK_PAGE_STYLE: &str = "body{font-family:sans-serif;background:#7f0000;color:#fff;margin:0;padding:10vh 10vw}\
h1{font-size:2em}code{word-break:break-all;background:rgba(0,0,0,.3);padding:.2em .4em}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureAction {
    /// Show a banner, keep the page.
    Warn,
    /// Replace the document with the block page.
    Enforce,
    /// Verification could not run at all.
    ProceedWithCaution,
}

impl From<Action> for FailureAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Warn => FailureAction::Warn,
            Action::Enforce => FailureAction::Enforce,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
    pub tab_id: TabId,
    pub url: String,
    pub action: FailureAction,
    pub state: TrustState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RenderedNotice {
    Banner { text: String },
    BlockPage(BlockPage),
    Caution { text: String },
}

impl FailureNotice {
    pub fn render(&self) -> RenderedNotice {
        match self.action {
            FailureAction::Warn => RenderedNotice::Banner {
                text: format!(
                    "HARC warning: the content of {} could not be authenticated and may have been modified in transit.",
                    self.url
                ),
            },
            FailureAction::Enforce => RenderedNotice::BlockPage(BlockPage::new(&self.url)),
            FailureAction::ProceedWithCaution => RenderedNotice::Caution {
                text: format!(
                    "HARC could not reach its DNS-over-HTTPS resolver, so {} was not verified. Proceed with caution.",
                    self.url
                ),
            },
        }
    }
}

/// Full-page replacement for enforced failures. The policy allows nothing but
/// the page's own hashed stylesheet, so the page cannot run script, load
/// anything, or be restyled by injected markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPage {
    pub html: String,
    pub content_security_policy: String,
}

impl BlockPage {
    pub fn new(url: &str) -> Self {
        let style_hash = codec::encode_base64(&Sha256::digest(BLOCK_PAGE_STYLE.as_bytes()));
        let content_security_policy = format!(
            "default-src 'none'; style-src 'sha256-{style_hash}'; base-uri 'none'; form-action 'none'; frame-ancestors 'none'"
        );
        let html = format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
             <meta http-equiv=\"Content-Security-Policy\" content=\"{content_security_policy}\">\
             <title>Blocked by HARC</title><style>{BLOCK_PAGE_STYLE}</style></head>\
             <body><h1>This page was blocked</h1>\
             <p>The content served for <code>{}</code> does not match the signature published by its owner. \
             It may have been altered by a proxy, CDN or network in between.</p></body></html>",
            escape_html(url)
        );
        Self {
            html,
            content_security_policy,
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Delivers failure notices to whatever renders them.
#[async_trait]
pub trait FailureDispatcher: Send + Sync {
    async fn dispatch(&self, notice: FailureNotice);
}

/// Logs notices and does nothing else.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl FailureDispatcher for LogDispatcher {
    async fn dispatch(&self, notice: FailureNotice) {
        warn!(
            tab = %notice.tab_id,
            url = %notice.url,
            action = ?notice.action,
            state = %notice.state,
            "HARC failure action"
        );
    }
}

/// Queues notices for a host that polls for them.
#[derive(Debug, Default)]
pub struct NoticeQueue {
    notices: Mutex<Vec<FailureNotice>>,
}

impl NoticeQueue {
    pub fn drain(&self) -> Vec<FailureNotice> {
        match self.notices.lock() {
            Ok(mut notices) => std::mem::take(&mut *notices),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl FailureDispatcher for NoticeQueue {
    async fn dispatch(&self, notice: FailureNotice) {
        match self.notices.lock() {
            Ok(mut notices) => notices.push(notice),
            Err(poisoned) => poisoned.into_inner().push(notice),
        }
    }
}
