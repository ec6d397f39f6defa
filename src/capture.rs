//! Transparent capture of response bodies on their way to the renderer.
//!
//! A [`CaptureTap`] wraps the body stream: chunks are handed on unchanged
//! while a copy accumulates. When the stream ends cleanly the copy is
//! published in the [`CaptureRegistry`], where the verifier awaits it.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::content_policy;
use crate::trust_state::TabId;

/// Bodies larger than this are passed through but never published.
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub url: String,
    /// Exact bytes received.
    pub bytes_for_digest: Bytes,
    /// Bytes after a decode/re-encode pass through the declared or assumed
    /// text encoding. Differs from `bytes_for_digest` only when the body is
    /// not valid in that encoding.
    pub bytes_as_text: Bytes,
}

impl CapturedResponse {
    pub fn new(url: impl Into<String>, body: Bytes, content_type: Option<&str>) -> Self {
        let bytes_as_text = text_view(&body, content_type);
        Self {
            url: url.into(),
            bytes_for_digest: body,
            bytes_as_text,
        }
    }

    /// Candidate signing inputs, binary-safe view first.
    pub fn views(&self) -> Vec<&[u8]> {
        let mut views = vec![self.bytes_for_digest.as_ref()];
        if self.bytes_as_text != self.bytes_for_digest {
            views.push(self.bytes_as_text.as_ref());
        }
        views
    }
}

fn text_view(body: &Bytes, content_type: Option<&str>) -> Bytes {
    let charset = content_type.and_then(content_policy::charset_of);
    match charset.as_deref() {
        None | Some("utf-8") | Some("utf8") => match String::from_utf8_lossy(body) {
            std::borrow::Cow::Borrowed(_) => body.clone(),
            std::borrow::Cow::Owned(text) => Bytes::from(text.into_bytes()),
        },
        // Other charsets are carried byte-for-byte.
        Some(_) => body.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CaptureKey {
    tab: TabId,
    url: String,
}

type Slot = watch::Sender<Option<Arc<CapturedResponse>>>;

/// Per-(tab, URL) capture slots. Each slot is written by one tap and read
/// once by the verifier, which removes it when done.
#[derive(Debug)]
pub struct CaptureRegistry {
    slots: Mutex<HashMap<CaptureKey, Slot>>,
    max_body_bytes: usize,
}

impl Default for CaptureRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPTURE_BYTES)
    }
}

impl CaptureRegistry {
    pub fn new(max_body_bytes: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_body_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CaptureKey, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn key(tab: TabId, url: &str) -> CaptureKey {
        CaptureKey {
            tab,
            url: url.to_string(),
        }
    }

    /// Mark a capture as in flight, dropping any stale body for the same URL.
    pub fn begin(&self, tab: TabId, url: &str) {
        let mut slots = self.lock();
        slots
            .entry(Self::key(tab, url))
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(None);
    }

    /// Publish a completed body into the slot opened by [`begin`] or a
    /// waiter. Bodies whose slot is already gone (verdict recorded, tab
    /// closed or navigated away) are dropped. Returns whether it was kept.
    ///
    /// [`begin`]: CaptureRegistry::begin
    pub fn publish(&self, tab: TabId, captured: CapturedResponse) -> bool {
        let slots = self.lock();
        match slots.get(&Self::key(tab, &captured.url)) {
            Some(slot) => {
                debug!(tab = %tab, url = %captured.url, bytes = captured.bytes_for_digest.len(), "Capture published");
                slot.send_replace(Some(Arc::new(captured)));
                true
            }
            None => {
                debug!(tab = %tab, url = %captured.url, "Capture has no open slot, dropped");
                false
            }
        }
    }

    /// Wait up to `timeout` for the body of `url` to be published.
    pub async fn wait(&self, tab: TabId, url: &str, timeout: Duration) -> Option<Arc<CapturedResponse>> {
        let mut rx = {
            let mut slots = self.lock();
            slots
                .entry(Self::key(tab, url))
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };

        let captured = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => value.clone(),
            // Slot removed (tab closed) or nothing arrived in time.
            Ok(Err(_)) | Err(_) => None,
        };
        captured
    }

    pub fn remove(&self, tab: TabId, url: &str) {
        self.lock().remove(&Self::key(tab, url));
    }

    /// Drop every slot belonging to `tab`. Pending waiters wake up empty.
    pub fn discard_tab(&self, tab: TabId) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|key, _| key.tab != tab);
        before - slots.len()
    }

    /// Drop every slot of `tab` except the one for `keep_url`.
    pub fn discard_tab_except(&self, tab: TabId, keep_url: &str) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|key, _| key.tab != tab || key.url == keep_url);
        before - slots.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wrap `stream` so its bytes are captured for `url` as they pass.
    pub fn tap<S>(
        self: &Arc<Self>,
        tab: TabId,
        url: impl Into<String>,
        content_type: Option<String>,
        stream: S,
    ) -> CaptureTap<S> {
        let url = url.into();
        self.begin(tab, &url);
        CaptureTap {
            inner: stream,
            registry: Arc::clone(self),
            tab,
            url,
            content_type,
            buffer: BytesMut::new(),
            state: TapState::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapState {
    Open,
    Overflowed,
    Failed,
    Done,
}

/// Pass-through stream that records what it forwards.
pub struct CaptureTap<S> {
    inner: S,
    registry: Arc<CaptureRegistry>,
    tab: TabId,
    url: String,
    content_type: Option<String>,
    buffer: BytesMut,
    state: TapState,
}

impl<S> CaptureTap<S> {
    fn finish(&mut self) {
        match self.state {
            TapState::Open => {
                let body = std::mem::take(&mut self.buffer).freeze();
                let captured = CapturedResponse::new(self.url.clone(), body, self.content_type.as_deref());
                self.registry.publish(self.tab, captured);
            }
            TapState::Overflowed => {
                warn!(tab = %self.tab, url = %self.url, "Body exceeded capture limit, not published");
            }
            TapState::Failed => {
                debug!(tab = %self.tab, url = %self.url, "Body stream failed, not published");
            }
            TapState::Done => {}
        }
        self.state = TapState::Done;
    }
}

impl<S, E> Stream for CaptureTap<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if this.state == TapState::Open {
                    if this.buffer.len() + chunk.len() > this.registry.max_body_bytes {
                        this.state = TapState::Overflowed;
                        this.buffer = BytesMut::new();
                    } else {
                        this.buffer.extend_from_slice(&chunk);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if this.state != TapState::Done {
                    this.state = TapState::Failed;
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use std::convert::Infallible;

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_tap_is_transparent_and_publishes() {
        let registry = Arc::new(CaptureRegistry::default());
        let tab = TabId(1);

        let tap = registry.tap(tab, "https://a.example/", None, chunks(&[b"<html>", b"</html>"]));
        let forwarded: Vec<Bytes> = tap.map(|c| c.unwrap()).collect().await;
        assert_eq!(forwarded, vec![Bytes::from_static(b"<html>"), Bytes::from_static(b"</html>")]);

        let captured = registry
            .wait(tab, "https://a.example/", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(captured.bytes_for_digest.as_ref(), b"<html></html>");
        assert_eq!(captured.views().len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_blocks_until_stream_completes() {
        let registry = Arc::new(CaptureRegistry::default());
        let tab = TabId(2);

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait(tab, "u", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, Infallible>>();
        let mut tap = registry.tap(tab, "u", None, rx);
        tx.unbounded_send(Ok(Bytes::from_static(b"part"))).unwrap();
        assert!(tap.next().await.is_some());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished(), "partial body must not be published");

        drop(tx);
        assert!(tap.next().await.is_none());
        let captured = waiter.await.unwrap().unwrap();
        assert_eq!(captured.bytes_for_digest.as_ref(), b"part");
    }

    #[tokio::test]
    async fn test_failed_stream_publishes_nothing() {
        let registry = Arc::new(CaptureRegistry::default());
        let tab = TabId(3);
        let items: Vec<Result<Bytes, &'static str>> = vec![Ok(Bytes::from_static(b"x")), Err("reset")];
        let tap = registry.tap(tab, "u", None, stream::iter(items));
        let _: Vec<_> = tap.collect().await;

        assert!(registry.wait(tab, "u", Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_body_is_not_published() {
        let registry = Arc::new(CaptureRegistry::new(4));
        let tab = TabId(4);
        let tap = registry.tap(tab, "u", None, chunks(&[b"abc", b"def"]));
        let forwarded: Vec<_> = tap.collect().await;
        assert_eq!(forwarded.len(), 2);

        assert!(registry.wait(tab, "u", Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_new_capture_replaces_stale_body() {
        let registry = Arc::new(CaptureRegistry::default());
        let tab = TabId(5);
        registry.begin(tab, "u");
        assert!(registry.publish(tab, CapturedResponse::new("u", Bytes::from_static(b"old"), None)));

        let (_tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, Infallible>>();
        let _tap = registry.tap(tab, "u", None, rx);

        assert!(registry.wait(tab, "u", Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_discard_tab_wakes_waiters_empty() {
        let registry = Arc::new(CaptureRegistry::default());
        let tab = TabId(6);
        registry.begin(TabId(7), "u");
        registry.publish(TabId(7), CapturedResponse::new("u", Bytes::from_static(b"keep"), None));

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait(tab, "u", Duration::from_secs(5)).await })
        };
        while registry.len() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(registry.discard_tab(tab), 1);
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_body_finishing_after_removal_is_dropped() {
        let registry = Arc::new(CaptureRegistry::default());
        let tab = TabId(8);

        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, Infallible>>();
        let mut tap = registry.tap(tab, "u", None, rx);
        tx.unbounded_send(Ok(Bytes::from_static(b"late"))).unwrap();
        assert!(tap.next().await.is_some());

        registry.remove(tab, "u");
        drop(tx);
        assert!(tap.next().await.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_publish_without_slot_is_dropped() {
        let registry = CaptureRegistry::default();
        assert!(!registry.publish(TabId(9), CapturedResponse::new("u", Bytes::from_static(b"x"), None)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_discard_tab_except_keeps_one_url() {
        let registry = CaptureRegistry::default();
        let tab = TabId(10);
        registry.begin(tab, "https://a.example/");
        registry.begin(tab, "https://a.example/old.js");
        registry.begin(TabId(11), "https://a.example/old.js");

        assert_eq!(registry.discard_tab_except(tab, "https://a.example/"), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_invalid_utf8_yields_second_view() {
        let body = Bytes::from_static(b"caf\xe9");
        let captured = CapturedResponse::new("u", body.clone(), Some("text/html; charset=utf-8"));
        assert_eq!(captured.views().len(), 2);
        assert_eq!(captured.bytes_as_text.as_ref(), "caf\u{fffd}".as_bytes());

        let latin = CapturedResponse::new("u", body, Some("text/html; charset=iso-8859-1"));
        assert_eq!(latin.views().len(), 1);
    }
}
